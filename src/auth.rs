//! Authenticator (component B, spec.md §4.2): banner exchange, token
//! signing, RSA public-key offer.

use crate::error::{AdbError, Result};
use crate::keys::KeyStore;
use crate::packet::{Command, ConnectionParams, Packet};
use crate::pubkey::AndroidPublicKey;
use crate::transport::Transport;
use rsa::{Hash, PaddingScheme, RsaPublicKey};

/// Protocol version this crate offers; `A_VERSION_SKIP_CHECKSUM` (see
/// packet.rs), the newest version this crate speaks.
pub const VERSION: u32 = crate::packet::A_VERSION_SKIP_CHECKSUM;
/// Default payload cap offered in `CNXN`; the negotiated value is the min
/// of this and the peer's own offer (spec.md §4.2 step 2).
pub const MAX_PAYLOAD: u32 = 1 << 20;

/// Outcome of a successful handshake: negotiated params plus the peer's
/// banner (spec.md §3 "Connection state").
#[derive(Debug, Clone)]
pub struct Handshake {
    pub params: ConnectionParams,
    pub peer_banner: String,
}

/// Run the handshake exactly once, before any socket is opened (spec.md
/// §4.2 preamble). `local_banner` is typically `"host::features=shell_v2,cmd"`
/// or similar feature-advertising string.
pub fn connect(
    transport: &mut dyn Transport,
    keys: &KeyStore,
    local_banner: &str,
) -> Result<Handshake> {
    transport.send(&Packet::connect(VERSION, MAX_PAYLOAD, local_banner), false)?;

    let mut key_index = 0usize;
    loop {
        // Before the peer's CNXN arrives we don't yet know whether it wants
        // the checksum; assume required (pre-SKIP_CHECKSUM) until told
        // otherwise — matches every adbd in practice, which sends CNXN
        // un-checksummed regardless.
        let packet = transport.recv(false, MAX_PAYLOAD)?;
        match packet.command() {
            Command::Connect => {
                let version = packet.arg0();
                let max_payload = packet.arg1().min(MAX_PAYLOAD);
                let peer_banner = String::from_utf8_lossy(packet.payload()).into_owned();
                log::debug!(
                    "handshake ok: banner = {peer_banner}, version = 0x{version:08x}, max_payload = 0x{max_payload:08x}"
                );
                return Ok(Handshake {
                    params: ConnectionParams {
                        version,
                        max_payload,
                    },
                    peer_banner,
                });
            }
            Command::Auth if packet.arg0() == 1 => {
                // TOKEN: sign with the next key, or fall back to offering
                // our public key once keys are exhausted (spec.md §4.2
                // steps 3-4).
                if let Some(key) = keys.keys().get(key_index) {
                    let padding = PaddingScheme::new_pkcs1v15_sign(Some(Hash::SHA1));
                    let signature = key
                        .sign(padding, packet.payload())
                        .map_err(|e| AdbError::ProtocolViolation(format!("RSA sign failed: {e}")))?;
                    transport.send(&Packet::auth_token_signature(signature), false)?;
                    key_index += 1;
                } else if !keys.keys().is_empty() {
                    let public = RsaPublicKey::from(&keys.keys()[0]);
                    let encoded = AndroidPublicKey::new(&public)?.encode("host::")?;
                    transport.send(&Packet::auth_rsa_public_key(encoded), false)?;
                    // The device now prompts the user; wait for the next
                    // reply (CNXN on accept, transport EOF on reject).
                } else {
                    return Err(AdbError::NoKeys);
                }
            }
            Command::Auth => {
                return Err(AdbError::ProtocolViolation(format!(
                    "unexpected AUTH arg0={}",
                    packet.arg0()
                )));
            }
            other => {
                return Err(AdbError::ProtocolViolation(format!(
                    "unexpected command {other:?} during handshake"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    #[test]
    fn handshake_without_auth() {
        crate::testutil::init_logging();
        let (mut host, device) = MockTransport::pair();
        let keys = KeyStore::new(vec![]);

        let handle = std::thread::spawn(move || connect(&mut host, &keys, "host::"));

        let opening = device.recv_raw(false, MAX_PAYLOAD).unwrap();
        assert_eq!(opening.command(), Command::Connect);
        assert_eq!(opening.arg0(), VERSION);

        device
            .send_raw(&Packet::connect(VERSION, 1 << 18, "device::ro.product=x"), false)
            .unwrap();

        let result = handle.join().unwrap().unwrap();
        assert_eq!(result.params.max_payload, 1 << 18);
        assert_eq!(result.peer_banner, "device::ro.product=x");
    }

    #[test]
    fn handshake_with_token_auth() {
        crate::testutil::init_logging();
        let (mut host, device) = MockTransport::pair();
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let keys = KeyStore::new(vec![key]);

        let handle = std::thread::spawn(move || connect(&mut host, &keys, "host::"));

        let _connect_pkt = device.recv_raw(false, MAX_PAYLOAD).unwrap();
        let token = vec![0x42u8; 20];
        device
            .send_raw(&Packet::new(Command::Auth, 1, 0, token), false)
            .unwrap();

        let sig_pkt = device.recv_raw(false, MAX_PAYLOAD).unwrap();
        assert_eq!(sig_pkt.command(), Command::Auth);
        assert_eq!(sig_pkt.arg0(), 2);
        assert_eq!(sig_pkt.payload().len(), 256);

        device
            .send_raw(&Packet::connect(VERSION, MAX_PAYLOAD, "device::"), false)
            .unwrap();

        let result = handle.join().unwrap().unwrap();
        assert_eq!(result.peer_banner, "device::");
    }

    #[test]
    fn no_keys_and_token_demanded_fails() {
        let (mut host, device) = MockTransport::pair();
        let keys = KeyStore::new(vec![]);

        let handle = std::thread::spawn(move || connect(&mut host, &keys, "host::"));
        let _ = device.recv_raw(false, MAX_PAYLOAD).unwrap();
        device
            .send_raw(&Packet::new(Command::Auth, 1, 0, vec![0u8; 20]), false)
            .unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, AdbError::NoKeys));
    }
}
