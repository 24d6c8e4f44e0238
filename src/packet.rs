//! Wire packet codec (§4.1, §6). 24-byte little-endian header, then an
//! opaque payload whose length must not exceed the negotiated max.

use crate::error::{AdbError, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};

/// Version at and above which the device stops requiring the legacy
/// byte-sum checksum (open question (b) in spec.md §9).
pub const A_VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

pub const HEADER_LEN: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    Sync = 0x434e_5953,
    Connect = 0x4e58_4e43,
    Auth = 0x4854_5541,
    Open = 0x4e45_504f,
    Okay = 0x5941_4b4f,
    Close = 0x4553_4c43,
    Write = 0x4554_5257,
}

impl Command {
    pub fn from_u32(cmd: u32) -> Option<Self> {
        Some(match cmd {
            c if c == Self::Sync as u32 => Self::Sync,
            c if c == Self::Connect as u32 => Self::Connect,
            c if c == Self::Auth as u32 => Self::Auth,
            c if c == Self::Open as u32 => Self::Open,
            c if c == Self::Okay as u32 => Self::Okay,
            c if c == Self::Close as u32 => Self::Close,
            c if c == Self::Write as u32 => Self::Write,
            _ => return None,
        })
    }
}

/// Negotiated connection parameters, derived during the handshake (§3).
#[derive(Clone, Copy, Debug)]
pub struct ConnectionParams {
    pub version: u32,
    pub max_payload: u32,
}

impl ConnectionParams {
    pub fn checksum_required(&self) -> bool {
        self.version < A_VERSION_SKIP_CHECKSUM
    }
}

/// Sum of payload bytes modulo 2^32 — the legacy adb checksum, *not* CRC32
/// (spec.md §9 open question (b): implementations must match what adbd
/// actually emits, which is this byte-sum, not the zlib variant).
fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Debug, Clone)]
pub struct Packet {
    command: Command,
    arg0: u32,
    arg1: u32,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    pub fn connect(version: u32, max_payload: u32, banner: &str) -> Self {
        let mut payload = Vec::with_capacity(banner.len() + 1);
        payload.extend_from_slice(banner.as_bytes());
        payload.push(0);
        Self::new(Command::Connect, version, max_payload, payload)
    }

    pub fn auth_token_signature(sig: Vec<u8>) -> Self {
        Self::new(Command::Auth, 2, 0, sig)
    }

    pub fn auth_rsa_public_key(encoded: String) -> Self {
        Self::new(Command::Auth, 3, 0, encoded.into_bytes())
    }

    pub fn open(local_id: u32, service: &str) -> Self {
        let mut payload = Vec::with_capacity(service.len() + 1);
        payload.extend_from_slice(service.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Vec::new())
    }

    pub fn write(local_id: u32, remote_id: u32, chunk: Vec<u8>) -> Self {
        Self::new(Command::Write, local_id, remote_id, chunk)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Close, local_id, remote_id, Vec::new())
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn arg0(&self) -> u32 {
        self.arg0
    }

    pub fn arg1(&self) -> u32 {
        self.arg1
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encode header then payload into `w` as one contiguous write. A
    /// transport that must split these into two physical writes (e.g. USB
    /// bulk endpoints) may instead encode into a buffer and slice at
    /// [`HEADER_LEN`] — see [`crate::transport::UsbTransport`].
    pub fn encode(&self, w: &mut impl Write, checksum_required: bool) -> Result<()> {
        w.write_u32::<LE>(self.command as u32)?;
        w.write_u32::<LE>(self.arg0)?;
        w.write_u32::<LE>(self.arg1)?;
        w.write_u32::<LE>(self.payload.len() as u32)?;
        w.write_u32::<LE>(if checksum_required {
            checksum(&self.payload)
        } else {
            0
        })?;
        w.write_u32::<LE>(self.command as u32 ^ 0xffff_ffff)?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    pub fn encode_to_vec(&self, checksum_required: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode(&mut buf, checksum_required)?;
        Ok(buf)
    }

    /// Decode exactly one packet from `r`. `max_payload` enforces
    /// spec.md §4.1's `PayloadTooLarge` fatal error.
    pub fn decode(r: &mut impl Read, checksum_required: bool, max_payload: u32) -> Result<Self> {
        let command = r.read_u32::<LE>()?;
        let arg0 = r.read_u32::<LE>()?;
        let arg1 = r.read_u32::<LE>()?;
        let payload_len = r.read_u32::<LE>()?;
        let payload_crc = r.read_u32::<LE>()?;
        let magic = r.read_u32::<LE>()?;

        if command ^ magic != 0xffff_ffff {
            return Err(AdbError::BadMagic { command, magic });
        }

        if payload_len > max_payload {
            return Err(AdbError::PayloadTooLarge {
                len: payload_len as usize,
                max: max_payload as usize,
            });
        }

        let mut payload = vec![0u8; payload_len as usize];
        r.read_exact(&mut payload)?;

        if checksum_required {
            let actual = checksum(&payload);
            if actual != payload_crc {
                return Err(AdbError::BadChecksum {
                    expected: payload_crc,
                    actual,
                });
            }
        }

        let command = Command::from_u32(command)
            .ok_or_else(|| AdbError::ProtocolViolation(format!("unknown command 0x{command:08x}")))?;

        Ok(Self {
            command,
            arg0,
            arg1,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_no_checksum() {
        let pkt = Packet::write(1, 7, vec![0x41, 0x42, 0x43]);
        let bytes = pkt.encode_to_vec(false).unwrap();
        let decoded = Packet::decode(&mut &bytes[..], false, 1 << 20).unwrap();
        assert_eq!(decoded.command(), Command::Write);
        assert_eq!(decoded.arg0(), 1);
        assert_eq!(decoded.arg1(), 7);
        assert_eq!(decoded.payload(), &[0x41, 0x42, 0x43]);
    }

    #[test]
    fn round_trip_with_checksum() {
        let pkt = Packet::write(1, 7, vec![1, 2, 3, 4, 5]);
        let bytes = pkt.encode_to_vec(true).unwrap();
        let decoded = Packet::decode(&mut &bytes[..], true, 1 << 20).unwrap();
        assert_eq!(decoded.payload(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let pkt = Packet::write(1, 7, vec![1, 2, 3]);
        let mut bytes = pkt.encode_to_vec(true).unwrap();
        // corrupt the checksum field
        bytes[16] ^= 0xff;
        let err = Packet::decode(&mut &bytes[..], true, 1 << 20).unwrap_err();
        assert!(matches!(err, AdbError::BadChecksum { .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let pkt = Packet::write(1, 7, vec![]);
        let mut bytes = pkt.encode_to_vec(false).unwrap();
        bytes[20] ^= 0xff;
        let err = Packet::decode(&mut &bytes[..], false, 1 << 20).unwrap_err();
        assert!(matches!(err, AdbError::BadMagic { .. }));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pkt = Packet::write(1, 7, vec![0u8; 100]);
        let bytes = pkt.encode_to_vec(false).unwrap();
        let err = Packet::decode(&mut &bytes[..], false, 10).unwrap_err();
        assert!(matches!(err, AdbError::PayloadTooLarge { .. }));
    }

    #[test]
    fn every_command_satisfies_magic_invariant() {
        for cmd in [
            Command::Sync,
            Command::Connect,
            Command::Auth,
            Command::Open,
            Command::Okay,
            Command::Close,
            Command::Write,
        ] {
            assert_eq!(cmd as u32 ^ (cmd as u32 ^ 0xffff_ffff), 0xffff_ffff);
        }
    }

    #[test]
    fn checksum_required_is_version_gated() {
        let old = ConnectionParams {
            version: 0x0100_0000,
            max_payload: 4096,
        };
        let new = ConnectionParams {
            version: A_VERSION_SKIP_CHECKSUM,
            max_payload: 4096,
        };
        assert!(old.checksum_required());
        assert!(!new.checksum_required());
    }
}
