//! Android "mincrypt" public key encoding used for `AUTH` RSAPUBLICKEY
//! offers (spec.md §4.2 step 4).

use crate::error::{AdbError, Result};
use byteorder::{WriteBytesExt, LE};
use num_bigint_dig::traits::ModInverse;
use num_bigint_dig::IntoBigInt;
use num_traits::ToPrimitive;
use rsa::{BigUint, PublicKeyParts, RsaPublicKey};
use std::io::{Cursor, Write};

/// A legacy mincrypt-format RSA public key: modulus length in 32-bit words,
/// the montgomery `n0inv` and `R^2` parameters, and the exponent.
#[derive(Debug, Eq, PartialEq)]
pub struct AndroidPublicKey {
    modulus_size_words: u32,
    n0inv: u32,
    modulus: [u8; 256],
    rr: [u8; 256],
    exponent: u32,
}

impl AndroidPublicKey {
    pub fn new(public: &RsaPublicKey) -> Result<Self> {
        let n = public.n().to_bytes_le();
        if n.len() > 256 {
            return Err(AdbError::ProtocolViolation(
                "RSA modulus wider than 2048 bits is not supported by the mincrypt format".into(),
            ));
        }
        let mut modulus = [0u8; 256];
        modulus[..n.len()].copy_from_slice(&n);

        let r32 = BigUint::from(1u8) << 32;
        let n0inv = public.n() % &r32;
        let n0inv = n0inv
            .mod_inverse(&r32)
            .ok_or_else(|| AdbError::ProtocolViolation("RSA modulus has no mod-inverse".into()))?;
        let n0inv = r32
            .into_bigint()
            .map_err(|_| AdbError::ProtocolViolation("bigint conversion failed".into()))?
            - n0inv;
        let n0inv = n0inv
            .to_u32()
            .ok_or_else(|| AdbError::ProtocolViolation("n0inv overflowed u32".into()))?;

        let r256 = BigUint::from(1u8) << (256 * 8);
        let rr = (&r256 * &r256) % public.n();
        let rr_bytes = rr.to_bytes_le();
        let mut rr = [0u8; 256];
        rr[..rr_bytes.len()].copy_from_slice(&rr_bytes);

        Ok(Self {
            modulus_size_words: 64,
            n0inv,
            modulus,
            rr,
            exponent: public
                .e()
                .to_u32()
                .ok_or_else(|| AdbError::ProtocolViolation("RSA exponent overflowed u32".into()))?,
        })
    }

    /// Base64-encode the mincrypt blob, NUL-terminated and labeled, matching
    /// what a host sends in the `AUTH` RSAPUBLICKEY payload.
    pub fn encode(&self, label: &str) -> Result<String> {
        let mut buf = vec![0u8; 524];
        let mut c = Cursor::new(&mut buf);
        c.write_u32::<LE>(self.modulus_size_words)?;
        c.write_u32::<LE>(self.n0inv)?;
        c.write_all(&self.modulus)?;
        c.write_all(&self.rr)?;
        c.write_u32::<LE>(self.exponent)?;
        let mut res = base64::encode(&buf);
        if !label.is_empty() {
            res.push(' ');
            res.push_str(label);
        }
        res.push('\0');
        Ok(res)
    }

    #[cfg(test)]
    pub fn decode(encoded: &str) -> Result<Self> {
        use byteorder::ReadBytesExt;
        use std::io::Read;
        let body = encoded.split(' ').next().unwrap_or(encoded);
        let buf = base64::decode(body)
            .map_err(|e| AdbError::ProtocolViolation(format!("bad base64: {e}")))?;
        let mut c = Cursor::new(buf);
        let modulus_size_words = c.read_u32::<LE>()?;
        let n0inv = c.read_u32::<LE>()?;
        let mut modulus = [0u8; 256];
        c.read_exact(&mut modulus)?;
        let mut rr = [0u8; 256];
        c.read_exact(&mut rr)?;
        let exponent = c.read_u32::<LE>()?;
        Ok(Self {
            modulus_size_words,
            n0inv,
            modulus,
            rr,
            exponent,
        })
    }
}
