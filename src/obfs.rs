//! XPlus payload obfuscation.
//!
//! Every packet is prefixed with a random 16-byte salt; the payload is
//! XORed with `SHA-256(key || salt)` cycled over its length. This matches
//! the "obfs" option understood by deployed Hysteria servers.

use aws_lc_rs::digest;
use rand::RngCore;

pub const SALT_LEN: usize = 16;

#[derive(Clone)]
pub struct XPlusObfuscator {
    key: Vec<u8>,
}

impl XPlusObfuscator {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Writes the obfuscated form of `input` into `out`, returning the
    /// number of bytes produced, or 0 if `out` is too small.
    pub fn obfuscate(&self, input: &[u8], out: &mut [u8]) -> usize {
        let out_len = input.len() + SALT_LEN;
        if out.len() < out_len {
            return 0;
        }
        rand::rng().fill_bytes(&mut out[..SALT_LEN]);
        let keystream = self.keystream(&out[..SALT_LEN]);
        for (i, b) in input.iter().enumerate() {
            out[SALT_LEN + i] = b ^ keystream[i % keystream.len()];
        }
        out_len
    }

    /// Reverses `obfuscate`, returning the payload length, or 0 when the
    /// packet is too short to carry a salt or `out` cannot hold it.
    pub fn deobfuscate(&self, input: &[u8], out: &mut [u8]) -> usize {
        if input.len() <= SALT_LEN {
            return 0;
        }
        let out_len = input.len() - SALT_LEN;
        if out.len() < out_len {
            return 0;
        }
        let keystream = self.keystream(&input[..SALT_LEN]);
        for (i, b) in input[SALT_LEN..].iter().enumerate() {
            out[i] = b ^ keystream[i % keystream.len()];
        }
        out_len
    }

    fn keystream(&self, salt: &[u8]) -> [u8; 32] {
        let mut material = Vec::with_capacity(self.key.len() + salt.len());
        material.extend_from_slice(&self.key);
        material.extend_from_slice(salt);
        let digest = digest::digest(&digest::SHA256, &material);
        let mut keystream = [0u8; 32];
        keystream.copy_from_slice(digest.as_ref());
        keystream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let obfs = XPlusObfuscator::new(b"shared secret".to_vec());
        let payload: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();

        let mut wire = vec![0u8; payload.len() + SALT_LEN];
        let n = obfs.obfuscate(&payload, &mut wire);
        assert_eq!(n, payload.len() + SALT_LEN);
        assert_ne!(&wire[SALT_LEN..], payload.as_slice());

        let mut plain = vec![0u8; payload.len()];
        let n = obfs.deobfuscate(&wire, &mut plain);
        assert_eq!(n, payload.len());
        assert_eq!(plain, payload);
    }

    #[test]
    fn fresh_salt_per_packet() {
        let obfs = XPlusObfuscator::new(b"k".to_vec());
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        obfs.obfuscate(&[0u8; 32], &mut a);
        obfs.obfuscate(&[0u8; 32], &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_short_packets_and_small_buffers() {
        let obfs = XPlusObfuscator::new(b"k".to_vec());
        let mut out = [0u8; 64];
        assert_eq!(obfs.deobfuscate(&[0u8; SALT_LEN], &mut out), 0);
        assert_eq!(obfs.deobfuscate(&[], &mut out), 0);

        let mut tiny = [0u8; 4];
        assert_eq!(obfs.obfuscate(&[0u8; 32], &mut tiny), 0);
        assert_eq!(obfs.deobfuscate(&[1u8; 64], &mut tiny), 0);
    }
}
