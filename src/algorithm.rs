//! PIV and vendor-extension algorithm identifiers.

use crate::error::{PivError, PivResult};

/// An on-card cryptographic algorithm, identified by its PIV wire value.
///
/// `EccP256Sha1` and `EccP256Sha256` are YubiKey pseudo-algorithms: the
/// caller hands over the raw message and the applet hashes it on-card
/// before signing, so [`AlgorithmId::hashes_on_card`] must be consulted by
/// anything that would otherwise pre-hash the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmId {
    ThreeDes,
    Rsa1024,
    Rsa2048,
    Aes128,
    Aes192,
    Aes256,
    EccP256,
    EccP384,
    EccP256Sha1,
    EccP256Sha256,
}

impl AlgorithmId {
    pub fn wire_id(self) -> u8 {
        match self {
            AlgorithmId::ThreeDes => 0x03,
            AlgorithmId::Rsa1024 => 0x06,
            AlgorithmId::Rsa2048 => 0x07,
            AlgorithmId::Aes128 => 0x08,
            AlgorithmId::Aes192 => 0x0A,
            AlgorithmId::Aes256 => 0x0C,
            AlgorithmId::EccP256 => 0x11,
            AlgorithmId::EccP384 => 0x14,
            AlgorithmId::EccP256Sha1 => 0xF0,
            AlgorithmId::EccP256Sha256 => 0xF1,
        }
    }

    pub fn from_wire_id(id: u8) -> PivResult<Self> {
        Ok(match id {
            0x03 => AlgorithmId::ThreeDes,
            0x06 => AlgorithmId::Rsa1024,
            0x07 => AlgorithmId::Rsa2048,
            0x08 => AlgorithmId::Aes128,
            0x0A => AlgorithmId::Aes192,
            0x0C => AlgorithmId::Aes256,
            0x11 => AlgorithmId::EccP256,
            0x14 => AlgorithmId::EccP384,
            0xF0 => AlgorithmId::EccP256Sha1,
            0xF1 => AlgorithmId::EccP256Sha256,
            other => {
                return Err(PivError::NotSupported(format!(
                    "unknown algorithm id 0x{other:02X}"
                )))
            }
        })
    }

    pub fn is_rsa(self) -> bool {
        matches!(self, AlgorithmId::Rsa1024 | AlgorithmId::Rsa2048)
    }

    pub fn is_ec(self) -> bool {
        matches!(
            self,
            AlgorithmId::EccP256
                | AlgorithmId::EccP384
                | AlgorithmId::EccP256Sha1
                | AlgorithmId::EccP256Sha256
        )
    }

    pub fn is_symmetric(self) -> bool {
        matches!(
            self,
            AlgorithmId::ThreeDes | AlgorithmId::Aes128 | AlgorithmId::Aes192 | AlgorithmId::Aes256
        )
    }

    /// Block size in bytes, for symmetric admin-key algorithms.
    pub fn block_size(self) -> Option<usize> {
        match self {
            AlgorithmId::ThreeDes => Some(8),
            AlgorithmId::Aes128 | AlgorithmId::Aes192 | AlgorithmId::Aes256 => Some(16),
            _ => None,
        }
    }

    /// Key size in bytes, for symmetric admin-key algorithms.
    pub fn key_size(self) -> Option<usize> {
        match self {
            AlgorithmId::ThreeDes => Some(24),
            AlgorithmId::Aes128 => Some(16),
            AlgorithmId::Aes192 => Some(24),
            AlgorithmId::Aes256 => Some(32),
            _ => None,
        }
    }

    /// RSA modulus size in bytes.
    pub fn rsa_modulus_len(self) -> Option<usize> {
        match self {
            AlgorithmId::Rsa1024 => Some(128),
            AlgorithmId::Rsa2048 => Some(256),
            _ => None,
        }
    }

    /// EC field element size in bytes.
    pub fn ec_field_len(self) -> Option<usize> {
        match self {
            AlgorithmId::EccP256 | AlgorithmId::EccP256Sha1 | AlgorithmId::EccP256Sha256 => {
                Some(32)
            }
            AlgorithmId::EccP384 => Some(48),
            _ => None,
        }
    }

    /// True for the YubiKey pseudo-algorithms where the applet hashes the
    /// payload itself instead of the caller pre-hashing it.
    pub fn hashes_on_card(self) -> bool {
        matches!(self, AlgorithmId::EccP256Sha1 | AlgorithmId::EccP256Sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_id_roundtrip() {
        for alg in [
            AlgorithmId::ThreeDes,
            AlgorithmId::Rsa1024,
            AlgorithmId::Rsa2048,
            AlgorithmId::Aes128,
            AlgorithmId::Aes192,
            AlgorithmId::Aes256,
            AlgorithmId::EccP256,
            AlgorithmId::EccP384,
            AlgorithmId::EccP256Sha1,
            AlgorithmId::EccP256Sha256,
        ] {
            assert_eq!(AlgorithmId::from_wire_id(alg.wire_id()).unwrap(), alg);
        }
    }

    #[test]
    fn unknown_wire_id_is_not_supported() {
        assert!(AlgorithmId::from_wire_id(0xFF).is_err());
    }

    #[test]
    fn pseudo_algorithms_hash_on_card() {
        assert!(AlgorithmId::EccP256Sha256.hashes_on_card());
        assert!(!AlgorithmId::EccP256.hashes_on_card());
    }
}
