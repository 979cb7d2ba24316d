//! Key-reference slots on a PIV token.

use crate::algorithm::AlgorithmId;
use crate::error::{PivError, PivResult};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

/// One PIV key reference. If a slot was produced by `read_cert` it always
/// carries a certificate and derived public key; slots created with
/// `force_slot` (no card round-trip) carry only `id` and `algorithm`.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub algorithm: Option<AlgorithmId>,
    pub certificate: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub compressed: bool,
    pub pin_to_use: bool,
    pub touch_to_use: bool,
}

impl Slot {
    pub fn force(id: SlotId, algorithm: AlgorithmId) -> Self {
        Slot {
            id,
            algorithm: Some(algorithm),
            certificate: None,
            public_key: None,
            compressed: false,
            pin_to_use: false,
            touch_to_use: false,
        }
    }

    /// Parse a DER certificate, caching its SubjectPublicKeyInfo bytes and
    /// deriving the slot's algorithm from the key itself so `auth_key`/
    /// `ecdh` work against a slot obtained this way, not only one that was
    /// just generated on-card.
    pub fn with_certificate(id: SlotId, cert_der: Vec<u8>) -> PivResult<Self> {
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| PivError::InvalidData(format!("bad certificate: {e}")))?;
        let spki = cert.public_key();
        let public_key = spki.raw.to_vec();
        let algorithm = algorithm_from_public_key(spki)?;
        Ok(Slot {
            id,
            algorithm: Some(algorithm),
            certificate: Some(cert_der),
            public_key: Some(public_key),
            compressed: false,
            pin_to_use: false,
            touch_to_use: false,
        })
    }
}

/// Derive an `AlgorithmId` from a certificate's SubjectPublicKeyInfo by the
/// size of its key material, the same way `AlgorithmId::rsa_modulus_len`/
/// `ec_field_len` already key off size rather than carrying a full OID
/// table.
fn algorithm_from_public_key(spki: &SubjectPublicKeyInfo) -> PivResult<AlgorithmId> {
    match spki
        .parsed()
        .map_err(|e| PivError::InvalidData(format!("bad public key: {e}")))?
    {
        PublicKey::RSA(rsa) => algorithm_from_rsa_modulus(rsa.modulus),
        PublicKey::EC(point) => algorithm_from_ec_point(point.data()),
        _ => Err(PivError::NotSupported(
            "certificate public key is neither RSA nor EC".into(),
        )),
    }
}

/// `modulus` is the DER `INTEGER` contents, which carries a leading `0x00`
/// sign byte whenever the high bit of the actual modulus is set.
fn algorithm_from_rsa_modulus(modulus: &[u8]) -> PivResult<AlgorithmId> {
    let len = if modulus.first() == Some(&0) && modulus.len() > 1 {
        modulus.len() - 1
    } else {
        modulus.len()
    };
    match len {
        128 => Ok(AlgorithmId::Rsa1024),
        256 => Ok(AlgorithmId::Rsa2048),
        other => Err(PivError::NotSupported(format!(
            "unsupported RSA modulus size {other} bytes"
        ))),
    }
}

/// `point` is the uncompressed SEC1 point (`04 || X || Y`).
fn algorithm_from_ec_point(point: &[u8]) -> PivResult<AlgorithmId> {
    match point.len() {
        65 => Ok(AlgorithmId::EccP256),
        97 => Ok(AlgorithmId::EccP384),
        other => Err(PivError::NotSupported(format!(
            "unsupported EC point size {other} bytes"
        ))),
    }
}

/// PIV and YK key-reference identifiers (NIST SP 800-73-4 Table 4-B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Authentication,
    CardManagement,
    Signature,
    KeyManagement,
    CardAuthentication,
    Retired(u8),
    Attestation,
}

impl SlotId {
    pub fn wire_id(self) -> u8 {
        match self {
            SlotId::Authentication => 0x9A,
            SlotId::CardManagement => 0x9B,
            SlotId::Signature => 0x9C,
            SlotId::KeyManagement => 0x9D,
            SlotId::CardAuthentication => 0x9E,
            SlotId::Retired(n) => 0x82 + n,
            SlotId::Attestation => 0xF9,
        }
    }

    pub fn from_wire_id(id: u8) -> crate::error::PivResult<Self> {
        Ok(match id {
            0x9A => SlotId::Authentication,
            0x9B => SlotId::CardManagement,
            0x9C => SlotId::Signature,
            0x9D => SlotId::KeyManagement,
            0x9E => SlotId::CardAuthentication,
            0xF9 => SlotId::Attestation,
            0x82..=0x95 => SlotId::Retired(id - 0x82),
            other => {
                return Err(crate::error::PivError::NotSupported(format!(
                    "unknown slot id 0x{other:02X}"
                )))
            }
        })
    }

    /// Data object tag holding this slot's certificate. `CardManagement`
    /// (9B) is the symmetric admin key, not a certificate-bearing slot, so
    /// it has no tag and yields `NotSupportedError`.
    pub fn cert_tag(self) -> crate::error::PivResult<[u8; 3]> {
        Ok(match self {
            SlotId::Authentication => [0x5F, 0xC1, 0x05],
            SlotId::Signature => [0x5F, 0xC1, 0x0A],
            SlotId::KeyManagement => [0x5F, 0xC1, 0x0B],
            SlotId::CardAuthentication => [0x5F, 0xC1, 0x01],
            SlotId::Attestation => [0x5F, 0xFF, 0x01],
            SlotId::CardManagement => {
                return Err(crate::error::PivError::NotSupported(
                    "slot 9B (admin key) has no certificate".into(),
                ))
            }
            SlotId::Retired(n) => {
                // 82..=8F -> 5FC10D..5FC120, then 90..95 continue the range.
                const RETIRED_TAGS: [u8; 20] = [
                    0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19,
                    0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, 0x20,
                ];
                [0x5F, 0xC1, RETIRED_TAGS[n as usize]]
            }
        })
    }

    /// Standard certificate-bearing PIV slot ids, in enumeration order.
    /// Excludes `CardManagement` (9B, no certificate) and the YK retired
    /// key-management slots, listed separately by `all_retired`.
    pub fn standard() -> [SlotId; 4] {
        [
            SlotId::Authentication,
            SlotId::Signature,
            SlotId::KeyManagement,
            SlotId::CardAuthentication,
        ]
    }

    pub fn all_retired() -> impl Iterator<Item = SlotId> {
        (0..20).map(SlotId::Retired)
    }
}
