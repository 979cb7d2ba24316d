//! SSH-wire canonical encoding for EC public keys.
//!
//! The ECDH box's binary form stores recipient and ephemeral public keys
//! in SSH wire format (RFC 4253 §6.6, RFC 5656) rather than as bare SEC1
//! points, so a box travels as something other tooling in the `ssh-key`
//! ecosystem can also parse. Internally the box still does its ECDH math
//! against `p256` SEC1 points; this module is the boundary conversion.

use ssh_encoding::{Decode, Encode};
use ssh_key::public::{EcdsaPublicKey, KeyData};

use crate::error::{PivError, PivResult};

/// Encode an uncompressed P-256 SEC1 point as an `ecdsa-sha2-nistp256`
/// SSH-wire `KeyData` blob.
pub fn p256_point_to_ssh_wire(sec1_point: &[u8]) -> PivResult<Vec<u8>> {
    let point = p256::EncodedPoint::from_bytes(sec1_point)
        .map_err(|e| PivError::InvalidData(format!("bad P-256 point: {e}")))?;
    let key_data = KeyData::Ecdsa(EcdsaPublicKey::NistP256(point));
    let mut buf = Vec::new();
    key_data
        .encode(&mut buf)
        .map_err(|e| PivError::InvalidData(format!("SSH-wire encode failed: {e}")))?;
    Ok(buf)
}

/// Decode an SSH-wire `KeyData` blob back to its SEC1 point bytes. Only
/// `ecdsa-sha2-nistp256` is accepted — the box envelope is P-256-only.
pub fn ssh_wire_to_p256_point(bytes: &[u8]) -> PivResult<Vec<u8>> {
    let mut reader = bytes;
    let key_data = KeyData::decode(&mut reader)
        .map_err(|e| PivError::InvalidData(format!("SSH-wire decode failed: {e}")))?;
    match key_data {
        KeyData::Ecdsa(EcdsaPublicKey::NistP256(point)) => Ok(point.as_bytes().to_vec()),
        _ => Err(PivError::NotSupported(
            "box recipient key is not ecdsa-sha2-nistp256".into(),
        )),
    }
}
