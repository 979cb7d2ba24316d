//! The PIV command surface: PIN/PUK lifecycle, admin and key-slot
//! authentication, key generation/import, signing, ECDH, and file I/O,
//! plus the YubiKey vendor extensions layered on top of the same applet.

use aes::{Aes128, Aes192, Aes256};
use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::algorithm::AlgorithmId;
use crate::apdu::{self, Command};
use crate::error::{PivError, PivResult};
use crate::slot::SlotId;
use crate::tlv::{self, TlvWriter};
use crate::token::{PinId, Token};

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_RESET_RETRY: u8 = 0x2C;
const INS_GEN_AUTH: u8 = 0x87;
const INS_GET_DATA: u8 = 0xCB;
const INS_PUT_DATA: u8 = 0xDB;
const INS_GEN_ASYM: u8 = 0x47;
const INS_YK_IMPORT_ASYM: u8 = 0xFE;
const INS_YK_SET_MGMKEY: u8 = 0xFF;
const INS_YK_RESET: u8 = 0xFB;
const INS_YK_SET_PIN_RETRIES: u8 = 0xFA;
const INS_YK_ATTEST: u8 = 0xF9;

fn pad_pin(pin: &str) -> PivResult<Zeroizing<[u8; 8]>> {
    if pin.is_empty() || pin.len() > 8 {
        return Err(PivError::Argument(format!(
            "PIN must be 1..=8 characters, got {}",
            pin.len()
        )));
    }
    let mut padded = Zeroizing::new([0xFFu8; 8]);
    padded[..pin.len()].copy_from_slice(pin.as_bytes());
    Ok(padded)
}

fn retries_from_sw(sw: u16) -> Option<u8> {
    if sw & 0xFFF0 == 0x63C0 {
        Some((sw & 0x000F) as u8)
    } else {
        None
    }
}

/// Verify a PIN (or global PIN/PUK). `min_retries`, if set, refuses to
/// spend an attempt when the card's remaining counter is already below the
/// floor. `canskip`, if true and the PIN is already verified this session,
/// short-circuits with an empty VERIFY probe instead of resubmitting it.
pub fn verify_pin(
    token: &mut Token,
    pin: PinId,
    value: &str,
    min_retries: Option<u8>,
    canskip: bool,
) -> PivResult<()> {
    if canskip && token.is_pin_verified(pin) {
        let probe = Command::new(INS_VERIFY, 0x00, pin.wire_id(), Vec::new());
        let resp = apdu::transceive(token.transport_mut(), &probe)?;
        if resp.sw == 0x9000 {
            return Ok(());
        }
    }

    if let Some(min) = min_retries {
        let probe = Command::new(INS_VERIFY, 0x00, pin.wire_id(), Vec::new());
        let resp = apdu::transceive(token.transport_mut(), &probe)?;
        if let Some(remaining) = retries_from_sw(resp.sw) {
            if remaining < min {
                return Err(PivError::MinRetries {
                    retries: remaining,
                    min,
                });
            }
        }
    }

    let padded = pad_pin(value)?;
    let cmd = Command::new(INS_VERIFY, 0x00, pin.wire_id(), padded.to_vec());
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    if resp.sw == 0x9000 {
        token.mark_pin_verified(pin);
        return Ok(());
    }
    token.clear_pin_verified(pin);
    if let Some(remaining) = retries_from_sw(resp.sw) {
        return Err(PivError::Permission(format!(
            "wrong PIN, {remaining} attempts remaining"
        )));
    }
    resp.into_result("verify pin").map(|_| ())
}

/// Change a PIN/PUK from its current value to a new one (INS `24`).
pub fn change_pin(token: &mut Token, pin: PinId, old: &str, new: &str) -> PivResult<()> {
    let old_padded = pad_pin(old)?;
    let new_padded = pad_pin(new)?;
    let mut data = old_padded.to_vec();
    data.extend_from_slice(&new_padded);
    let cmd = Command::new(INS_CHANGE_REFERENCE, 0x00, pin.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    if let Some(remaining) = retries_from_sw(resp.sw) {
        return Err(PivError::Permission(format!(
            "wrong PIN, {remaining} attempts remaining"
        )));
    }
    resp.into_result("change pin").map(|_| ())
}

/// Reset a blocked PIN using the PUK (INS `2C`).
pub fn reset_pin(token: &mut Token, puk: &str, new_pin: &str) -> PivResult<()> {
    let puk_padded = pad_pin(puk)?;
    let new_padded = pad_pin(new_pin)?;
    let mut data = puk_padded.to_vec();
    data.extend_from_slice(&new_padded);
    let cmd = Command::new(INS_RESET_RETRY, 0x00, PinId::Piv.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    if let Some(remaining) = retries_from_sw(resp.sw) {
        return Err(PivError::Permission(format!(
            "wrong PUK, {remaining} attempts remaining"
        )));
    }
    resp.into_result("reset pin").map(|_| ())
}

fn ecb_decrypt(alg: AlgorithmId, key: &[u8], block: &[u8]) -> PivResult<Vec<u8>> {
    let mut out = block.to_vec();
    match alg {
        AlgorithmId::ThreeDes => {
            let cipher = TdesEde3::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad 3DES key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.decrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes128 => {
            let cipher = Aes128::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-128 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.decrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes192 => {
            let cipher = Aes192::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-192 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.decrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes256 => {
            let cipher = Aes256::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-256 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.decrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        other => {
            return Err(PivError::NotSupported(format!(
                "{other:?} is not a valid admin-key algorithm"
            )))
        }
    }
    Ok(out)
}

fn ecb_encrypt(alg: AlgorithmId, key: &[u8], block: &[u8]) -> PivResult<Vec<u8>> {
    let mut out = block.to_vec();
    match alg {
        AlgorithmId::ThreeDes => {
            let cipher = TdesEde3::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad 3DES key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.encrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes128 => {
            let cipher = Aes128::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-128 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.encrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes192 => {
            let cipher = Aes192::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-192 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.encrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        AlgorithmId::Aes256 => {
            let cipher = Aes256::new_from_slice(key)
                .map_err(|e| PivError::Argument(format!("bad AES-256 key: {e}")))?;
            let mut b = GenericArray::clone_from_slice(&out);
            cipher.encrypt_block(&mut b);
            out.copy_from_slice(&b);
        }
        other => {
            return Err(PivError::NotSupported(format!(
                "{other:?} is not a valid admin-key algorithm"
            )))
        }
    }
    Ok(out)
}

/// Mutual challenge-response admin authentication over `GEN_AUTH`: the
/// card's witness is decrypted to prove we hold the key, then our own
/// challenge is encrypted and checked against the card's response.
pub fn auth_admin(token: &mut Token, key: &[u8], algorithm: AlgorithmId) -> PivResult<()> {
    let block_size = algorithm
        .block_size()
        .ok_or_else(|| PivError::Argument(format!("{algorithm:?} has no admin-key block size")))?;

    let mut w = TlvWriter::new();
    w.open(&[0x7C]);
    w.write(&[0x80], &[]);
    w.close()?;
    let request = w.finish()?;
    let cmd = Command::new(INS_GEN_AUTH, algorithm.wire_id(), 0x9B, request);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let reply = resp.into_result("auth admin: request witness")?;
    let outer = tlv::parse_all(&reply)?;
    let dialog = tlv::find(&outer, &[0x7C])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing tag 7C".into()))?;
    let inner = tlv::parse_all(&dialog.value)?;
    let witness = tlv::find(&inner, &[0x80])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing witness".into()))?;
    if witness.value.len() != block_size {
        return Err(PivError::InvalidData("witness has wrong block size".into()));
    }

    let decrypted_witness = ecb_decrypt(algorithm, key, &witness.value)?;

    let mut challenge = vec![0u8; block_size];
    rand::thread_rng().fill_bytes(&mut challenge);

    let mut w = TlvWriter::new();
    w.open(&[0x7C]);
    w.write(&[0x80], &decrypted_witness);
    w.write(&[0x81], &challenge);
    w.close()?;
    let request = w.finish()?;
    let cmd = Command::new(INS_GEN_AUTH, algorithm.wire_id(), 0x9B, request);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let reply = resp.into_result("auth admin: answer challenge")?;
    let outer = tlv::parse_all(&reply)?;
    let dialog = tlv::find(&outer, &[0x7C])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing tag 7C".into()))?;
    let inner = tlv::parse_all(&dialog.value)?;
    let response = tlv::find(&inner, &[0x82])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing response".into()))?;

    let expected = ecb_encrypt(algorithm, key, &challenge)?;
    if response.value != expected {
        return Err(PivError::Permission("admin key mismatch".into()));
    }
    token.set_admin_authenticated(true);
    Ok(())
}

/// Assert that a slot's cached public key matches `pubkey` by performing a
/// sign/verify round trip with a random challenge (requires the slot's key
/// not require touch, and its PIN-to-use policy already satisfied).
pub fn auth_key(token: &mut Token, slot: SlotId, pubkey: &[u8]) -> PivResult<()> {
    let cached = token
        .get_slot(slot)
        .and_then(|s| s.public_key.as_deref())
        .ok_or_else(|| PivError::NotFound(format!("slot {:02X} has no cached public key", slot.wire_id())))?;
    if cached != pubkey {
        return Err(PivError::KeyAuth("public key does not match slot".into()));
    }

    let algorithm = token
        .get_slot(slot)
        .and_then(|s| s.algorithm)
        .ok_or_else(|| PivError::NotFound("slot has no known algorithm".into()))?;

    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    let digest = Sha256::digest(challenge);
    let signature = sign_prehash(token, slot, algorithm, &digest)?;
    verify_signature(algorithm, pubkey, &digest, &signature)
        .map_err(|e| PivError::KeyAuth(format!("signature did not verify: {e}")))
}

fn verify_signature(
    algorithm: AlgorithmId,
    pubkey: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> PivResult<()> {
    if algorithm.is_ec() {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};
        let vk = VerifyingKey::from_sec1_bytes(pubkey)
            .map_err(|e| PivError::InvalidData(format!("bad EC public key: {e}")))?;
        let sig = Signature::from_der(signature)
            .map_err(|e| PivError::InvalidData(format!("bad signature encoding: {e}")))?;
        // `digest` already is the SHA-256 hash fed to the card for signing
        // (the card signs a prehash, it never re-hashes), so verification
        // must check the prehash directly rather than hashing it again.
        vk.verify_prehash(digest, &sig)
            .map_err(|_| PivError::KeyAuth("EC signature verification failed".into()))
    } else {
        Err(PivError::NotSupported(
            "auth_key verification only implemented for EC slots".into(),
        ))
    }
}

/// Option bundle for `generate`/`import`, matching the YK PIN/touch policy
/// extension bytes (`A0`/`A1`).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyPolicy {
    pub pin_policy: Option<u8>,
    pub touch_policy: Option<u8>,
}

/// Generate a new key pair in `slot`. Requires prior admin authentication.
/// Returns the public key in SEC1 (EC) or raw modulus||exponent (RSA) form.
pub fn generate(
    token: &mut Token,
    slot: SlotId,
    algorithm: AlgorithmId,
    policy: KeyPolicy,
) -> PivResult<Vec<u8>> {
    let mut w = TlvWriter::new();
    w.open(&[0xAC]);
    w.write(&[0x80], &[algorithm.wire_id()]);
    if let Some(p) = policy.pin_policy {
        w.write(&[0xA0], &[p]);
    }
    if let Some(t) = policy.touch_policy {
        w.write(&[0xA1], &[t]);
    }
    w.close()?;
    let data = w.finish()?;
    let cmd = Command::new(INS_GEN_ASYM, 0x00, slot.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let reply = resp.into_result("generate key")?;
    let outer = tlv::parse_all(&reply)?;
    let template = tlv::find(&outer, &[0x7F, 0x49])
        .ok_or_else(|| PivError::InvalidData("GEN_ASYM reply missing tag 7F49".into()))?;
    let fields = tlv::parse_all(&template.value)?;

    let public_key = if algorithm.is_rsa() {
        let modulus = tlv::find(&fields, &[0x81])
            .ok_or_else(|| PivError::InvalidData("RSA key template missing modulus".into()))?;
        let exponent = tlv::find(&fields, &[0x82])
            .ok_or_else(|| PivError::InvalidData("RSA key template missing exponent".into()))?;
        let n = rsa::BigUint::from_bytes_be(&modulus.value);
        let e = rsa::BigUint::from_bytes_be(&exponent.value);
        let key = rsa::RsaPublicKey::new(n, e)
            .map_err(|e| PivError::InvalidData(format!("invalid RSA public key: {e}")))?;
        key.n().to_bytes_be()
    } else {
        let point = tlv::find(&fields, &[0x86])
            .ok_or_else(|| PivError::InvalidData("EC key template missing point".into()))?;
        point.value.clone()
    };

    let mut slot_entry = crate::slot::Slot::force(slot, algorithm);
    slot_entry.public_key = Some(public_key.clone());
    token.upsert_slot(slot_entry);
    Ok(public_key)
}

/// Private key components accepted by the YK import extension.
pub enum ImportKeyMaterial {
    Rsa {
        p: Vec<u8>,
        q: Vec<u8>,
        dp: Vec<u8>,
        dq: Vec<u8>,
        q_inv: Vec<u8>,
    },
    Ec {
        scalar: Vec<u8>,
    },
}

/// Import externally-generated private key material into `slot` (YK
/// extension, INS `FE`). Command chaining applies automatically for the
/// larger RSA payloads.
pub fn import_key(
    token: &mut Token,
    slot: SlotId,
    algorithm: AlgorithmId,
    material: ImportKeyMaterial,
    policy: KeyPolicy,
) -> PivResult<()> {
    let mut data = Vec::new();
    match material {
        ImportKeyMaterial::Rsa { mut p, mut q, mut dp, mut dq, mut q_inv } => {
            if !algorithm.is_rsa() {
                return Err(PivError::Argument("RSA material given for non-RSA algorithm".into()));
            }
            for (tag, value) in [
                (0x01u8, &mut p),
                (0x02, &mut q),
                (0x03, &mut dp),
                (0x04, &mut dq),
                (0x05, &mut q_inv),
            ] {
                data.push(tag);
                tlv::encode_length(value.len(), &mut data);
                data.extend_from_slice(value);
                value.zeroize();
            }
        }
        ImportKeyMaterial::Ec { mut scalar } => {
            if !algorithm.is_ec() {
                return Err(PivError::Argument("EC material given for non-EC algorithm".into()));
            }
            data.push(0x06);
            tlv::encode_length(scalar.len(), &mut data);
            data.extend_from_slice(&scalar);
            scalar.zeroize();
        }
    }
    if let Some(p) = policy.pin_policy {
        data.extend_from_slice(&[0xA0, 0x01, p]);
    }
    if let Some(t) = policy.touch_policy {
        data.extend_from_slice(&[0xA1, 0x01, t]);
    }

    let mut cmd = Command::new(INS_YK_IMPORT_ASYM, algorithm.wire_id(), slot.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd);
    cmd.data.zeroize();
    resp?.into_result("import key")?;
    token.force_slot(slot, algorithm);
    Ok(())
}

fn sha256_digest_info(digest: &[u8]) -> Vec<u8> {
    const SHA256_PREFIX: [u8; 19] = [
        0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
        0x05, 0x00, 0x04, 0x20,
    ];
    let mut out = SHA256_PREFIX.to_vec();
    out.extend_from_slice(digest);
    out
}

fn gen_auth_sign(token: &mut Token, slot: SlotId, algorithm: AlgorithmId, input: &[u8]) -> PivResult<Vec<u8>> {
    let mut w = TlvWriter::new();
    w.open(&[0x7C]);
    w.write(&[0x82], &[]);
    w.write(&[0x81], input);
    w.close()?;
    let data = w.finish()?;
    let cmd = Command::new(INS_GEN_AUTH, algorithm.wire_id(), slot.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let reply = resp.into_result("sign")?;
    let outer = tlv::parse_all(&reply)?;
    let dialog = tlv::find(&outer, &[0x7C])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing tag 7C".into()))?;
    let inner = tlv::parse_all(&dialog.value)?;
    let sig = tlv::find(&inner, &[0x82])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing signature".into()))?;
    Ok(sig.value.clone())
}

/// Sign `message`, hashing it with SHA-256 first unless `algorithm` hashes
/// on-card. For RSA the digest is PKCS#1-v1.5 DigestInfo wrapped and padded
/// to the modulus width before being sent.
pub fn sign(token: &mut Token, slot: SlotId, algorithm: AlgorithmId, message: &[u8]) -> PivResult<Vec<u8>> {
    if algorithm.hashes_on_card() {
        return gen_auth_sign(token, slot, algorithm, message);
    }
    let digest = Sha256::digest(message);
    if algorithm.is_rsa() {
        sign_prehash(token, slot, algorithm, &sha256_digest_info(&digest))
    } else {
        sign_prehash(token, slot, algorithm, &digest)
    }
}

/// Sign an already-prepared digest (for RSA, a DigestInfo; for EC, a raw
/// hash truncated to the field width). Returns [`PivError::NotSupported`]
/// for the hash-on-card pseudo-algorithms, which cannot accept a prehash.
pub fn sign_prehash(
    token: &mut Token,
    slot: SlotId,
    algorithm: AlgorithmId,
    digest_info: &[u8],
) -> PivResult<Vec<u8>> {
    if algorithm.hashes_on_card() {
        return Err(PivError::NotSupported(
            "this algorithm hashes on-card and cannot accept a prehash".into(),
        ));
    }

    let input = if algorithm.is_rsa() {
        let modulus_len = algorithm
            .rsa_modulus_len()
            .ok_or_else(|| PivError::Argument("unknown RSA modulus size".into()))?;
        pkcs1v15_pad(digest_info, modulus_len)?
    } else {
        let field_len = algorithm
            .ec_field_len()
            .ok_or_else(|| PivError::Argument("unknown EC field size".into()))?;
        truncate_or_pad(digest_info, field_len)
    };

    let raw = gen_auth_sign(token, slot, algorithm, &input)?;
    if algorithm.is_ec() {
        Ok(ec_signature_to_der(&raw))
    } else {
        Ok(raw)
    }
}

fn pkcs1v15_pad(digest_info: &[u8], modulus_len: usize) -> PivResult<Vec<u8>> {
    if digest_info.len() + 11 > modulus_len {
        return Err(PivError::Argument("DigestInfo too large for modulus".into()));
    }
    let ps_len = modulus_len - digest_info.len() - 3;
    let mut out = Vec::with_capacity(modulus_len);
    out.push(0x00);
    out.push(0x01);
    out.extend(std::iter::repeat(0xFFu8).take(ps_len));
    out.push(0x00);
    out.extend_from_slice(digest_info);
    Ok(out)
}

fn truncate_or_pad(digest: &[u8], field_len: usize) -> Vec<u8> {
    if digest.len() >= field_len {
        digest[..field_len].to_vec()
    } else {
        let mut out = vec![0u8; field_len - digest.len()];
        out.extend_from_slice(digest);
        out
    }
}

/// Re-encode a raw `r||s` EC signature as ASN.1 `SEQUENCE { r, s }`.
fn ec_signature_to_der(raw: &[u8]) -> Vec<u8> {
    let half = raw.len() / 2;
    let r = &raw[..half];
    let s = &raw[half..];
    fn encode_integer(v: &[u8]) -> Vec<u8> {
        let mut trimmed = v;
        while trimmed.len() > 1 && trimmed[0] == 0 && trimmed[1] & 0x80 == 0 {
            trimmed = &trimmed[1..];
        }
        let mut out = vec![0x02];
        if trimmed[0] & 0x80 != 0 {
            tlv::encode_length(trimmed.len() + 1, &mut out);
            out.push(0x00);
        } else {
            tlv::encode_length(trimmed.len(), &mut out);
        }
        out.extend_from_slice(trimmed);
        out
    }
    let r_enc = encode_integer(r);
    let s_enc = encode_integer(s);
    let mut body = r_enc;
    body.extend_from_slice(&s_enc);
    let mut out = vec![0x30];
    tlv::encode_length(body.len(), &mut out);
    out.extend_from_slice(&body);
    out
}

/// Perform ECDH with `peer_point` (an uncompressed SEC1 point) using the
/// private key in `slot`. Returns the raw X-coordinate of the shared
/// point, zeroed on drop since it is key-derivation material.
pub fn ecdh(token: &mut Token, slot: SlotId, peer_point: &[u8]) -> PivResult<Zeroizing<Vec<u8>>> {
    let algorithm = token
        .get_slot(slot)
        .and_then(|s| s.algorithm)
        .ok_or_else(|| PivError::NotFound("slot has no known algorithm".into()))?;
    if !algorithm.is_ec() {
        return Err(PivError::NotSupported("ECDH requires an EC slot".into()));
    }

    let mut w = TlvWriter::new();
    w.open(&[0x7C]);
    w.write(&[0x82], &[]);
    w.write(&[0x85], peer_point);
    w.close()?;
    let data = w.finish()?;
    let cmd = Command::new(INS_GEN_AUTH, algorithm.wire_id(), slot.wire_id(), data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let reply = resp.into_result("ecdh")?;
    let outer = tlv::parse_all(&reply)?;
    let dialog = tlv::find(&outer, &[0x7C])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing tag 7C".into()))?;
    let inner = tlv::parse_all(&dialog.value)?;
    let secret = tlv::find(&inner, &[0x82])
        .ok_or_else(|| PivError::InvalidData("GEN_AUTH reply missing shared secret".into()))?;
    Ok(Zeroizing::new(secret.value.clone()))
}

/// Read a data object's contents (excluding its `53` wrapper), handling
/// response reassembly via the APDU engine. The returned buffer is caller-
/// owned and zeroed on drop, since a data object may carry private
/// material (e.g. an imported key's backup copy).
pub fn read_file(token: &mut Token, tag: &[u8]) -> PivResult<Zeroizing<Vec<u8>>> {
    let mut data = Vec::new();
    data.push(0x5C);
    data.push(tag.len() as u8);
    data.extend_from_slice(tag);
    let cmd = Command::new(INS_GET_DATA, 0x3F, 0xFF, data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    let bytes = resp.into_result("read file")?;
    let items = tlv::parse_all(&bytes)?;
    let wrapper = tlv::find(&items, &[0x53])
        .ok_or_else(|| PivError::InvalidData("GET DATA reply missing tag 53".into()))?;
    Ok(Zeroizing::new(wrapper.value.clone()))
}

/// Write a data object's contents, chaining across multiple APDUs as
/// needed. Requires admin authentication for most tags.
pub fn write_file(token: &mut Token, tag: &[u8], contents: &[u8]) -> PivResult<()> {
    let mut data = Vec::new();
    data.push(0x5C);
    data.push(tag.len() as u8);
    data.extend_from_slice(tag);
    data.push(0x53);
    tlv::encode_length(contents.len(), &mut data);
    data.extend_from_slice(contents);
    let cmd = Command::new(INS_PUT_DATA, 0x3F, 0xFF, data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    resp.into_result("write file").map(|_| ())
}

const TAG_KEY_HISTORY: [u8; 3] = [0x5F, 0xC1, 0x0C];

/// Write the Key History object (tag `5FC10C`): on/off-card certificate
/// counts and the optional URL where off-card certificates are hosted.
/// Refuses to write a history that claims off-card certificates exist
/// without saying where to find them.
pub fn write_key_history(
    token: &mut Token,
    on_card_certs: u8,
    off_card_certs: u8,
    off_card_url: Option<&str>,
) -> PivResult<()> {
    if off_card_certs > 0 && off_card_url.is_none() {
        return Err(PivError::Argument(
            "off_card_certs > 0 requires an off_card_url".into(),
        ));
    }
    let mut data = vec![0xC1, 0x01, on_card_certs, 0xC2, 0x01, off_card_certs];
    if let Some(url) = off_card_url {
        data.push(0xF3);
        tlv::encode_length(url.len(), &mut data);
        data.extend_from_slice(url.as_bytes());
    }
    write_file(token, &TAG_KEY_HISTORY, &data)
}

/// Write a certificate to `slot`'s data object, wrapping it in the
/// standard `70`/`71`/`FE` structure. `compress` gzip-compresses the
/// certificate body and sets the compression bit in cert-info.
pub fn write_cert(token: &mut Token, slot: SlotId, cert_der: &[u8], compress: bool) -> PivResult<()> {
    let body = if compress {
        compress_gzip(cert_der)?
    } else {
        cert_der.to_vec()
    };
    let mut data = Vec::new();
    data.push(0x70);
    tlv::encode_length(body.len(), &mut data);
    data.extend_from_slice(&body);
    data.extend_from_slice(&[0x71, 0x01, if compress { 0x01 } else { 0x00 }]);
    data.extend_from_slice(&[0xFE, 0x00]);
    write_file(token, &slot.cert_tag()?, &data)
}

fn compress_gzip(data: &[u8]) -> PivResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| PivError::InvalidData(format!("gzip compress failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| PivError::InvalidData(format!("gzip compress failed: {e}")))
}

/// Read a slot's YK attestation certificate (INS `F9`), proving the key
/// was generated on-card rather than imported.
pub fn attest(token: &mut Token, slot: SlotId) -> PivResult<Vec<u8>> {
    let cmd = Command::new(INS_YK_ATTEST, slot.wire_id(), 0x00, Vec::new());
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    resp.into_result("attest")
}

/// Factory-reset a YK token (INS `FB`). The card refuses unless both the
/// PIN and PUK retry counters have already been exhausted; the library
/// does not second-guess that precondition client-side.
pub fn reset(token: &mut Token) -> PivResult<()> {
    let cmd = Command::new(INS_YK_RESET, 0x00, 0x00, Vec::new());
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    resp.into_result("reset").map(|_| ())
}

/// Set a new admin (management) key (YK extension, INS `FF`).
pub fn set_admin(
    token: &mut Token,
    new_key: &[u8],
    algorithm: AlgorithmId,
    touch_required: bool,
) -> PivResult<()> {
    let mut data = vec![algorithm.wire_id(), 0x9B, new_key.len() as u8];
    data.extend_from_slice(new_key);
    let p2 = if touch_required { 0xFE } else { 0xFF };
    let cmd = Command::new(INS_YK_SET_MGMKEY, 0xFF, p2, data);
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    resp.into_result("set admin key").map(|_| ())
}

/// Set PIN and PUK retry counters (YK extension, INS `FA`). Resets both
/// PIN and PUK to their defaults as a side effect, per the vendor's
/// documented behavior.
pub fn set_pin_retries(token: &mut Token, pin_retries: u8, puk_retries: u8) -> PivResult<()> {
    let cmd = Command::new(INS_YK_SET_PIN_RETRIES, pin_retries, puk_retries, Vec::new());
    let resp = apdu::transceive(token.transport_mut(), &cmd)?;
    resp.into_result("set pin retries").map(|_| ())
}
