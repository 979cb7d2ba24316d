//! The sealed-box ECDH envelope: ephemeral-static key agreement plus an
//! AEAD, with a deterministic binary serialization so a box can travel as
//! a flat byte string between sealing and opening.

use chacha20poly1305::aead::{Aead, KeyInit as AeadKeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::{PivError, PivResult};
use crate::pubkey;
use crate::slot::SlotId;
use crate::token::Token;

const MAGIC: [u8; 2] = [0xB0, 0xC5];
const CURRENT_VERSION: u8 = 0x02;
const FLAG_RECIPIENT: u8 = 0x01;

const DEFAULT_CIPHER: &str = "chacha20-poly1305";
const DEFAULT_KDF: &str = "sha512";

/// A sealed (or, transiently, opened) ECDH box.
pub struct EcdhBox {
    pub version: u8,
    pub recipient_guid: Option<[u8; 16]>,
    pub recipient_slot: Option<SlotId>,
    pub recipient_pubkey: Vec<u8>,
    pub ephemeral_pubkey: Vec<u8>,
    pub cipher: String,
    pub kdf: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    plaintext: Option<Zeroizing<Vec<u8>>>,
}

impl EcdhBox {
    /// Seal `plaintext` to `recipient_pubkey` (a SEC1-encoded P-256 point).
    /// `named` optionally records the token GUID + slot that owns the
    /// recipient key, so `find_token` can later locate it.
    pub fn seal(
        plaintext: &[u8],
        recipient_pubkey: &[u8],
        named: Option<([u8; 16], SlotId)>,
    ) -> PivResult<Self> {
        let recipient = PublicKey::from_sec1_bytes(recipient_pubkey)
            .map_err(|e| PivError::InvalidData(format!("bad recipient public key: {e}")))?;

        let ephemeral = SecretKey::random(&mut rand::thread_rng());
        let ephemeral_pubkey = ephemeral.public_key().to_encoded_point(false).as_bytes().to_vec();

        let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
        let key = derive_key(shared.raw_secret_bytes());

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| PivError::InvalidData(format!("bad derived key: {e}")))?;
        let ciphertext = cipher
            .encrypt(ChaChaNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| PivError::InvalidData("seal encryption failed".into()))?;

        Ok(EcdhBox {
            version: CURRENT_VERSION,
            recipient_guid: named.map(|(g, _)| g),
            recipient_slot: named.map(|(_, s)| s),
            recipient_pubkey: recipient_pubkey.to_vec(),
            ephemeral_pubkey,
            cipher: DEFAULT_CIPHER.to_string(),
            kdf: DEFAULT_KDF.to_string(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            plaintext: None,
        })
    }

    /// Open a box using a local private key (the offline path: no token
    /// round trip, used for testing and for software-only recipients).
    pub fn open_offline(&mut self, recipient_secret: &SecretKey) -> PivResult<&[u8]> {
        let ephemeral = PublicKey::from_sec1_bytes(&self.ephemeral_pubkey)
            .map_err(|e| PivError::InvalidData(format!("bad ephemeral public key: {e}")))?;
        let shared = diffie_hellman(recipient_secret.to_nonzero_scalar(), ephemeral.as_affine());
        self.open_with_shared_secret(shared.raw_secret_bytes().as_slice())
    }

    /// Open a box using a live token: the token performs `ecdh` with its
    /// slot's private key against this box's ephemeral public key.
    pub fn open_with_token(&mut self, token: &mut Token, slot: SlotId) -> PivResult<&[u8]> {
        let shared = crate::commands::ecdh(token, slot, &self.ephemeral_pubkey)?;
        self.open_with_shared_secret(&shared)
    }

    fn open_with_shared_secret(&mut self, shared: &[u8]) -> PivResult<&[u8]> {
        if self.cipher != DEFAULT_CIPHER {
            return Err(PivError::NotSupported(format!(
                "unsupported box cipher '{}'",
                self.cipher
            )));
        }
        if self.kdf != DEFAULT_KDF {
            return Err(PivError::NotSupported(format!("unsupported box kdf '{}'", self.kdf)));
        }
        let key = derive_key(shared);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| PivError::InvalidData(format!("bad derived key: {e}")))?;
        let plaintext = cipher
            .decrypt(ChaChaNonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| PivError::KeyAuth("box authentication failed".into()))?;
        self.plaintext = Some(Zeroizing::new(plaintext));
        Ok(self.plaintext.as_ref().unwrap())
    }

    /// Serialize to the canonical binary form (current version).
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        let flags = if self.recipient_guid.is_some() { FLAG_RECIPIENT } else { 0 };
        out.push(flags);
        if let (Some(guid), Some(slot)) = (self.recipient_guid, self.recipient_slot) {
            out.extend_from_slice(&guid);
            out.push(slot.wire_id());
        }
        write_lenpfx(&mut out, self.cipher.as_bytes());
        write_lenpfx(&mut out, self.kdf.as_bytes());
        // Versions >= 2 store both public keys as SSH-wire `KeyData` blobs
        // rather than bare SEC1 points, so a box can be consumed by other
        // SSH-key-aware tooling.
        let recipient_wire = pubkey::p256_point_to_ssh_wire(&self.recipient_pubkey)
            .unwrap_or_else(|_| self.recipient_pubkey.clone());
        let ephemeral_wire = pubkey::p256_point_to_ssh_wire(&self.ephemeral_pubkey)
            .unwrap_or_else(|_| self.ephemeral_pubkey.clone());
        write_lenpfx(&mut out, &recipient_wire);
        write_lenpfx(&mut out, &ephemeral_wire);
        write_lenpfx(&mut out, &self.nonce);
        write_lenpfx(&mut out, &self.ciphertext);
        out
    }

    /// Parse the binary form, synthesizing defaults for version 1 boxes
    /// (which predate the cipher/KDF name fields and stored bare SEC1
    /// points instead of SSH-wire key blobs).
    pub fn from_binary(buf: &[u8]) -> PivResult<Self> {
        let mut pos = 0;
        if buf.len() < 4 || buf[0..2] != MAGIC {
            return Err(PivError::InvalidData("bad box magic".into()));
        }
        pos += 2;
        let version = buf[pos];
        pos += 1;
        if version == 0 || version > CURRENT_VERSION {
            return Err(PivError::InvalidData(format!("unsupported box version {version}")));
        }
        let flags = buf[pos];
        pos += 1;

        let (recipient_guid, recipient_slot) = if flags & FLAG_RECIPIENT != 0 {
            if pos + 17 > buf.len() {
                return Err(PivError::InvalidData("truncated box recipient".into()));
            }
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&buf[pos..pos + 16]);
            pos += 16;
            let slot = SlotId::from_wire_id(buf[pos])?;
            pos += 1;
            (Some(guid), Some(slot))
        } else {
            (None, None)
        };

        let (cipher, kdf) = if version >= 2 {
            let cipher = read_lenpfx(buf, &mut pos)?;
            let kdf = read_lenpfx(buf, &mut pos)?;
            (
                String::from_utf8_lossy(&cipher).into_owned(),
                String::from_utf8_lossy(&kdf).into_owned(),
            )
        } else {
            (DEFAULT_CIPHER.to_string(), DEFAULT_KDF.to_string())
        };

        let recipient_raw = read_lenpfx(buf, &mut pos)?;
        let ephemeral_raw = read_lenpfx(buf, &mut pos)?;
        let (recipient_pubkey, ephemeral_pubkey) = if version >= 2 {
            (
                pubkey::ssh_wire_to_p256_point(&recipient_raw).unwrap_or(recipient_raw),
                pubkey::ssh_wire_to_p256_point(&ephemeral_raw).unwrap_or(ephemeral_raw),
            )
        } else {
            (recipient_raw, ephemeral_raw)
        };
        let nonce = read_lenpfx(buf, &mut pos)?;
        let ciphertext = read_lenpfx(buf, &mut pos)?;

        Ok(EcdhBox {
            version,
            recipient_guid,
            recipient_slot,
            recipient_pubkey,
            ephemeral_pubkey,
            cipher,
            kdf,
            nonce,
            ciphertext,
            plaintext: None,
        })
    }
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let digest = Sha512::digest(shared_secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

fn write_lenpfx(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_lenpfx(buf: &[u8], pos: &mut usize) -> PivResult<Vec<u8>> {
    if *pos + 4 > buf.len() {
        return Err(PivError::InvalidData("truncated length-prefixed field".into()));
    }
    let len = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]) as usize;
    *pos += 4;
    if *pos + len > buf.len() {
        return Err(PivError::InvalidData("length-prefixed field runs past end".into()));
    }
    let value = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(value)
}

/// Search `tokens` for one whose GUID matches the box's recorded
/// recipient (or GUID prefix), confirming the slot's live public key
/// still matches what the box names.
pub fn find_token<'a>(tokens: &'a mut [Token], ebox: &EcdhBox) -> PivResult<&'a mut Token> {
    let guid = ebox
        .recipient_guid
        .ok_or_else(|| PivError::NotFound("box does not name a recipient token".into()))?;
    let slot = ebox
        .recipient_slot
        .ok_or_else(|| PivError::NotFound("box does not name a recipient slot".into()))?;

    let found = tokens.iter_mut().find(|t| t.guid == Some(guid));
    let token = found.ok_or_else(|| PivError::NotFound("no token with matching GUID".into()))?;
    token.read_cert(slot)?;
    let live_key = token
        .get_slot(slot)
        .and_then(|s| s.public_key.clone())
        .ok_or_else(|| PivError::NotFound("slot has no public key".into()))?;
    if live_key != ebox.recipient_pubkey {
        return Err(PivError::NotFound("token's slot key does not match box recipient".into()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_offline_roundtrip() {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let pubkey = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let mut ebox = EcdhBox::seal(b"hello", &pubkey, None).unwrap();
        let opened = ebox.open_offline(&secret).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn binary_roundtrip_is_deterministic() {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let pubkey = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let ebox = EcdhBox::seal(b"payload", &pubkey, Some(([7u8; 16], SlotId::Authentication))).unwrap();
        let bytes = ebox.to_binary();
        let parsed = EcdhBox::from_binary(&bytes).unwrap();
        assert_eq!(parsed.to_binary(), bytes);
        assert_eq!(parsed.recipient_guid, Some([7u8; 16]));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let pubkey = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let mut ebox = EcdhBox::seal(b"hello", &pubkey, None).unwrap();
        ebox.ciphertext[0] ^= 0x01;
        assert!(ebox.open_offline(&secret).is_err());
    }

    #[test]
    fn version_1_synthesizes_default_cipher_and_kdf() {
        let secret = SecretKey::random(&mut rand::thread_rng());
        let pubkey = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let ebox = EcdhBox::seal(b"v1", &pubkey, None).unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(1);
        buf.push(0);
        write_lenpfx(&mut buf, &ebox.recipient_pubkey);
        write_lenpfx(&mut buf, &ebox.ephemeral_pubkey);
        write_lenpfx(&mut buf, &ebox.nonce);
        write_lenpfx(&mut buf, &ebox.ciphertext);

        let parsed = EcdhBox::from_binary(&buf).unwrap();
        assert_eq!(parsed.cipher, DEFAULT_CIPHER);
        assert_eq!(parsed.kdf, DEFAULT_KDF);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; 10];
        assert!(EcdhBox::from_binary(&buf).is_err());
    }
}
