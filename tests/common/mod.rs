//! A stateful PIV card simulator used by the crate-level integration tests.
//!
//! The unit tests sprinkled through `src/` use a scripted FIFO transport
//! that just replays canned replies — good enough to exercise one function
//! at a time, but not a full multi-step flow (PIN retries, admin
//! authentication, key generation followed by signing). This module plays
//! the part of a minimal but functionally real PIV applet: it tracks PIN
//! and admin-key state, generates and stores key material, and answers
//! `GEN_AUTH` with actual cryptography so a generated key's signature can
//! be verified end to end.
//!
//! It is intentionally not a general APDU interpreter — only the command
//! shapes this crate's `commands`/`token` modules actually send.

use std::collections::HashMap;

use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

use piv::apdu::CardTransport;
use piv::error::{PivError, PivResult};
use piv::tlv::{self, TlvWriter};

pub const DEFAULT_ADMIN_KEY: [u8; 24] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16,
    0x17, 0x18, 0x19, 0x20, 0x21, 0x22, 0x23, 0x24,
];

const DEFAULT_PIN_RETRIES: u8 = 3;
const DEFAULT_PUK_RETRIES: u8 = 3;

const INS_SELECT: u8 = 0xA4;
const INS_GET_DATA: u8 = 0xCB;
const INS_PUT_DATA: u8 = 0xDB;
const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_RESET_RETRY: u8 = 0x2C;
const INS_GEN_AUTH: u8 = 0x87;
const INS_GEN_ASYM: u8 = 0x47;
const INS_GET_VERSION: u8 = 0xFD;
const INS_YK_RESET: u8 = 0xFB;

const ADMIN_SLOT: u8 = 0x9B;

fn threedes_encrypt(key: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = TdesEde3::new_from_slice(key).expect("valid 3DES key");
    let mut b = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut b);
    let mut out = [0u8; 8];
    out.copy_from_slice(&b);
    out
}

fn threedes_decrypt(key: &[u8], block: &[u8]) -> [u8; 8] {
    let cipher = TdesEde3::new_from_slice(key).expect("valid 3DES key");
    let mut b = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut b);
    let mut out = [0u8; 8];
    out.copy_from_slice(&b);
    out
}

fn strip_ff_padding(padded: &[u8; 8]) -> String {
    let end = padded.iter().position(|&b| b == 0xFF).unwrap_or(8);
    String::from_utf8_lossy(&padded[..end]).into_owned()
}

/// One slot's live key material, as held by the simulated card.
enum SlotKey {
    Ec(SecretKey),
}

fn sw_bytes(data: &mut Vec<u8>, sw: u16) -> PivResult<Vec<u8>> {
    data.push((sw >> 8) as u8);
    data.push((sw & 0xFF) as u8);
    Ok(std::mem::take(data))
}

/// Splits an inbound APDU wire frame back into header fields and command
/// data, matching exactly what [`piv::apdu::Command::to_bytes`] produces: a
/// command is either header-only, header+Le, or header+Lc+data[+Le]. Every
/// payload this crate ever sends fits short form, so a single-byte Lc is
/// all that needs to be handled.
fn split_command(command: &[u8]) -> (u8, u8, u8, u8, Vec<u8>) {
    let cla = command[0];
    let ins = command[1];
    let p1 = command[2];
    let p2 = command[3];
    let rest = &command[4..];
    if rest.len() <= 1 {
        return (cla, ins, p1, p2, Vec::new());
    }
    let lc = rest[0] as usize;
    let data = rest[1..1 + lc].to_vec();
    (cla, ins, p1, p2, data)
}

pub struct ScriptedCard {
    pub pin: String,
    pub pin_retries: u8,
    pub pin_verified: bool,
    pub puk: String,
    pub puk_retries: u8,
    pub admin_key: Vec<u8>,
    pub admin_witness: Option<[u8; 8]>,
    pub reset_allowed: bool,
    pub is_yk: bool,
    objects: HashMap<Vec<u8>, Vec<u8>>,
    slots: HashMap<u8, SlotKey>,
}

impl ScriptedCard {
    pub fn new() -> Self {
        ScriptedCard {
            pin: "123456".to_string(),
            pin_retries: DEFAULT_PIN_RETRIES,
            pin_verified: false,
            puk: "12345678".to_string(),
            puk_retries: DEFAULT_PUK_RETRIES,
            admin_key: DEFAULT_ADMIN_KEY.to_vec(),
            admin_witness: None,
            reset_allowed: false,
            is_yk: false,
            objects: HashMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Seed a data object (e.g. CHUID) as the raw content that belongs
    /// inside the `53` wrapper `GET DATA` returns. The Discovery Object
    /// (tag `7E`) is the exception: it is returned as its own top-level
    /// template rather than wrapped in `53`, so its seeded content should
    /// already be the full `7E` TLV (see `discovery_object`).
    pub fn put_object(&mut self, tag: &[u8], content: Vec<u8>) {
        self.objects.insert(tag.to_vec(), content);
    }

    fn get_data(&self, tag: &[u8]) -> PivResult<Vec<u8>> {
        let content = self
            .objects
            .get(tag)
            .ok_or_else(|| PivError::NotFound(format!("no object for tag {tag:02X?}")))?;
        if tag == [0x7E] {
            return Ok(content.clone());
        }
        let mut out = Vec::new();
        out.push(0x53);
        tlv::encode_length(content.len(), &mut out);
        out.extend_from_slice(content);
        Ok(out)
    }

    fn put_data(&mut self, data: &[u8]) -> PivResult<()> {
        let items = tlv::parse_all(data)?;
        let tag = tlv::find(&items, &[0x5C])
            .ok_or_else(|| PivError::InvalidData("PUT DATA missing tag 5C".into()))?
            .value
            .clone();
        let wrapper = tlv::find(&items, &[0x53])
            .ok_or_else(|| PivError::InvalidData("PUT DATA missing tag 53".into()))?
            .value
            .clone();
        self.objects.insert(tag, wrapper);
        Ok(())
    }

    fn handle_verify(&mut self, p2: u8, data: &[u8]) -> PivResult<Vec<u8>> {
        let mut out = Vec::new();
        if p2 != 0x80 {
            return sw_bytes(&mut out, 0x6A86);
        }
        if data.is_empty() {
            if self.pin_verified {
                return sw_bytes(&mut out, 0x9000);
            }
            return sw_bytes(&mut out, 0x63C0 | self.pin_retries as u16);
        }
        let submitted = strip_ff_padding(&data.try_into().map_err(|_| {
            PivError::InvalidData("VERIFY data not 8 bytes".into())
        })?);
        if submitted == self.pin {
            self.pin_retries = DEFAULT_PIN_RETRIES;
            self.pin_verified = true;
            sw_bytes(&mut out, 0x9000)
        } else {
            self.pin_verified = false;
            self.pin_retries = self.pin_retries.saturating_sub(1);
            sw_bytes(&mut out, 0x63C0 | self.pin_retries as u16)
        }
    }

    fn handle_change_reference(&mut self, data: &[u8]) -> PivResult<Vec<u8>> {
        let mut out = Vec::new();
        if data.len() != 16 {
            return sw_bytes(&mut out, 0x6A80);
        }
        let old: [u8; 8] = data[..8].try_into().unwrap();
        let new: [u8; 8] = data[8..].try_into().unwrap();
        if strip_ff_padding(&old) == self.pin {
            self.pin = strip_ff_padding(&new);
            self.pin_retries = DEFAULT_PIN_RETRIES;
            sw_bytes(&mut out, 0x9000)
        } else {
            self.pin_retries = self.pin_retries.saturating_sub(1);
            sw_bytes(&mut out, 0x63C0 | self.pin_retries as u16)
        }
    }

    fn handle_reset_retry(&mut self, data: &[u8]) -> PivResult<Vec<u8>> {
        let mut out = Vec::new();
        if data.len() != 16 {
            return sw_bytes(&mut out, 0x6A80);
        }
        let puk: [u8; 8] = data[..8].try_into().unwrap();
        let new_pin: [u8; 8] = data[8..].try_into().unwrap();
        if strip_ff_padding(&puk) == self.puk {
            self.pin = strip_ff_padding(&new_pin);
            self.pin_retries = DEFAULT_PIN_RETRIES;
            self.puk_retries = DEFAULT_PUK_RETRIES;
            sw_bytes(&mut out, 0x9000)
        } else {
            self.puk_retries = self.puk_retries.saturating_sub(1);
            sw_bytes(&mut out, 0x63C0 | self.puk_retries as u16)
        }
    }

    fn handle_gen_auth(&mut self, p2: u8, data: &[u8]) -> PivResult<Vec<u8>> {
        let mut out = Vec::new();
        let outer = tlv::parse_all(data)?;
        let dialog = tlv::find(&outer, &[0x7C])
            .ok_or_else(|| PivError::InvalidData("GEN_AUTH request missing tag 7C".into()))?;
        let inner = tlv::parse_all(&dialog.value)?;

        if p2 == ADMIN_SLOT {
            if let Some(challenge) = tlv::find(&inner, &[0x81]) {
                // Step 2: client decrypted our witness (80) and is posing its
                // own challenge (81). Answer with that challenge encrypted.
                let client_witness = tlv::find(&inner, &[0x80])
                    .ok_or_else(|| PivError::InvalidData("missing decrypted witness".into()))?;
                if self.admin_witness != Some(client_witness.value.as_slice().try_into().unwrap_or([0; 8])) {
                    return sw_bytes(&mut out, 0x6982);
                }
                let challenge: [u8; 8] = challenge.value.as_slice().try_into().unwrap_or([0; 8]);
                let response = threedes_encrypt(&self.admin_key, &challenge);
                let mut w = TlvWriter::new();
                w.open(&[0x7C]);
                w.write(&[0x82], &response);
                w.close()?;
                out.extend_from_slice(&w.finish()?);
                return sw_bytes(&mut out, 0x9000);
            }
            // Step 1: witness request.
            let witness_plain = [0xAAu8; 8];
            self.admin_witness = Some(witness_plain);
            let witness_cipher = threedes_encrypt(&self.admin_key, &witness_plain);
            let mut w = TlvWriter::new();
            w.open(&[0x7C]);
            w.write(&[0x80], &witness_cipher);
            w.close()?;
            out.extend_from_slice(&w.finish()?);
            return sw_bytes(&mut out, 0x9000);
        }

        let slot_key = self
            .slots
            .get(&p2)
            .ok_or_else(|| PivError::NotFound(format!("slot {p2:02X} has no key")))?;
        let SlotKey::Ec(secret) = slot_key;

        if let Some(peer) = tlv::find(&inner, &[0x85]) {
            let peer_pub = PublicKey::from_sec1_bytes(&peer.value)
                .map_err(|e| PivError::InvalidData(format!("bad peer point: {e}")))?;
            let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_pub.as_affine());
            let mut w = TlvWriter::new();
            w.open(&[0x7C]);
            w.write(&[0x82], shared.raw_secret_bytes().as_slice());
            w.close()?;
            out.extend_from_slice(&w.finish()?);
            return sw_bytes(&mut out, 0x9000);
        }

        let input = tlv::find(&inner, &[0x81])
            .ok_or_else(|| PivError::InvalidData("GEN_AUTH sign request missing tag 81".into()))?;
        let signing_key = SigningKey::from(secret);
        let sig: p256::ecdsa::Signature = signing_key
            .sign_prehash(&input.value)
            .map_err(|e| PivError::InvalidData(format!("prehash sign failed: {e}")))?;
        let mut w = TlvWriter::new();
        w.open(&[0x7C]);
        w.write(&[0x82], &sig.to_bytes());
        w.close()?;
        out.extend_from_slice(&w.finish()?);
        sw_bytes(&mut out, 0x9000)
    }

    fn handle_gen_asym(&mut self, p2: u8) -> PivResult<Vec<u8>> {
        let mut out = Vec::new();
        let secret = SecretKey::random(&mut rand::thread_rng());
        let point = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        self.slots.insert(p2, SlotKey::Ec(secret));

        let mut w = TlvWriter::new();
        w.open(&[0x7F, 0x49]);
        w.write(&[0x86], &point);
        w.close()?;
        out.extend_from_slice(&w.finish()?);
        sw_bytes(&mut out, 0x9000)
    }
}

impl Default for ScriptedCard {
    fn default() -> Self {
        Self::new()
    }
}

impl CardTransport for ScriptedCard {
    fn transmit(&mut self, command: &[u8]) -> PivResult<Vec<u8>> {
        let (_cla, ins, _p1, p2, data) = split_command(command);
        match ins {
            INS_SELECT => {
                let mut out = Vec::new();
                sw_bytes(&mut out, 0x9000)
            }
            INS_GET_DATA => {
                let items = tlv::parse_all(&data)?;
                let tag = tlv::find(&items, &[0x5C])
                    .ok_or_else(|| PivError::InvalidData("GET DATA missing tag 5C".into()))?
                    .value
                    .clone();
                match self.get_data(&tag) {
                    Ok(mut body) => sw_bytes(&mut body, 0x9000),
                    Err(_) => {
                        let mut out = Vec::new();
                        sw_bytes(&mut out, 0x6A82)
                    }
                }
            }
            INS_PUT_DATA => {
                self.put_data(&data)?;
                let mut out = Vec::new();
                sw_bytes(&mut out, 0x9000)
            }
            INS_VERIFY => self.handle_verify(p2, &data),
            INS_CHANGE_REFERENCE => self.handle_change_reference(&data),
            INS_RESET_RETRY => self.handle_reset_retry(&data),
            INS_GEN_AUTH => self.handle_gen_auth(p2, &data),
            INS_GEN_ASYM => self.handle_gen_asym(p2),
            INS_GET_VERSION => {
                let mut out = Vec::new();
                if self.is_yk {
                    out.extend_from_slice(&[5, 4, 3]);
                    sw_bytes(&mut out, 0x9000)
                } else {
                    sw_bytes(&mut out, 0x6D00)
                }
            }
            INS_YK_RESET => {
                let mut out = Vec::new();
                if self.reset_allowed {
                    sw_bytes(&mut out, 0x9000)
                } else {
                    sw_bytes(&mut out, 0x6985)
                }
            }
            other => {
                let mut out = Vec::new();
                let _ = other;
                sw_bytes(&mut out, 0x6D00)
            }
        }
    }
}

/// Build a CHUID object body (inside the `53` wrapper) carrying the given
/// GUID, an arbitrary FASC-N, and a signed indicator.
pub fn chuid_object(guid: [u8; 16]) -> Vec<u8> {
    let mut w = TlvWriter::new();
    w.write(&[0x30], &[0xAAu8; 25]);
    w.write(&[0x34], &guid);
    w.write(&[0x35], &[0x00; 8]);
    w.write(&[0x3E], &[0x01]);
    w.write(&[0xFE], &[]);
    w.finish().unwrap()
}

/// Build a Discovery object: the full `7E` template (not wrapped in `53`,
/// unlike every other data object) wrapping a PIN Usage Policy (`5F2F`)
/// signaling PIV PIN support.
pub fn discovery_object() -> Vec<u8> {
    let mut inner = TlvWriter::new();
    inner.write(&[0x5F, 0x2F], &[0x20, 0x00]);
    let inner_bytes = inner.finish().unwrap();
    let mut w = TlvWriter::new();
    w.write(&[0x7E], &inner_bytes);
    w.finish().unwrap()
}

/// Build a Key History object body.
pub fn key_history_object(on_card: u8, off_card: u8, url: Option<&str>) -> Vec<u8> {
    let mut w = TlvWriter::new();
    w.write(&[0xC1], &[on_card]);
    w.write(&[0xC2], &[off_card]);
    if let Some(url) = url {
        w.write(&[0xF3], url.as_bytes());
    }
    w.finish().unwrap()
}
