//! The `Token` object: one connected PIV card and everything learned about
//! it by selecting the applet and reading its well-known data objects.
//!
//! It owns the transport, tracks negotiated capabilities and verified
//! security status, and exposes connect / operate / teardown as one
//! object so callers never juggle a raw transport and card state
//! separately.

use std::collections::HashSet;

use crate::apdu::{self, CardTransport, Command};
use crate::error::{PivError, PivResult};
use crate::slot::{Slot, SlotId};
use crate::tlv;
use crate::transport::{self, PcscTransport};

pub const PIV_AID: [u8; 9] = [0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00];

const INS_SELECT: u8 = 0xA4;
const INS_GET_DATA: u8 = 0xCB;
const INS_GET_VERSION: u8 = 0xFD;
const INS_GET_SERIAL: u8 = 0xF8;

const TAG_CHUID: [u8; 3] = [0x5F, 0xC1, 0x02];
const TAG_DISCOVERY: [u8; 1] = [0x7E];
const TAG_KEY_HISTORY: [u8; 3] = [0x5F, 0xC1, 0x0C];

/// On/off-card certificate counts from the Key History object (tag
/// `5FC10C`), plus the optional URL for off-card certificates.
#[derive(Debug, Clone, Default)]
pub struct KeyHistory {
    pub on_card_certs: u8,
    pub off_card_certs: u8,
    pub off_card_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinId {
    Piv,
    Global,
    Puk,
}

impl PinId {
    pub fn wire_id(self) -> u8 {
        match self {
            PinId::Piv => 0x80,
            PinId::Global => 0x00,
            PinId::Puk => 0x81,
        }
    }
}

/// A connected PIV token.
pub struct Token {
    pub reader: String,
    transport: Box<dyn CardTransport>,
    in_txn: bool,
    pub guid: Option<[u8; 16]>,
    pub fascn: Option<Vec<u8>>,
    pub has_chuid: bool,
    pub has_signed_chuid: bool,
    pub has_vci: bool,
    pub is_yk: bool,
    pub yk_version: Option<(u8, u8, u8)>,
    pub yk_serial: Option<u32>,
    pub supports_extended_length: bool,
    pub key_history: Option<KeyHistory>,
    pub auth_methods: Vec<PinId>,
    slots: Vec<Slot>,
    verified_pins: HashSet<u8>,
    admin_authenticated: bool,
}

impl Token {
    /// Wrap an already-connected transport. `enumerate`/`find` use this
    /// internally for each reader with a card present.
    pub fn new(reader: impl Into<String>, transport: Box<dyn CardTransport>) -> Self {
        Token {
            reader: reader.into(),
            transport,
            in_txn: false,
            guid: None,
            fascn: None,
            has_chuid: false,
            has_signed_chuid: false,
            has_vci: false,
            is_yk: false,
            yk_version: None,
            yk_serial: None,
            supports_extended_length: false,
            key_history: None,
            auth_methods: Vec::new(),
            slots: Vec::new(),
            verified_pins: HashSet::new(),
            admin_authenticated: false,
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn CardTransport {
        &mut *self.transport
    }

    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    pub fn is_pin_verified(&self, pin: PinId) -> bool {
        self.verified_pins.contains(&pin.wire_id())
    }

    pub(crate) fn mark_pin_verified(&mut self, pin: PinId) {
        self.verified_pins.insert(pin.wire_id());
    }

    pub(crate) fn clear_pin_verified(&mut self, pin: PinId) {
        self.verified_pins.remove(&pin.wire_id());
    }

    pub fn is_admin_authenticated(&self) -> bool {
        self.admin_authenticated
    }

    pub(crate) fn set_admin_authenticated(&mut self, value: bool) {
        self.admin_authenticated = value;
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get_slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub(crate) fn upsert_slot(&mut self, slot: Slot) {
        if let Some(existing) = self.slots.iter_mut().find(|s| s.id == slot.id) {
            *existing = slot;
        } else {
            self.slots.push(slot);
        }
    }

    pub fn force_slot(&mut self, id: SlotId, algorithm: crate::algorithm::AlgorithmId) {
        self.upsert_slot(Slot::force(id, algorithm));
    }

    /// Begin an exclusive transaction. Required before any command.
    pub fn txn_begin(&mut self) -> PivResult<()> {
        self.transport.txn_begin()?;
        self.in_txn = true;
        Ok(())
    }

    /// End the exclusive transaction.
    pub fn txn_end(&mut self) -> PivResult<()> {
        self.transport.txn_end()?;
        self.in_txn = false;
        Ok(())
    }

    /// Select the PIV applet. The card resets its security status on
    /// applet (re)selection, so the verified/admin-authenticated flags are
    /// cleared here regardless of what the card reports.
    pub fn select(&mut self) -> PivResult<()> {
        let cmd = Command::new(INS_SELECT, 0x04, 0x00, PIV_AID.to_vec());
        let resp = apdu::transceive(&mut *self.transport, &cmd)?;
        resp.into_result("select PIV applet")?;
        self.verified_pins.clear();
        self.admin_authenticated = false;
        Ok(())
    }

    /// Issue GET DATA and return the raw reply, without unwrapping it from
    /// the `53` dynamic-object template. Most PIV data objects are returned
    /// that way, but a couple — the Discovery Object chief among them — are
    /// returned as their own top-level template instead, so callers that
    /// need those must parse the raw reply themselves.
    fn get_data_raw(&mut self, tag: &[u8]) -> PivResult<Vec<u8>> {
        let mut data = Vec::new();
        data.push(0x5C);
        data.push(tag.len() as u8);
        data.extend_from_slice(tag);
        let cmd = Command::new(INS_GET_DATA, 0x3F, 0xFF, data);
        let resp = apdu::transceive(&mut *self.transport, &cmd)?;
        resp.into_result("get data")
    }

    fn get_data(&mut self, tag: &[u8]) -> PivResult<Vec<u8>> {
        let bytes = self.get_data_raw(tag)?;
        let items = tlv::parse_all(&bytes)?;
        let wrapper = tlv::find(&items, &[0x53])
            .ok_or_else(|| PivError::InvalidData("GET DATA reply missing tag 53".into()))?;
        Ok(wrapper.value.clone())
    }

    /// Read CHUID, Discovery, and Key History objects and populate the
    /// token's capability fields. Tolerates absent objects (not every card
    /// carries all of them).
    pub fn probe(&mut self) -> PivResult<()> {
        if let Ok(chuid) = self.get_data(&TAG_CHUID) {
            let items = tlv::parse_all(&chuid)?;
            if let Some(fascn) = tlv::find(&items, &[0x30]) {
                self.fascn = Some(fascn.value.clone());
            }
            if let Some(guid) = tlv::find(&items, &[0x34]) {
                if guid.value.len() == 16 {
                    let mut g = [0u8; 16];
                    g.copy_from_slice(&guid.value);
                    self.guid = Some(g);
                }
            }
            self.has_signed_chuid = tlv::find(&items, &[0x3E]).is_some();
            self.has_chuid = true;
        }

        // The Discovery Object is returned as a bare `7E` template, not
        // wrapped in `53` like other data objects, so it's read with
        // `get_data_raw` and parsed directly.
        if let Ok(discovery) = self.get_data_raw(&TAG_DISCOVERY) {
            let items = tlv::parse_all(&discovery)?;
            if let Some(policy) = tlv::find(&items, &[0x7E]) {
                let inner = tlv::parse_all(&policy.value).unwrap_or_default();
                if let Some(pin_policy) = tlv::find(&inner, &[0x5F, 0x2F]) {
                    if pin_policy.value.len() >= 2 {
                        self.has_vci = pin_policy.value[1] & 0x08 != 0;
                        self.auth_methods.clear();
                        if pin_policy.value[0] & 0x40 != 0 {
                            self.auth_methods.push(PinId::Global);
                        }
                        if pin_policy.value[0] & 0x20 != 0 {
                            self.auth_methods.push(PinId::Piv);
                        }
                    }
                }
            }
        }

        if let Ok(kh) = self.get_data(&TAG_KEY_HISTORY) {
            let items = tlv::parse_all(&kh)?;
            let on_card = tlv::find(&items, &[0xC1]).and_then(|t| t.value.first().copied()).unwrap_or(0);
            let off_card = tlv::find(&items, &[0xC2]).and_then(|t| t.value.first().copied()).unwrap_or(0);
            let url = tlv::find(&items, &[0xF3])
                .map(|t| String::from_utf8_lossy(&t.value).into_owned());
            self.key_history = Some(KeyHistory {
                on_card_certs: on_card,
                off_card_certs: off_card,
                off_card_url: url,
            });
        }

        self.supports_extended_length = self
            .transport
            .atr()
            .map(|atr| transport::atr_signals_extended_length(&atr))
            .unwrap_or(false);

        self.probe_yk();
        Ok(())
    }

    fn probe_yk(&mut self) {
        let cmd = Command::new(INS_GET_VERSION, 0x00, 0x00, Vec::new());
        if let Ok(resp) = apdu::transceive(&mut *self.transport, &cmd) {
            if let Ok(bytes) = resp.into_result("get version") {
                if bytes.len() >= 3 {
                    self.is_yk = true;
                    self.yk_version = Some((bytes[0], bytes[1], bytes[2]));
                    if (bytes[0], bytes[1]) >= (5, 0) {
                        let cmd = Command::new(INS_GET_SERIAL, 0x00, 0x00, Vec::new());
                        if let Ok(resp) = apdu::transceive(&mut *self.transport, &cmd) {
                            if let Ok(bytes) = resp.into_result("get serial") {
                                if bytes.len() == 4 {
                                    self.yk_serial = Some(u32::from_be_bytes([
                                        bytes[0], bytes[1], bytes[2], bytes[3],
                                    ]));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read and cache a slot's certificate, creating the `Slot` entry if
    /// this is the first time it has been seen.
    pub fn read_cert(&mut self, id: SlotId) -> PivResult<&Slot> {
        let tag = id.cert_tag()?;
        let raw = self.get_data(&tag).map_err(|e| match e {
            PivError::NotFound(_) => PivError::NotFound(format!("no certificate in slot {:02X}", id.wire_id())),
            other => other,
        })?;
        let items = tlv::parse_all(&raw)?;
        let cert_tlv = tlv::find(&items, &[0x70])
            .ok_or_else(|| PivError::InvalidData("certificate object missing tag 70".into()))?;
        let cert_info = tlv::find(&items, &[0x71]).and_then(|t| t.value.first().copied()).unwrap_or(0);
        let compressed = cert_info & 0x01 != 0;
        let cert_der = if compressed {
            decompress_gzip(&cert_tlv.value)?
        } else {
            cert_tlv.value.clone()
        };
        let mut slot = Slot::with_certificate(id, cert_der)?;
        slot.compressed = compressed;
        slot.pin_to_use = cert_info & 0x04 != 0;
        slot.touch_to_use = cert_info & 0x02 != 0;
        self.upsert_slot(slot);
        Ok(self.get_slot(id).expect("just inserted"))
    }

    /// Read every standard and YK retired slot's certificate, tolerating
    /// absent ones.
    pub fn read_all_certs(&mut self) -> PivResult<()> {
        let ids: Vec<SlotId> = SlotId::standard().into_iter().chain(SlotId::all_retired()).collect();
        for id in ids {
            match self.read_cert(id) {
                Ok(_) => {}
                Err(PivError::NotFound(_)) | Err(PivError::NotSupported(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn decompress_gzip(data: &[u8]) -> PivResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| PivError::InvalidData(format!("gzip decompress failed: {e}")))?;
    Ok(out)
}

/// Enumerate every reader with a card present, select the PIV applet, and
/// probe capabilities. Readers without an accessible PIV applet are
/// skipped rather than failing the whole enumeration.
pub fn enumerate(ctx: &pcsc::Context) -> PivResult<Vec<Token>> {
    let mut tokens = Vec::new();
    for reader in transport::list_readers_with_card(ctx)? {
        let pcsc = match PcscTransport::connect(ctx, &reader) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let mut token = Token::new(reader, Box::new(pcsc));
        if token.txn_begin().is_err() {
            continue;
        }
        if token.select().is_err() {
            let _ = token.txn_end();
            continue;
        }
        let _ = token.probe();
        tokens.push(token);
    }
    Ok(tokens)
}

/// Find the token whose GUID starts with `guid_prefix`. Ambiguous when more
/// than one token matches and the prefix is shorter than a full GUID.
pub fn find(ctx: &pcsc::Context, guid_prefix: &[u8]) -> PivResult<Token> {
    let tokens = enumerate(ctx)?;
    pick_by_guid_prefix(tokens, guid_prefix)
}

/// The matching half of [`find`], split out so it can be exercised against
/// a list of already-constructed tokens without a live reader context.
pub fn pick_by_guid_prefix(mut tokens: Vec<Token>, guid_prefix: &[u8]) -> PivResult<Token> {
    let matches: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.guid
                .map(|g| g.starts_with(guid_prefix) || guid_prefix.starts_with(&g[..]))
                .unwrap_or(false)
        })
        .map(|(i, _)| i)
        .collect();
    match matches.len() {
        0 => Err(PivError::NotFound("no token with matching GUID".into())),
        1 => Ok(tokens.swap_remove(matches[0])),
        _ if guid_prefix.len() == 16 => Err(PivError::InvalidData(
            "multiple tokens reported the same GUID".into(),
        )),
        _ => Err(PivError::Duplicate(format!(
            "{} tokens match GUID prefix {}",
            matches.len(),
            hex::encode(guid_prefix)
        ))),
    }
}
