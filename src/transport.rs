//! PC/SC-backed card transport.
//!
//! Thin wrapper over the `pcsc` crate's context/card/transaction primitives.
//! Nothing here knows about PIV, it only moves bytes and brackets
//! transactions; APDU framing and card semantics live one layer up.

use crate::apdu::CardTransport;
use crate::error::{PivError, PivResult};
use pcsc::{Attribute, Card, Context, Protocols, Scope, ShareMode, MAX_ATR_SIZE, MAX_BUFFER_SIZE};

/// A connected PC/SC card handle, ready for APDU exchange.
pub struct PcscTransport {
    card: Card,
    in_transaction: bool,
}

impl PcscTransport {
    /// Establish a user-scope context and list connected readers.
    pub fn establish_context() -> PivResult<Context> {
        Context::establish(Scope::User).map_err(PivError::from)
    }

    /// Connect to the named reader, requesting either protocol.
    pub fn connect(ctx: &Context, reader: &str) -> PivResult<Self> {
        let reader_name = std::ffi::CString::new(reader)
            .map_err(|_| PivError::Argument("reader name contains a NUL byte".into()))?;
        let card = ctx.connect(&reader_name, ShareMode::Shared, Protocols::ANY)?;
        Ok(PcscTransport {
            card,
            in_transaction: false,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        if self.in_transaction {
            let _ = self.card.end_transaction(pcsc::Disposition::LeaveCard);
        }
    }
}

impl CardTransport for PcscTransport {
    fn transmit(&mut self, command: &[u8]) -> PivResult<Vec<u8>> {
        let mut reply = [0u8; MAX_BUFFER_SIZE];
        let reply = self.card.transmit(command, &mut reply)?;
        Ok(reply.to_vec())
    }

    fn txn_begin(&mut self) -> PivResult<()> {
        self.card.begin_transaction()?;
        self.in_transaction = true;
        Ok(())
    }

    fn txn_end(&mut self) -> PivResult<()> {
        if self.in_transaction {
            self.card.end_transaction(pcsc::Disposition::LeaveCard)?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn atr(&self) -> PivResult<Vec<u8>> {
        let mut buf = [0u8; MAX_ATR_SIZE];
        let atr = self.card.get_attribute(Attribute::AtrString, &mut buf)?;
        Ok(atr.to_vec())
    }
}

/// Walk an ATR's interface-byte chain (`TD` links) to find where the
/// historical bytes segment starts, then scan it as COMPACT-TLV (ISO/IEC
/// 7816-4 Annex A) for tag `7`, "extended length information". Malformed
/// or short ATRs are treated as "no extended length", not an error — this
/// is an optimization hint, never load-bearing for correctness.
pub fn atr_signals_extended_length(atr: &[u8]) -> bool {
    if atr.is_empty() {
        return false;
    }
    let t0 = atr[0];
    let hist_len = (t0 & 0x0F) as usize;
    let mut pos = 1;
    let mut td = Some(t0);
    while let Some(prev) = td {
        let mut next_td = None;
        if prev & 0x10 != 0 {
            pos += 1; // TAi
        }
        if prev & 0x20 != 0 {
            pos += 1; // TBi
        }
        if prev & 0x40 != 0 {
            pos += 1; // TCi
        }
        if prev & 0x80 != 0 {
            if pos >= atr.len() {
                return false;
            }
            next_td = Some(atr[pos]);
            pos += 1;
        }
        td = next_td;
    }
    if pos + hist_len > atr.len() {
        return false;
    }
    let historical = &atr[pos..pos + hist_len];
    if historical.first() != Some(&0x80) {
        return false; // not COMPACT-TLV historical bytes
    }
    let mut i = 1;
    while i < historical.len() {
        let tag = historical[i] >> 4;
        let len = (historical[i] & 0x0F) as usize;
        i += 1;
        if tag == 0x7 {
            return true;
        }
        i += len;
    }
    false
}

/// List the names of readers currently reporting a card present.
pub fn list_readers_with_card(ctx: &Context) -> PivResult<Vec<String>> {
    let mut buf = Vec::new();
    let readers = ctx.list_readers(&mut buf)?;
    let mut present = Vec::new();
    for reader in readers {
        let name = reader.to_string_lossy().into_owned();
        let status = ctx.status(reader, &[]);
        if status.is_ok() {
            present.push(name);
        }
    }
    Ok(present)
}


#[cfg(test)]
mod tests {
    use super::mock::MockCard;
    use crate::apdu::{self, Command};

    #[test]
    fn mock_card_serves_scripted_replies() {
        let mut card = MockCard::new(vec![vec![0x90, 0x00]]);
        let cmd = Command::new(0xA4, 0x04, 0x00, vec![]);
        let resp = apdu::transceive(&mut card, &cmd).unwrap();
        assert_eq!(resp.sw, 0x9000);
    }

    #[test]
    fn atr_with_no_interface_bytes_has_no_historical_segment_to_scan() {
        // T0 = 0x00: no TAi/TBi/TCi/TDi, zero historical bytes.
        assert!(!super::atr_signals_extended_length(&[0x00]));
    }

    #[test]
    fn atr_historical_bytes_without_compact_tlv_marker_is_false() {
        // T0 = 0x02: two historical bytes, not prefixed with the 0x80
        // COMPACT-TLV category indicator.
        assert!(!super::atr_signals_extended_length(&[0x02, 0x11, 0x22]));
    }

    #[test]
    fn atr_compact_tlv_extended_length_tag_is_detected() {
        // T0 = 0x04: four historical bytes: 0x80 (compact-tlv), then a
        // tag-7/len-2 COMPACT-TLV entry with two filler data bytes.
        let atr = [0x04, 0x80, 0x72, 0xAA, 0xBB];
        assert!(super::atr_signals_extended_length(&atr));
    }

    #[test]
    fn atr_compact_tlv_without_tag_seven_is_false() {
        let atr = [0x04, 0x80, 0x12, 0xAA, 0xBB];
        assert!(!super::atr_signals_extended_length(&atr));
    }

    #[test]
    fn atr_skips_interface_byte_chain_before_historical_bytes() {
        // T0 = 0x11: TA1 present, 1 historical byte. TA1 = 0x96 (no TD
        // chaining). Historical byte alone (0x00) isn't COMPACT-TLV.
        let atr = [0x11, 0x96, 0x00];
        assert!(!super::atr_signals_extended_length(&atr));
    }
}
