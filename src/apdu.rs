//! APDU construction, command chaining, and response reassembly.
//!
//! Based on ISO/IEC 7816-4. A command APDU is four header bytes (CLA, INS,
//! P1, P2) plus an optional data field and expected-reply length (Le).
//! Command data over one frame's capacity is chained by setting the CLA
//! chain bit (`0x10`) on every segment but the last; a response signaling
//! `61xx` is continued with `GET RESPONSE` until the terminal `9000`, and a
//! `6Cxx` response is retried once with the corrected Le.

use crate::error::{PivError, PivResult};
use crate::trace;

/// Class byte chain bit (ISO 7816-4 §5.1.1): set on every command segment
/// but the last when a payload spans multiple APDUs.
const CLA_CHAIN: u8 = 0x10;

pub const INS_GET_RESPONSE: u8 = 0xC0;

/// Maximum command data bytes in one short-form APDU.
const SHORT_FORM_MAX: usize = 255;

/// A fully-assembled command APDU ready for a single transceive, or one
/// segment of a chained command.
#[derive(Debug, Clone)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u16>,
}

impl Command {
    pub fn new(ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Command {
            cla: 0x00,
            ins,
            p1,
            p2,
            data,
            le: Some(0x100),
        }
    }

    fn to_bytes(&self, chained: bool) -> Vec<u8> {
        let cla = if chained { self.cla | CLA_CHAIN } else { self.cla };
        let mut out = vec![cla, self.ins, self.p1, self.p2];
        if !self.data.is_empty() {
            if self.data.len() <= SHORT_FORM_MAX {
                out.push(self.data.len() as u8);
            } else {
                out.push(0x00);
                out.push((self.data.len() >> 8) as u8);
                out.push((self.data.len() & 0xFF) as u8);
            }
            out.extend_from_slice(&self.data);
        }
        if !chained {
            if let Some(le) = self.le {
                if le >= 0x100 {
                    out.push(0x00);
                } else {
                    out.push(le as u8);
                }
            }
        }
        out
    }
}

/// A fully reassembled response: the payload with all `61xx` continuations
/// folded in, plus the terminal status word.
#[derive(Debug, Clone)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl Response {
    /// Map the terminal status word into the closed error taxonomy,
    /// returning the reassembled data on `9000`.
    pub fn into_result(self, context: &str) -> PivResult<Vec<u8>> {
        match PivError::from_status_word(self.sw, context) {
            None => Ok(self.data),
            Some(e) => Err(e),
        }
    }
}

/// The transport contract the APDU engine drives. Implemented by the live
/// `pcsc` backend and by an in-memory simulator used in tests.
pub trait CardTransport {
    fn transmit(&mut self, command: &[u8]) -> PivResult<Vec<u8>>;

    /// Begin an exclusive transaction, if the transport has one. A mock
    /// transport with no concept of locking can accept the default no-op.
    fn txn_begin(&mut self) -> PivResult<()> {
        Ok(())
    }

    /// End the exclusive transaction started by `txn_begin`.
    fn txn_end(&mut self) -> PivResult<()> {
        Ok(())
    }

    /// Return the card's ATR, if the transport can retrieve one. Used to
    /// decide whether extended-length APDUs are worth attempting; a
    /// transport with no concept of an ATR (a mock, say) declines.
    fn atr(&self) -> PivResult<Vec<u8>> {
        Err(PivError::NotSupported("transport has no ATR".into()))
    }
}

/// Split `data` into segments of at most `SHORT_FORM_MAX` bytes, send each
/// as a chained command (all but the last with the chain bit set), then
/// perform response reassembly on the final segment's reply.
pub fn transceive(transport: &mut dyn CardTransport, cmd: &Command) -> PivResult<Response> {
    if cmd.data.len() <= SHORT_FORM_MAX {
        return transceive_one(transport, cmd);
    }

    let chunks: Vec<&[u8]> = cmd.data.chunks(SHORT_FORM_MAX).collect();
    let last = chunks.len() - 1;
    let mut final_response = None;
    for (i, chunk) in chunks.iter().enumerate() {
        let segment = Command {
            cla: cmd.cla,
            ins: cmd.ins,
            p1: cmd.p1,
            p2: cmd.p2,
            data: chunk.to_vec(),
            le: if i == last { cmd.le } else { None },
        };
        let resp = transceive_one(transport, &segment)?;
        if i != last && resp.sw != 0x9000 {
            return Ok(resp);
        }
        if i == last {
            final_response = Some(resp);
        }
    }
    Ok(final_response.expect("at least one chunk"))
}

fn transceive_one(transport: &mut dyn CardTransport, cmd: &Command) -> PivResult<Response> {
    let chained = cmd.cla & CLA_CHAIN != 0;
    let wire = cmd.to_bytes(chained);
    trace::trace("->", &wire);
    let reply = transport.transmit(&wire)?;
    trace::trace("<-", &reply);
    if reply.len() < 2 {
        return Err(PivError::InvalidData("reply shorter than status word".into()));
    }
    let split = reply.len() - 2;
    let mut data = reply[..split].to_vec();
    let sw = u16::from_be_bytes([reply[split], reply[split + 1]]);

    match sw {
        0x6100..=0x61FF => {
            let remaining = (sw & 0x00FF) as u8;
            let cont = get_response(transport, remaining)?;
            data.extend_from_slice(&cont.data);
            Ok(Response { data, sw: cont.sw })
        }
        0x6C00..=0x6CFF => {
            let correct_le = (sw & 0x00FF) as u8;
            let mut retry = cmd.clone();
            retry.le = Some(correct_le as u16);
            transceive_one(transport, &retry)
        }
        _ => Ok(Response { data, sw }),
    }
}

fn get_response(transport: &mut dyn CardTransport, le: u8) -> PivResult<Response> {
    let cmd = Command {
        cla: 0x00,
        ins: INS_GET_RESPONSE,
        p1: 0x00,
        p2: 0x00,
        data: Vec::new(),
        le: Some(if le == 0 { 0x100 } else { le as u16 }),
    };
    let wire = cmd.to_bytes(false);
    trace::trace("->", &wire);
    let reply = transport.transmit(&wire)?;
    trace::trace("<-", &reply);
    if reply.len() < 2 {
        return Err(PivError::InvalidData("reply shorter than status word".into()));
    }
    let split = reply.len() - 2;
    let mut data = reply[..split].to_vec();
    let sw = u16::from_be_bytes([reply[split], reply[split + 1]]);
    if let 0x6100..=0x61FF = sw {
        let remaining = (sw & 0x00FF) as u8;
        let cont = get_response(transport, remaining)?;
        data.extend_from_slice(&cont.data);
        return Ok(Response { data, sw: cont.sw });
    }
    Ok(Response { data, sw })
}
