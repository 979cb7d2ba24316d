//! A pure Rust client library for PIV smartcards (NIST SP 800-73-4), built
//! on ISO/IEC 7816-4 APDU transport via `pcsc`.
//!
//! # Example
//!
//! ```no_run
//! use piv::token;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = piv::transport::PcscTransport::establish_context()?;
//! let mut tokens = token::enumerate(&ctx)?;
//! let mut tok = tokens.remove(0);
//! piv::commands::verify_pin(&mut tok, piv::PinId::Piv, "123456", None, true)?;
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod apdu;
pub mod commands;
pub mod ecdh_box;
pub mod error;
pub mod pubkey;
pub mod slot;
pub mod tlv;
pub mod token;
pub mod trace;
pub mod transport;

pub use algorithm::AlgorithmId;
pub use error::{PivError, PivResult};
pub use slot::{Slot, SlotId};
pub use token::{PinId, Token};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
