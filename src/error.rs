//! Error types for PIV token operations

use thiserror::Error;

/// PIV client errors
#[derive(Debug, Error)]
pub enum PivError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("card returned status word {sw:04X}: {detail}")]
    Apdu { sw: u16, detail: String },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("ambiguous match: {0}")]
    Duplicate(String),

    #[error("device out of memory: {0}")]
    DeviceOutOfMemory(String),

    #[error("refusing to spend a PIN attempt: {retries} attempts remain, minimum {min} required")]
    MinRetries { retries: u8, min: u8 },

    #[error("reset preconditions not met: {0}")]
    ResetConditions(String),

    #[error("key authentication failed: {0}")]
    KeyAuth(String),
}

impl PivError {
    /// Classify a raw status word into the closed error taxonomy, or `None`
    /// for `9000`/`61xx`/`6Cxx` which are not errors at this layer.
    pub fn from_status_word(sw: u16, context: &str) -> Option<Self> {
        match sw {
            0x9000 => None,
            0x6100..=0x61FF | 0x6C00..=0x6CFF => None,
            0x6982 => Some(PivError::Permission(format!(
                "security status not satisfied ({context})"
            ))),
            0x6983 => Some(PivError::Permission(format!(
                "authentication method blocked ({context})"
            ))),
            0x6985 => Some(PivError::ResetConditions(format!(
                "conditions of use not satisfied ({context})"
            ))),
            0x6A80 => Some(PivError::InvalidData(format!(
                "incorrect parameters in data field ({context})"
            ))),
            0x6A81 | 0x6D00 => Some(PivError::NotSupported(context.to_string())),
            0x6A82 => Some(PivError::NotFound(context.to_string())),
            0x6A84 => Some(PivError::DeviceOutOfMemory(context.to_string())),
            0x6A86 => Some(PivError::Argument(format!(
                "incorrect P1/P2 ({context})"
            ))),
            sw if (sw & 0xFFF0) == 0x63C0 => Some(PivError::Permission(format!(
                "wrong PIN/PUK, {} attempts remaining ({context})",
                sw & 0x000F
            ))),
            sw => Some(PivError::Apdu {
                sw,
                detail: context.to_string(),
            }),
        }
    }
}

/// Result type for PIV operations
pub type PivResult<T> = Result<T, PivError>;
