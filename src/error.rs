//! Error types shared by the register codec, the protocol client and the device.

/// Represents all possible errors that can occur while talking to the charger/inverter.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No response frame arrived within the configured timeout.
    #[error("No response for register {code:#06x} within timeout")]
    Timeout { code: u16 },

    /// The bus handle failed to transmit or receive.
    #[error("Bus transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A received frame was too short to carry a register code.
    #[error("Malformed frame {id:#x}: {len} bytes")]
    MalformedFrame { id: u32, len: usize },

    /// The response carried fewer payload bytes than the register needs.
    #[error("Malformed payload for register {code:#06x}: {len} bytes")]
    MalformedPayload { code: u16, len: usize },

    /// A write value could not be interpreted as a number.
    #[error("Value for register {code:#06x} is not a number")]
    NotANumber { code: u16 },

    /// A clamped write value still does not fit into 16 bits.
    #[error("Value {value} for register {code:#06x} does not fit the register")]
    OutOfRange { code: u16, value: f64 },

    /// Numeric mode identifier outside `0..=2`.
    #[error("Invalid mode value {0}")]
    InvalidMode(u8),

    /// Textual mode name that is not `off`, `charge` or `discharge`.
    #[error("Unknown mode '{0}'")]
    UnknownMode(String),
}

impl Error {
    /// Returns `true` for failures where retrying on the next tick is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Transport(_))
    }
}

/// The result type for all library operations.
pub type Result<T> = std::result::Result<T, Error>;
