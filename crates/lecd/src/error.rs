//! Error types for the LAN emulation client.
//!
//! No error here is fatal to the client as a whole: the data path and the
//! control path log them and degrade a single frame or a single entry.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information

use crate::types::{AtmAddress, CircuitId, MacAddress};
use thiserror::Error;

/// Errors that can occur in the LE client.
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
#[derive(Debug, Error)]
pub enum LecError {
    /// No cache entry for the MAC address
    #[error("No LE_ARP entry for {0}")]
    EntryNotFound(MacAddress),

    /// No cache entry bound to the ATM address
    #[error("No LE_ARP entry bound to ATM address {0}")]
    AtmAddressNotFound(AtmAddress),

    /// Control channel to the LE service daemon is closed or full
    #[error("Control channel unavailable: {0}")]
    ControlChannel(String),

    /// Circuit refused a frame or is already released
    #[error("Circuit {circuit} unavailable: {reason}")]
    Circuit { circuit: CircuitId, reason: String },

    /// Control message could not be decoded
    /// NIST: SI-10 (Information Input Validation) - Control message validation
    #[error("Malformed control message: {0}")]
    Codec(String),

    /// Control message kind that this side never receives
    #[error("Unexpected control message: {0}")]
    UnexpectedMessage(&'static str),

    /// Data frame too short or otherwise unusable
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Address string could not be parsed
    #[error("Invalid {kind} address: {value}")]
    InvalidAddress { kind: &'static str, value: String },

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timers need a tokio runtime
    #[error("No tokio runtime available: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LecError {
    /// Creates a circuit error.
    pub fn circuit(circuit: CircuitId, reason: impl Into<String>) -> Self {
        Self::Circuit {
            circuit,
            reason: reason.into(),
        }
    }

    /// Creates an invalid address error.
    pub fn invalid_address(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidAddress {
            kind,
            value: value.into(),
        }
    }

    /// Returns true if the failure is transient (retrying later may succeed).
    pub fn is_transient(&self) -> bool {
        matches!(self, LecError::ControlChannel(_) | LecError::Circuit { .. })
    }
}

/// Result type alias for LE client operations
pub type Result<T> = std::result::Result<T, LecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LecError::EntryNotFound(MacAddress([0x02, 0, 0, 0, 0, 1]));
        assert_eq!(err.to_string(), "No LE_ARP entry for 02:00:00:00:00:01");

        let err = LecError::circuit(CircuitId::new(0, 42), "released");
        assert_eq!(err.to_string(), "Circuit 0.42 unavailable: released");
    }

    #[test]
    fn test_is_transient() {
        assert!(LecError::ControlChannel("full".to_string()).is_transient());
        assert!(!LecError::Codec("bad tag".to_string()).is_transient());
    }
}
