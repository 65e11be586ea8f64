//! Common SCPI communication abstractions.
//!
//! Drivers in this crate speak their command sets through [`ScpiTransport`]; the byte-level
//! transport (VISA, GPIB, USBTMC, sockets) is supplied by the embedding application.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;

/// Trait for SCPI communication transports.
///
/// Abstracts the underlying communication mechanism to enable protocol-agnostic
/// SCPI operations.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Open the resource (e.g. `"GPIB0::24::INSTR"`).
    async fn open(&self, resource: &str) -> AppResult<()>;

    /// Close the resource.
    async fn close(&self) -> AppResult<()>;

    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a query command and return the response.
    async fn query(&self, command: &str) -> AppResult<String>;
}

/// Parse one numeric field of a SCPI reply, tolerating a trailing unit letter.
///
/// `"-1.2E-03A"` with unit `'A'` parses to `-0.0012`.
pub fn parse_field(field: &str, unit: char) -> AppResult<f64> {
    let trimmed = field.trim();
    let number = trimmed.strip_suffix(unit).unwrap_or(trimmed);
    number
        .trim()
        .parse::<f64>()
        .map_err(|_| DaqError::fault(format!("Failed to parse instrument response '{}'", trimmed)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields_with_and_without_units() {
        assert_eq!(parse_field("1.5E-03A", 'A').unwrap(), 1.5e-3);
        assert_eq!(parse_field(" +2.000000E-01V", 'V').unwrap(), 0.2);
        assert_eq!(parse_field("3.3", 'V').unwrap(), 3.3);
        assert!(parse_field("OVER", 'A').is_err());
    }
}
