//! Listen/dial address normalization
//!
//! Accepts either a bare port (`"3307"`) or a `host:port` pair and produces the
//! canonical `host:port` string used for binding and dialing. Bracketed IPv6
//! literals (`"[::1]:8080"`) are accepted as-is.

use thiserror::Error;

/// Host used when only a port is given
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Address resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address '{0}' (expected host:port or a bare port)")]
    InvalidAddress(String),

    #[error("invalid port '{port}' in '{address}' (expected 0-65535)")]
    InvalidPort { address: String, port: String },
}

/// Resolve `input` into a canonical `host:port`.
///
/// A string made only of digits is treated as a port on [`DEFAULT_HOST`].
/// Anything else must split into exactly one host and one port.
pub fn resolve(input: &str) -> Result<String, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::InvalidAddress(input.to_string()));
    }

    if input.bytes().all(|b| b.is_ascii_digit()) {
        check_port(input, input)?;
        return Ok(format!("{}:{}", DEFAULT_HOST, input));
    }

    let (host, port) = split_host_port(input)?;
    if host.is_empty() {
        return Err(AddressError::InvalidAddress(input.to_string()));
    }
    check_port(input, port)?;

    Ok(input.to_string())
}

fn split_host_port(input: &str) -> Result<(&str, &str), AddressError> {
    let invalid = || AddressError::InvalidAddress(input.to_string());

    // [v6]:port
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = tail.strip_prefix(':').ok_or_else(invalid)?;
        if host.is_empty() || port.contains(':') {
            return Err(invalid());
        }
        return Ok((host, port));
    }

    let mut parts = input.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => Ok((host, port)),
        _ => Err(invalid()),
    }
}

fn check_port(address: &str, port: &str) -> Result<u16, AddressError> {
    let invalid = || AddressError::InvalidPort {
        address: address.to_string(),
        port: port.to_string(),
    };

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    port.parse::<u16>().map_err(|_| invalid())
}
