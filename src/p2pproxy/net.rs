use std::borrow::Cow;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("expected HOST:PORT, got {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    BadPort(String),
}

/// Normalize a bind/listen address.
///
/// `":PORT"` is accepted as shorthand for "all interfaces" and rewritten to
/// `"0.0.0.0:PORT"`, which Tokio's bind APIs understand.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Checks that `addr` looks like `HOST:PORT` (or `:PORT`) and returns it trimmed.
///
/// Name resolution is left to connect/bind time.
pub fn parse_host_port(addr: &str) -> Result<String, AddrError> {
    let addr = addr.trim();
    let Some((_host, port)) = addr.rsplit_once(':') else {
        return Err(AddrError::MissingPort(addr.to_string()));
    };
    match port.parse::<u16>() {
        Ok(_) => Ok(addr.to_string()),
        Err(_) => Err(AddrError::BadPort(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn parse_host_port_accepts_names_and_ips() {
        assert_eq!(parse_host_port(" example.com:443 ").unwrap(), "example.com:443");
        assert_eq!(parse_host_port("[::1]:22").unwrap(), "[::1]:22");
        assert_eq!(parse_host_port(":9000").unwrap(), ":9000");
    }

    #[test]
    fn parse_host_port_rejects_garbage() {
        assert_eq!(
            parse_host_port("localhost"),
            Err(AddrError::MissingPort("localhost".into()))
        );
        assert_eq!(
            parse_host_port("localhost:http"),
            Err(AddrError::BadPort("localhost:http".into()))
        );
        assert!(parse_host_port("host:70000").is_err());
    }
}
