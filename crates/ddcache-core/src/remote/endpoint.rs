use std::fmt;

use crate::errors::{TransferError, TransferResult};

/// Parsed representation of a `grpc://` or `grpcs://` cache endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl CacheEndpoint {
    const PLAINTEXT_SCHEME: &'static str = "grpc";
    const TLS_SCHEME: &'static str = "grpcs";

    /// Parses a `grpc[s]://host:port` style URL.
    ///
    /// The port is mandatory. IPv6 addresses must be wrapped in `[]`
    /// (e.g., `grpc://[::1]:50051`). Anything after the authority is ignored.
    pub fn parse(raw: &str) -> TransferResult<Self> {
        let (scheme, body) = raw.split_once("://").ok_or_else(|| {
            TransferError::invalid_endpoint(format!("cannot parse url {raw:?}"))
        })?;

        let tls = match scheme {
            Self::PLAINTEXT_SCHEME => false,
            Self::TLS_SCHEME => true,
            _ => {
                return Err(TransferError::invalid_endpoint(format!(
                    "scheme must be grpc or grpcs (got {scheme:?})"
                )))
            }
        };

        let authority = match body.find(['/', '?', '#']) {
            Some(idx) => &body[..idx],
            None => body,
        };
        let (host, port) = parse_authority(authority)?;

        Ok(Self { host, port, tls })
    }

    /// `host:port` as the channel expects it; IPv6 hosts keep their brackets.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn use_insecure(&self) -> bool {
        !self.tls
    }

    pub fn channel_uri(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.authority())
    }
}

impl fmt::Display for CacheEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls {
            Self::TLS_SCHEME
        } else {
            Self::PLAINTEXT_SCHEME
        };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

fn parse_authority(authority: &str) -> TransferResult<(String, u16)> {
    if authority.is_empty() {
        return Err(TransferError::invalid_endpoint("url missing host component"));
    }
    if authority.contains('@') {
        return Err(TransferError::invalid_endpoint(
            "url must not carry user information",
        ));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            TransferError::invalid_endpoint(format!("unterminated IPv6 address: {authority}"))
        })?;
        if host.is_empty() {
            return Err(TransferError::invalid_endpoint("url missing host component"));
        }
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| TransferError::invalid_endpoint("must provide a port"))?;
        return Ok((host.to_string(), parse_port(port)?));
    }

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| TransferError::invalid_endpoint("must provide a port"))?;
    if host.is_empty() {
        return Err(TransferError::invalid_endpoint(
            "url missing host before port specification",
        ));
    }
    if host.contains(':') {
        return Err(TransferError::invalid_endpoint(format!(
            "IPv6 hosts must be bracketed: {authority}"
        )));
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_port(raw: &str) -> TransferResult<u16> {
    if raw.is_empty() {
        return Err(TransferError::invalid_endpoint("must provide a port"));
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferError::invalid_endpoint(format!("invalid port '{raw}'")));
    }
    raw.parse::<u16>()
        .map_err(|_| TransferError::invalid_endpoint(format!("invalid port '{raw}'")))
}
