use std::fmt;

pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unable to find a CONNECT target or Host header in request")]
    MalformedRequest { raw: String },
}

impl ResolveError {
    fn malformed(text: &str) -> Self {
        Self::MalformedRequest {
            raw: text.to_owned(),
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            Self::MalformedRequest { raw } => raw,
        }
    }
}

/// Destination of a proxied connection, derived from the first chunk the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub host: String,
    pub port: u16,
    /// `CONNECT` request: bytes are tunneled without being forwarded first.
    pub is_tunnel: bool,
}

impl TargetInfo {
    /// Parses the destination out of a raw request prefix.
    ///
    /// Only the bytes handed in are inspected; a request line or `Host` header
    /// split across two reads is not resolved.
    pub fn resolve(prefix: &[u8]) -> Result<TargetInfo, ResolveError> {
        let text = String::from_utf8_lossy(prefix);
        let request_line = text.split("\r\n").next().unwrap_or_default();

        let is_tunnel = text.split_whitespace().any(|token| token == "CONNECT");
        let authority = if is_tunnel {
            request_line.split_whitespace().nth(1)
        } else {
            host_header(&text)
        }
        .ok_or_else(|| ResolveError::malformed(&text))?;

        let (host, port) =
            split_authority(authority).ok_or_else(|| ResolveError::malformed(&text))?;
        Ok(TargetInfo {
            host: host.to_owned(),
            port,
            is_tunnel,
        })
    }
}

impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// Header lines count only when CRLF-terminated, so the trailing segment is skipped.
fn host_header(text: &str) -> Option<&str> {
    let mut lines: Vec<&str> = text.split("\r\n").collect();
    lines.pop();
    lines.into_iter().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| value.trim())
    })
}

fn split_authority(authority: &str) -> Option<(&str, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some(_) if authority.ends_with(']') => (authority, DEFAULT_HTTP_PORT),
        Some((host, port)) => (host, port.parse::<u16>().ok().filter(|p| *p != 0)?),
        None => (authority, DEFAULT_HTTP_PORT),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
