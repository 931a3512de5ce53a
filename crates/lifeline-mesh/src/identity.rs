//! Peer ids and shareable connection codes.

use std::net::SocketAddr;

use rand::Rng;

use crate::{now_millis, Result, TransportError};

const ID_PREFIX: &str = "ll";
const SUFFIX_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Keep `requested` if it is non-empty, otherwise generate
/// `ll-{unix_ms}-{6 base36 chars}`.
///
/// There is no central allocator; the timestamp plus random suffix keeps
/// independently started nodes apart.
pub fn assign_peer_id(requested: Option<String>) -> String {
    match requested {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            let mut rng = rand::thread_rng();
            let suffix: String = (0..SUFFIX_LEN)
                .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
                .collect();
            format!("{}-{}-{}", ID_PREFIX, now_millis(), suffix)
        }
    }
}

/// A route to a peer, shareable as an opaque hex string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCode {
    pub peer_id: String,
    pub addr: SocketAddr,
}

impl ConnectionCode {
    pub fn new(peer_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            addr,
        }
    }

    /// Hex of `id@addr`.
    pub fn encode(&self) -> String {
        hex::encode(self.route().as_bytes())
    }

    pub fn decode(code: &str) -> Result<Self> {
        let bytes = hex::decode(code.trim())
            .map_err(|e| TransportError::Codec(format!("bad connection code: {}", e)))?;
        let route = String::from_utf8(bytes)
            .map_err(|_| TransportError::Codec("connection code is not utf-8".into()))?;
        Self::parse_route(&route)
    }

    /// Parse a plain `id@host:port` route.
    pub fn parse_route(route: &str) -> Result<Self> {
        let (peer_id, addr) = route
            .rsplit_once('@')
            .ok_or_else(|| TransportError::Codec(format!("route {:?} is not id@addr", route)))?;
        if peer_id.is_empty() {
            return Err(TransportError::Codec(format!("route {:?} has no peer id", route)));
        }
        let addr = addr
            .parse()
            .map_err(|e| TransportError::Codec(format!("bad address in {:?}: {}", route, e)))?;
        Ok(Self::new(peer_id, addr))
    }

    pub fn route(&self) -> String {
        format!("{}@{}", self.peer_id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_supplied_id() {
        assert_eq!(assign_peer_id(Some("alice".into())), "alice");
        assert_eq!(assign_peer_id(Some("  bob ".into())), "bob");
    }

    #[test]
    fn generated_ids_are_distinct_and_shaped() {
        let a = assign_peer_id(None);
        let b = assign_peer_id(Some(String::new()));
        assert_ne!(a, b);

        let parts: Vec<&str> = a.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ll");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2].bytes().all(|c| BASE36.contains(&c)));
    }

    #[test]
    fn code_roundtrip() {
        let code = ConnectionCode::new("ll-1-abcdef", "127.0.0.1:9400".parse().unwrap());
        let encoded = code.encode();
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ConnectionCode::decode(&encoded).unwrap(), code);
    }

    #[test]
    fn route_allows_at_in_id() {
        let code = ConnectionCode::parse_route("me@home@[::1]:9400").unwrap();
        assert_eq!(code.peer_id, "me@home");
        assert_eq!(code.addr.port(), 9400);
    }

    #[test]
    fn malformed_codes_fail() {
        assert!(ConnectionCode::decode("zz").is_err());
        assert!(ConnectionCode::decode(&hex::encode("no-at-sign")).is_err());
        assert!(ConnectionCode::parse_route("@127.0.0.1:1").is_err());
        assert!(ConnectionCode::parse_route("x@not-an-addr").is_err());
    }
}
