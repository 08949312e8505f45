use const_fnv1a_hash::fnv1a_hash_64;
use std::fmt::Display;

/// The overlay identity of a peer. Transport connections are addressed by
/// peer identity rather than by network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Creates a peer ID with the given number.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Creates a pseudorandom peer ID by hashing a human-readable name.
    pub const fn from_string(string: &'static str) -> Self {
        Self(fnv1a_hash_64(string.as_bytes(), None))
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One end of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub peer: PeerId,
    pub port: u16,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.peer, self.port)
    }
}

/// Identifies a connection by the endpoints on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl ConnectionId {
    /// Get a matching connection ID for the remote peer.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
