use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Identity of a test executor holding a set of servers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one server: its owner, and its position in the owner's list of servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub owner: OwnerId,
    pub seq: usize,
}

impl ServerId {
    pub fn new(owner: OwnerId, seq: usize) -> Self {
        Self { owner, seq }
    }

    /// Name of the server within its owner, e.g. `s0`.
    pub fn short_name(&self) -> String {
        format!("s{}", self.seq)
    }

    /// Replication server id. Unique among the servers of one owner, and never zero.
    pub fn replication_id(&self) -> u32 {
        self.seq as u32 + 1
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.s{}", self.owner, self.seq)
    }
}

#[cfg(test)]
mod test {
    use super::{OwnerId, ServerId};

    #[test]
    fn server_names() {
        let id = ServerId::new(OwnerId::from("bot3"), 2);
        assert_eq!(id.to_string(), "bot3.s2");
        assert_eq!(id.short_name(), "s2");
        assert_eq!(id.replication_id(), 3);
    }
}
