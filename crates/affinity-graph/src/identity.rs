//! Identifiers observed by the affinity subsystem.
//!
//! Identities, objects and nodes are opaque 64-bit tokens handed to us by the
//! surrounding server. The graph only ever observes them; it never mints them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Group label carried by a vertex during label propagation.
pub type Label = u64;

/// An application-level actor (player, session, object owner).
///
/// The reserved system class represents work done on behalf of the server
/// itself and never participates in the affinity graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    id: u64,
    system: bool,
}

impl Identity {
    /// An ordinary application identity.
    pub const fn new(id: u64) -> Self {
        Self { id, system: false }
    }

    /// A reserved system identity.
    pub const fn system(id: u64) -> Self {
        Self { id, system: true }
    }

    /// Numeric id of this identity.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether this identity belongs to the reserved system class.
    pub const fn is_system(&self) -> bool {
        self.system
    }

    /// Label a vertex for this identity starts every run with.
    pub const fn initial_label(&self) -> Label {
        self.id
    }

    /// Stable byte encoding, used for hashing.
    pub fn to_bytes(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[..8].copy_from_slice(&self.id.to_le_bytes());
        bytes[8] = u8::from(self.system);
        bytes
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.system {
            write!(f, "sys:{}", self.id)
        } else {
            write!(f, "id:{}", self.id)
        }
    }
}

/// A shared data object touched by identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// A cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_identity_differs_from_plain_identity() {
        let plain = Identity::new(7);
        let system = Identity::system(7);
        assert_ne!(plain, system);
        assert!(system.is_system());
        assert!(!plain.is_system());
        assert_ne!(plain.to_bytes(), system.to_bytes());
    }

    #[test]
    fn initial_label_is_the_numeric_id() {
        assert_eq!(Identity::new(42).initial_label(), 42);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Identity::new(3).to_string(), "id:3");
        assert_eq!(Identity::system(0).to_string(), "sys:0");
        assert_eq!(ObjectId(9).to_string(), "obj:9");
        assert_eq!(NodeId(10).to_string(), "node:10");
    }
}
