//! Entity Names and Fingerprints
//!
//! Names are compared case-insensitively but keep the spelling they were
//! created with. A [`Fingerprint`] is assigned once per entity and never
//! reused, so two sides only agree on "the same entity" when both the name
//! and the fingerprint match.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

// =============================================================================
// Names
// =============================================================================

macro_rules! entity_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            fn folded(&self) -> impl Iterator<Item = u8> + '_ {
                self.0.bytes().map(|b| b.to_ascii_uppercase())
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.eq_ignore_ascii_case(&other.0)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                for b in self.folded() {
                    state.write_u8(b);
                }
                state.write_u8(0xff);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.folded().cmp(other.folded())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_name!(
    /// Name of a cluster node
    NodeName
);
entity_name!(
    /// Name of a resource definition, shared by all of its instances
    ResourceName
);
entity_name!(
    /// Name of a storage pool, unique per node
    StorPoolName
);
entity_name!(
    /// Name of a snapshot of a resource definition
    SnapshotName
);
entity_name!(
    /// Label grouping storage pools backed by the same physical medium
    SharedPoolId
);
entity_name!(
    /// Name of a remote backup target
    RemoteName
);
entity_name!(
    /// Name of a resource group
    ResourceGroupName
);

// =============================================================================
// Fingerprint
// =============================================================================

/// Immutable identity token of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Uuid);

impl Fingerprint {
    /// Assign a fresh fingerprint
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The fingerprint a satellite presents before it has ever been adopted
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Fingerprint {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    #[test]
    fn test_names_compare_case_insensitive() {
        let a = NodeName::new("Node-A");
        let b = NodeName::new("node-a");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));

        // Original spelling is kept for display
        assert_eq!(a.to_string(), "Node-A");
    }

    #[test]
    fn test_name_ordering() {
        let mut map = BTreeMap::new();
        map.insert(ResourceName::new("rsc-b"), 2);
        map.insert(ResourceName::new("RSC-A"), 1);
        let keys: Vec<_> = map.keys().map(|k| k.as_str().to_string()).collect();
        assert_eq!(keys, vec!["RSC-A", "rsc-b"]);
    }

    #[test]
    fn test_fingerprint_serde_is_plain_uuid() {
        let fp = Fingerprint::generate();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp));
        assert!(Fingerprint::nil().is_nil());
        assert!(!fp.is_nil());
    }
}
