//! Lock Hierarchy
//!
//! Every top-level collection sits behind its own reader-writer lock. The
//! locks are always taken in [`LockObj`] order, reconfiguration outermost,
//! because [`CoreModel::lock`](super::CoreModel::lock) is the only way to
//! take them and it walks the request in that order.
//!
//! Guards are `parking_lot` guards and must not live across an `.await`.

use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use std::collections::BTreeMap;

// =============================================================================
// Lock Objects
// =============================================================================

/// Lockable collections, declared in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockObj {
    Reconfiguration,
    Nodes,
    ResourceDefinitions,
    StoragePools,
    Remotes,
    ExternalFiles,
}

impl LockObj {
    pub const ALL: [LockObj; 6] = [
        LockObj::Reconfiguration,
        LockObj::Nodes,
        LockObj::ResourceDefinitions,
        LockObj::StoragePools,
        LockObj::Remotes,
        LockObj::ExternalFiles,
    ];
}

impl std::fmt::Display for LockObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockObj::Reconfiguration => write!(f, "reconfiguration"),
            LockObj::Nodes => write!(f, "nodes"),
            LockObj::ResourceDefinitions => write!(f, "resource_definitions"),
            LockObj::StoragePools => write!(f, "storage_pools"),
            LockObj::Remotes => write!(f, "remotes"),
            LockObj::ExternalFiles => write!(f, "external_files"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

// =============================================================================
// Lock Request
// =============================================================================

/// The set of collection locks one operation needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    modes: BTreeMap<LockObj, LockMode>,
}

impl LockRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every lock in write mode
    pub fn exclusive() -> Self {
        LockObj::ALL
            .iter()
            .fold(Self::new(), |req, obj| req.write(*obj))
    }

    /// Every lock in read mode
    pub fn shared() -> Self {
        LockObj::ALL.iter().fold(Self::new(), |req, obj| req.read(*obj))
    }

    /// Add a read lock; an existing write request is kept
    pub fn read(mut self, obj: LockObj) -> Self {
        self.modes.entry(obj).or_insert(LockMode::Read);
        self
    }

    pub fn write(mut self, obj: LockObj) -> Self {
        self.modes.insert(obj, LockMode::Write);
        self
    }

    /// Union of two requests, keeping the stronger mode per lock
    pub fn merge(mut self, other: &LockRequest) -> Self {
        for (obj, mode) in &other.modes {
            let entry = self.modes.entry(*obj).or_insert(*mode);
            if *mode > *entry {
                *entry = *mode;
            }
        }
        self
    }

    pub fn mode(&self, obj: LockObj) -> Option<LockMode> {
        self.modes.get(&obj).copied()
    }

    /// Locks in acquisition order
    pub fn iter(&self) -> impl Iterator<Item = (LockObj, LockMode)> + '_ {
        self.modes.iter().map(|(obj, mode)| (*obj, *mode))
    }
}

// =============================================================================
// Held Locks
// =============================================================================

pub(crate) enum Held<'a, T> {
    Read(RwLockReadGuard<'a, T>),
    Write(RwLockWriteGuard<'a, T>),
}

impl<'a, T> Held<'a, T> {
    pub(crate) fn acquire(lock: &'a RwLock<T>, mode: LockMode) -> Self {
        match mode {
            LockMode::Read => Held::Read(lock.read()),
            LockMode::Write => Held::Write(lock.write()),
        }
    }

    fn get(&self) -> &T {
        match self {
            Held::Read(guard) => guard,
            Held::Write(guard) => guard,
        }
    }
}

pub(crate) fn read_access<'g, 'a: 'g, T>(
    slot: &'g Option<Held<'a, T>>,
    lock: LockObj,
) -> Result<&'g T> {
    slot.as_ref().map(Held::get).ok_or(Error::LockNotHeld {
        lock,
        mode: LockMode::Read,
    })
}

pub(crate) fn write_access<'g, 'a: 'g, T>(
    slot: &'g mut Option<Held<'a, T>>,
    lock: LockObj,
) -> Result<&'g mut T> {
    match slot {
        Some(Held::Write(guard)) => Ok(&mut **guard),
        _ => Err(Error::LockNotHeld {
            lock,
            mode: LockMode::Write,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_iterates_in_hierarchy_order() {
        let req = LockRequest::new()
            .write(LockObj::StoragePools)
            .read(LockObj::Nodes)
            .read(LockObj::Reconfiguration);

        let order: Vec<_> = req.iter().map(|(obj, _)| obj).collect();
        assert_eq!(
            order,
            vec![LockObj::Reconfiguration, LockObj::Nodes, LockObj::StoragePools]
        );
    }

    #[test]
    fn test_read_does_not_downgrade_write() {
        let req = LockRequest::new().write(LockObj::Nodes).read(LockObj::Nodes);
        assert_eq!(req.mode(LockObj::Nodes), Some(LockMode::Write));
    }

    #[test]
    fn test_merge_keeps_stronger_mode() {
        let a = LockRequest::new().read(LockObj::Nodes).read(LockObj::Remotes);
        let b = LockRequest::new().write(LockObj::Nodes);
        let merged = a.merge(&b);
        assert_eq!(merged.mode(LockObj::Nodes), Some(LockMode::Write));
        assert_eq!(merged.mode(LockObj::Remotes), Some(LockMode::Read));
        assert_eq!(merged.mode(LockObj::ExternalFiles), None);
    }

    #[test]
    fn test_exclusive_covers_everything() {
        let req = LockRequest::exclusive();
        for obj in LockObj::ALL {
            assert_eq!(req.mode(obj), Some(LockMode::Write));
        }
    }
}
