//! Shared Storage Pool Lock Manager
//!
//! Pools that share a [`SharedPoolId`] sit on the same physical medium, so
//! only one node at a time may activate resources on any of them. The first
//! node to ask gets every identity it needs in one step; later requests wait
//! in arrival order, one queue per identity.
//!
//! Lock order: holder map, then queue map.

use crate::domain::{NodeName, Resource, ResourceName, SharedPoolId};
use crate::error::{Error, Result};
use crate::model::StoragePoolMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error};

/// A resource instance asking for shared pool locks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockRequester {
    pub node: NodeName,
    pub resource: ResourceName,
}

impl LockRequester {
    pub fn new(node: impl Into<NodeName>, resource: impl Into<ResourceName>) -> Self {
        Self {
            node: node.into(),
            resource: resource.into(),
        }
    }
}

impl std::fmt::Display for LockRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.resource, self.node)
    }
}

/// Shared identities the resource's volumes live on
pub fn shared_pools_of(resource: &Resource, pools: &StoragePoolMap) -> Result<BTreeSet<SharedPoolId>> {
    let mut shared: HashMap<SharedPoolId, &crate::domain::StorPoolName> = HashMap::new();
    for volume in &resource.volumes {
        let key = (resource.node_name.clone(), volume.storage_pool.clone());
        let pool = pools.get(&key).ok_or_else(|| Error::EntityNotFound {
            kind: "storage pool".into(),
            name: format!("{}/{}", resource.node_name, volume.storage_pool),
        })?;
        if let Some(id) = &pool.shared_id {
            if let Some(other) = shared.insert(id.clone(), &pool.name) {
                if *other != pool.name {
                    return Err(Error::Implementation(format!(
                        "storage pools {} and {} on {} share identity {}",
                        other, pool.name, resource.node_name, id
                    )));
                }
            }
        }
    }
    Ok(shared.into_keys().collect())
}

/// Identities a resource must lock before activation; inactive resources
/// need none and never wait
pub fn required_shared_pools(
    resource: &Resource,
    pools: &StoragePoolMap,
) -> Result<BTreeSet<SharedPoolId>> {
    if resource.is_inactive() {
        return Ok(BTreeSet::new());
    }
    shared_pools_of(resource, pools)
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct Holder {
    node: NodeName,
    /// Granted requesters that have not completed yet
    requesters: BTreeSet<LockRequester>,
}

#[derive(Debug, Default)]
struct ActiveLocks {
    by_pool: HashMap<SharedPoolId, Holder>,
}

impl ActiveLocks {
    fn lock_all(&mut self, requester: &LockRequester, required: &BTreeSet<SharedPoolId>) {
        for id in required {
            self.by_pool
                .entry(id.clone())
                .or_insert_with(|| Holder {
                    node: requester.node.clone(),
                    requesters: BTreeSet::new(),
                })
                .requesters
                .insert(requester.clone());
        }
    }
}

#[derive(Debug, Default)]
struct LockQueue {
    by_pool: HashMap<SharedPoolId, IndexSet<LockRequester>>,
    /// Identities per waiting requester, in arrival order
    requests: IndexMap<LockRequester, BTreeSet<SharedPoolId>>,
}

impl LockQueue {
    fn is_waited_on(&self, id: &SharedPoolId) -> bool {
        self.by_pool.get(id).map_or(false, |q| !q.is_empty())
    }

    fn head(&self, id: &SharedPoolId) -> Option<&LockRequester> {
        self.by_pool.get(id).and_then(|q| q.first())
    }

    /// Queue on every identity in `required`.
    ///
    /// A repeated request keeps its arrival position and replaces the
    /// identities it waits on. Every per-identity queue stays sorted by
    /// arrival, so two waiters can never head each other's queues. Returns
    /// the identities the requester waited on before.
    fn enqueue(
        &mut self,
        requester: &LockRequester,
        required: &BTreeSet<SharedPoolId>,
    ) -> BTreeSet<SharedPoolId> {
        let previous = match self.requests.get_mut(requester) {
            Some(existing) => std::mem::replace(existing, required.clone()),
            None => {
                self.requests.insert(requester.clone(), required.clone());
                BTreeSet::new()
            }
        };

        for id in previous.difference(required) {
            if let Some(queue) = self.by_pool.get_mut(id) {
                queue.shift_remove(requester);
                if queue.is_empty() {
                    self.by_pool.remove(id);
                }
            }
        }

        let requests = &self.requests;
        let arrival = requests.get_index_of(requester).unwrap_or(usize::MAX);
        for id in required.difference(&previous) {
            let queue = self.by_pool.entry(id.clone()).or_default();
            let at = queue
                .iter()
                .position(|other| requests.get_index_of(other).map_or(false, |idx| idx > arrival))
                .unwrap_or(queue.len());
            queue.shift_insert(at, requester.clone());
        }
        previous
    }

    fn dequeue(&mut self, requester: &LockRequester) -> BTreeSet<SharedPoolId> {
        let required = self.requests.shift_remove(requester).unwrap_or_default();
        for id in &required {
            if let Some(queue) = self.by_pool.get_mut(id) {
                queue.shift_remove(requester);
                if queue.is_empty() {
                    self.by_pool.remove(id);
                }
            }
        }
        required
    }
}

// =============================================================================
// Lock Manager
// =============================================================================

#[derive(Debug, Default)]
pub struct SharedPoolLockManager {
    active: Mutex<ActiveLocks>,
    queue: Mutex<LockQueue>,
}

impl SharedPoolLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every identity in `required` for `requester`.
    ///
    /// Granted only when each identity is unheld and nobody waits for it;
    /// otherwise queued on all of them. Returns the requesters now allowed
    /// to proceed: `requester` itself on grant, nothing when queued.
    pub fn acquire(
        &self,
        requester: LockRequester,
        required: &BTreeSet<SharedPoolId>,
    ) -> Vec<LockRequester> {
        if required.is_empty() {
            return vec![requester];
        }

        let mut active = self.active.lock();
        let mut queue = self.queue.lock();

        // a requester already waiting keeps its place with its new needs
        if queue.requests.contains_key(&requester) {
            debug!("Shared pool request of {} now waits on {:?}", requester, required);
            let previous = queue.enqueue(&requester, required);
            let touched: Vec<SharedPoolId> = previous.union(required).cloned().collect();
            return Self::grant_waiting(&mut active, &mut queue, &touched);
        }

        let blocked = required
            .iter()
            .any(|id| active.by_pool.contains_key(id) || queue.is_waited_on(id));

        if blocked {
            debug!("Shared pool lock for {} queued on {:?}", requester, required);
            queue.enqueue(&requester, required);
            return Vec::new();
        }

        debug!("Shared pool lock for {} granted on {:?}", requester, required);
        active.lock_all(&requester, required);
        vec![requester]
    }

    /// Release identities held by `node` and grant waiting requesters.
    ///
    /// Releasing an identity that is not held, or held by another node, is
    /// a contract violation; nothing is released in that case.
    pub fn release(&self, node: &NodeName, pools: &[SharedPoolId]) -> Result<Vec<LockRequester>> {
        let mut active = self.active.lock();

        for id in pools {
            match active.by_pool.get(id) {
                None => {
                    error!("Node {} released shared pool {} which is not locked", node, id);
                    return Err(Error::LockContractViolation(format!(
                        "{} released {} which is not locked",
                        node, id
                    )));
                }
                Some(holder) if holder.node != *node => {
                    error!(
                        "Node {} released shared pool {} which is locked by {}",
                        node, id, holder.node
                    );
                    return Err(Error::LockContractViolation(format!(
                        "{} released {} which is locked by {}",
                        node, id, holder.node
                    )));
                }
                Some(_) => {}
            }
        }

        for id in pools {
            active.by_pool.remove(id);
        }

        let mut queue = self.queue.lock();
        Ok(Self::grant_waiting(&mut active, &mut queue, pools))
    }

    /// Release everything `node` holds
    pub fn release_node(&self, node: &NodeName) -> Vec<LockRequester> {
        let mut active = self.active.lock();
        let held: Vec<SharedPoolId> = active
            .by_pool
            .iter()
            .filter(|(_, holder)| holder.node == *node)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            active.by_pool.remove(id);
        }

        let mut queue = self.queue.lock();
        Self::grant_waiting(&mut active, &mut queue, &held)
    }

    /// The requester finished activating; identities nobody else on its
    /// node still uses are released
    pub fn complete(&self, requester: &LockRequester) -> Vec<LockRequester> {
        let mut active = self.active.lock();
        let mut emptied = Vec::new();
        for (id, holder) in active.by_pool.iter_mut() {
            if holder.requesters.remove(requester) && holder.requesters.is_empty() {
                emptied.push(id.clone());
            }
        }
        for id in &emptied {
            active.by_pool.remove(id);
        }

        let mut queue = self.queue.lock();
        Self::grant_waiting(&mut active, &mut queue, &emptied)
    }

    /// Drop the requester's queued request and any hold it has
    pub fn withdraw(&self, requester: &LockRequester) -> Vec<LockRequester> {
        let mut granted = self.complete(requester);

        let mut active = self.active.lock();
        let mut queue = self.queue.lock();
        let waited: Vec<SharedPoolId> = queue.dequeue(requester).into_iter().collect();
        if !waited.is_empty() {
            debug!("Withdrew shared pool request of {}", requester);
            granted.extend(Self::grant_waiting(&mut active, &mut queue, &waited));
        }
        granted
    }

    /// Evaluate waiters of `released` in arrival order; a candidate is
    /// granted when each identity it needs is free with a head of queue on
    /// the same node, or was reserved for its node earlier in this pass
    fn grant_waiting(
        active: &mut ActiveLocks,
        queue: &mut LockQueue,
        released: &[SharedPoolId],
    ) -> Vec<LockRequester> {
        let mut candidates: Vec<(usize, LockRequester)> = released
            .iter()
            .filter_map(|id| queue.by_pool.get(id))
            .flatten()
            .filter_map(|r| queue.requests.get_index_of(r).map(|idx| (idx, r.clone())))
            .collect();
        candidates.sort_by_key(|(idx, _)| *idx);
        candidates.dedup_by_key(|(idx, _)| *idx);

        let mut reserved: HashMap<SharedPoolId, NodeName> = HashMap::new();
        let mut granted = Vec::new();

        for (_, candidate) in candidates {
            let required = match queue.requests.get(&candidate) {
                Some(required) => required.clone(),
                None => continue,
            };

            let grantable = required.iter().all(|id| {
                if active.by_pool.contains_key(id) {
                    reserved.get(id) == Some(&candidate.node)
                } else {
                    queue
                        .head(id)
                        .map_or(true, |head| head.node == candidate.node)
                }
            });

            if !grantable {
                debug!("Shared pool lock for {} still blocked", candidate);
                continue;
            }

            queue.dequeue(&candidate);
            active.lock_all(&candidate, &required);
            for id in required {
                reserved.insert(id, candidate.node.clone());
            }
            debug!("Shared pool lock for {} granted after release", candidate);
            granted.push(candidate);
        }

        granted
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether resources of `node` on a pool with `shared_id` may be active
    pub fn is_active_pool(&self, node: &NodeName, shared_id: Option<&SharedPoolId>) -> bool {
        match shared_id {
            None => true,
            Some(id) => self
                .active
                .lock()
                .by_pool
                .get(id)
                .map_or(false, |holder| holder.node == *node),
        }
    }

    /// Whether `node` holds every shared identity of the resource
    pub fn is_active_resource(&self, node: &NodeName, shared: &BTreeSet<SharedPoolId>) -> bool {
        let active = self.active.lock();
        shared.iter().all(|id| {
            active
                .by_pool
                .get(id)
                .map_or(false, |holder| holder.node == *node)
        })
    }

    /// Whether `requester` was granted every identity in `required` and
    /// has not completed yet
    pub fn holds(&self, requester: &LockRequester, required: &BTreeSet<SharedPoolId>) -> bool {
        let active = self.active.lock();
        required.iter().all(|id| {
            active
                .by_pool
                .get(id)
                .map_or(false, |holder| holder.requesters.contains(requester))
        })
    }

    pub fn holder_of(&self, id: &SharedPoolId) -> Option<NodeName> {
        self.active.lock().by_pool.get(id).map(|h| h.node.clone())
    }

    /// Waiters of an identity, oldest first
    pub fn queued(&self, id: &SharedPoolId) -> Vec<LockRequester> {
        let _active = self.active.lock();
        self.queue
            .lock()
            .by_pool
            .get(id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn held_count(&self) -> usize {
        self.active.lock().by_pool.len()
    }

    pub fn waiting_count(&self) -> usize {
        let _active = self.active.lock();
        self.queue.lock().requests.len()
    }
}
