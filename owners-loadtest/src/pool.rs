//! Owner identifiers available as targets for reads, updates and deletes.
//!
//! Identifiers come from two places. The [`SeedPool`] is established once by the setup phase and
//! then shared read-only by every virtual user. The [`LocalPool`] belongs to exactly one virtual
//! user and only holds owners that worker created itself. Neither needs synchronization: the seed
//! pool is immutable behind an `Arc`, and the local pool is never shared.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identifier assigned to an owner by the system under test.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OwnerId {
    Number(u64),
    Text(String),
}

impl OwnerId {
    /// Extracts the `id` field from a JSON write response.
    pub fn from_response(body: &[u8]) -> Option<Self> {
        #[derive(Deserialize)]
        struct WithId {
            id: OwnerId,
        }

        serde_json::from_slice::<WithId>(body).ok().map(|w| w.id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::Number(id) => write!(f, "{id}"),
            OwnerId::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for OwnerId {
    fn from(id: u64) -> Self {
        OwnerId::Number(id)
    }
}

/// The immutable, shared baseline of owners created before load begins.
///
/// Cloning is cheap and all clones point at the same identifiers.
#[derive(Clone, Debug, Default)]
pub struct SeedPool(Arc<[OwnerId]>);

impl SeedPool {
    pub fn new(ids: Vec<OwnerId>) -> Self {
        Self(ids.into())
    }

    pub fn ids(&self) -> &[OwnerId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Owners created by one virtual user during the run, in creation order.
///
/// Only [`add`](Self::add), [`remove`](Self::remove) and picking are supported, so the pool can
/// only ever contain identifiers returned by a successful create that were not deleted since.
#[derive(Debug, Default)]
pub struct LocalPool {
    ids: Vec<OwnerId>,
}

impl LocalPool {
    /// Records an owner created by this worker. Duplicates are ignored.
    pub fn add(&mut self, id: OwnerId) {
        if !self.contains(&id) {
            self.ids.push(id);
        }
    }

    /// Forgets a deleted owner. Returns `false` if the id was not created by this worker.
    pub fn remove(&mut self, id: &OwnerId) -> bool {
        match self.ids.iter().position(|existing| existing == id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &OwnerId) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> &[OwnerId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Which identifiers are eligible when picking a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickScope {
    /// Seed pool followed by the local pool.
    All,
    /// Only owners created by this worker. Used for deletes, which must never touch seeds.
    LocalOnly,
    /// The first `n` seeds followed by the local pool, to keep read cardinality low.
    HotSeeds(usize),
}

/// The identifier pool as seen by one virtual user.
#[derive(Debug)]
pub struct WorkerPool {
    seeds: SeedPool,
    local: LocalPool,
}

impl WorkerPool {
    pub fn new(seeds: SeedPool) -> Self {
        Self {
            seeds,
            local: LocalPool::default(),
        }
    }

    pub fn seeds(&self) -> &SeedPool {
        &self.seeds
    }

    pub fn local(&self) -> &LocalPool {
        &self.local
    }

    /// Records a successful create.
    pub fn add(&mut self, id: OwnerId) {
        self.local.add(id);
    }

    /// Records a successful delete. Seeds are never removed.
    pub fn remove(&mut self, id: &OwnerId) -> bool {
        self.local.remove(id)
    }

    /// Uniformly picks one identifier from the eligible seeds and the local pool.
    ///
    /// Returns `None` if nothing is eligible, in which case callers fall back to a harmless
    /// action.
    pub fn pick<R: Rng>(&self, scope: PickScope, rng: &mut R) -> Option<&OwnerId> {
        let seeds: &[OwnerId] = match scope {
            PickScope::All => self.seeds.ids(),
            PickScope::LocalOnly => &[],
            PickScope::HotSeeds(n) => &self.seeds.ids()[..n.min(self.seeds.len())],
        };

        let total = seeds.len() + self.local.len();
        if total == 0 {
            return None;
        }

        let index = rng.random_range(0..total);
        match seeds.get(index) {
            Some(id) => Some(id),
            None => self.local.ids().get(index - seeds.len()),
        }
    }
}
