//! Actions a virtual user can perform and the weighted choice between them.
//!
//! A [`WeightTable`] describes the mix of operations of a traffic-shape profile, e.g. a
//! read-heavy default or a write-only mix for consistency testing. Selection is a pure function
//! of the table and an RNG, so it can be tested without any network.

use std::fmt;

use rand::Rng;
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::PickScope;
use crate::remote::Endpoint;

/// An operation against the owners API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// `GET /owners`
    List,
    /// `GET /owners/{id}`
    ReadById,
    /// `POST /owners`
    Create,
    /// `PUT /owners/{id}`
    Update,
    /// `DELETE /owners/{id}`
    Delete,
}

impl ActionKind {
    pub fn endpoint(self) -> Endpoint {
        match self {
            ActionKind::List => Endpoint::ListOwners,
            ActionKind::ReadById => Endpoint::GetOwner,
            ActionKind::Create => Endpoint::CreateOwner,
            ActionKind::Update => Endpoint::UpdateOwner,
            ActionKind::Delete => Endpoint::DeleteOwner,
        }
    }

    /// The identifiers this action may target, or `None` if it needs no target.
    ///
    /// Deletes only target owners the worker created itself, so seeds survive the run.
    pub fn target_scope(self, read_scope: PickScope) -> Option<PickScope> {
        match self {
            ActionKind::List | ActionKind::Create => None,
            ActionKind::ReadById => Some(read_scope),
            ActionKind::Update => Some(PickScope::All),
            ActionKind::Delete => Some(PickScope::LocalOnly),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.endpoint(), f)
    }
}

/// One row of a [`WeightTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weight {
    pub action: ActionKind,
    pub weight: u32,
}

/// An ordered table of action weights.
///
/// Order matters only for ties: a draw that falls exactly on a boundary goes to the earlier row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(Vec<Weight>);

impl WeightTable {
    pub fn new(weights: impl IntoIterator<Item = (ActionKind, u32)>) -> Self {
        Self(
            weights
                .into_iter()
                .map(|(action, weight)| Weight { action, weight })
                .collect(),
        )
    }

    /// The default CRUD mix: mostly reads, few deletes.
    pub fn crud() -> Self {
        Self::new([
            (ActionKind::List, 50),
            (ActionKind::ReadById, 20),
            (ActionKind::Create, 15),
            (ActionKind::Update, 10),
            (ActionKind::Delete, 5),
        ])
    }

    /// Write-only mix stressing the consistency of concurrent writes.
    pub fn writes() -> Self {
        Self::new([(ActionKind::Create, 70), (ActionKind::Update, 30)])
    }

    /// Read-only mix for scalability runs.
    pub fn reads() -> Self {
        Self::new([(ActionKind::List, 70), (ActionKind::ReadById, 30)])
    }

    /// A table that always selects `action`.
    pub fn only(action: ActionKind) -> Self {
        Self::new([(action, 1)])
    }

    pub fn weights(&self) -> &[Weight] {
        &self.0
    }

    /// Validates the table and prepares it for sampling.
    pub fn selector(&self) -> Result<ActionSelector> {
        let distribution = WeightedIndex::new(self.0.iter().map(|w| w.weight))
            .map_err(|err| Error::InvalidConfig(format!("invalid action weights: {err}")))?;

        Ok(ActionSelector {
            actions: self.0.iter().map(|w| w.action).collect(),
            distribution,
        })
    }
}

/// Samples actions according to a [`WeightTable`].
#[derive(Clone, Debug)]
pub struct ActionSelector {
    actions: Vec<ActionKind>,
    distribution: WeightedIndex<u32>,
}

impl ActionSelector {
    /// Draws a uniform value over the summed weights and returns the first action whose
    /// cumulative weight covers it.
    pub fn select<R: Rng>(&self, rng: &mut R) -> ActionKind {
        self.actions[self.distribution.sample(rng)]
    }
}
