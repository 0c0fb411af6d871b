//! The loop run by every virtual user.
//!
//! A [`VirtualUser`] repeatedly selects an action, resolves its target from its [`WorkerPool`],
//! executes it and then paces. Stop requests are honored between iterations and may cut pacing
//! short, but never interrupt a request in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::entity::{Origin, OwnerFactory, OwnerOverrides};
use crate::executor::Executor;
use crate::pool::{OwnerId, PickScope, SeedPool, WorkerPool};
use crate::workload::{ActionKind, ActionSelector};

/// Everything a virtual user needs that is shared across the fleet.
#[derive(Debug)]
pub struct RunContext {
    pub executor: Executor,
    pub factory: OwnerFactory,
    pub selector: ActionSelector,
    pub read_scope: PickScope,
    pub pacing: Duration,
    pub seeds: SeedPool,
}

/// Where a virtual user is in its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VuState {
    Idle,
    Acting,
    Pacing,
    Terminated,
}

/// A fixed number of iterations shared by all workers of a run.
#[derive(Debug)]
pub struct IterationBudget {
    total: u64,
    claimed: AtomicU64,
}

impl IterationBudget {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            claimed: AtomicU64::new(0),
        }
    }

    /// Claims the right to run one more iteration.
    pub fn claim(&self) -> bool {
        self.claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.total).then_some(n + 1)
            })
            .is_ok()
    }

    /// Returns `true` once every iteration has been claimed.
    pub fn exhausted(&self) -> bool {
        self.claimed.load(Ordering::Acquire) >= self.total
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Conditions under which a looping worker stops.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    pub token: CancellationToken,
    pub budget: Option<Arc<IterationBudget>>,
}

impl StopSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Arc<IterationBudget>) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// A concrete action with its resolved target.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    List,
    Read(OwnerId),
    Create,
    Update(OwnerId),
    Delete(OwnerId),
}

impl Step {
    fn kind(&self) -> ActionKind {
        match self {
            Step::List => ActionKind::List,
            Step::Read(_) => ActionKind::ReadById,
            Step::Create => ActionKind::Create,
            Step::Update(_) => ActionKind::Update,
            Step::Delete(_) => ActionKind::Delete,
        }
    }
}

/// One simulated client.
#[derive(Debug)]
pub struct VirtualUser {
    id: u32,
    iteration: u64,
    state: VuState,
    pool: WorkerPool,
    rng: SmallRng,
    ctx: Arc<RunContext>,
}

impl VirtualUser {
    /// Creates virtual user `id`. Ids start at `1`.
    pub fn new(id: u32, ctx: Arc<RunContext>) -> Self {
        Self {
            id,
            iteration: 0,
            state: VuState::Idle,
            pool: WorkerPool::new(ctx.seeds.clone()),
            rng: SmallRng::from_rng(&mut rand::rng()),
            ctx,
        }
    }

    /// Replaces the random source, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Iterations completed so far.
    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    fn plan(&mut self) -> Step {
        let selected = self.ctx.selector.select(&mut self.rng);
        let Some(scope) = selected.target_scope(self.ctx.read_scope) else {
            return match selected {
                ActionKind::Create => Step::Create,
                _ => Step::List,
            };
        };

        let Some(id) = self.pool.pick(scope, &mut self.rng).cloned() else {
            tracing::trace!(vu = self.id, action = %selected, "no target available, listing instead");
            return Step::List;
        };

        match selected {
            ActionKind::ReadById => Step::Read(id),
            ActionKind::Update => Step::Update(id),
            ActionKind::Delete => Step::Delete(id),
            ActionKind::List | ActionKind::Create => Step::List,
        }
    }

    /// Runs a single iteration and returns the action that was actually executed.
    ///
    /// Actions that need a target fall back to a list when nothing is eligible.
    pub async fn iterate(&mut self) -> ActionKind {
        self.state = VuState::Acting;

        let step = self.plan();
        let origin = Origin::Worker {
            vu: self.id,
            iteration: self.iteration,
        };
        let executor = &self.ctx.executor;

        match &step {
            Step::List => {
                executor.list().await;
            }
            Step::Read(id) => {
                executor.get(id).await;
            }
            Step::Create => {
                let owner = self.ctx.factory.make(&OwnerOverrides::default(), origin);
                if let Some(id) = executor.create(&owner).await.owner_id() {
                    self.pool.add(id);
                }
            }
            Step::Update(id) => {
                let owner = self.ctx.factory.make(&OwnerOverrides::default(), origin);
                executor.update(id, &owner).await;
            }
            Step::Delete(id) => {
                if executor.delete(id).await.is_success() {
                    self.pool.remove(id);
                }
            }
        }

        self.iteration += 1;
        executor.metrics().record_iteration();
        self.state = VuState::Idle;
        step.kind()
    }

    /// Sleeps for the pacing delay. Returns `false` if cancelled meanwhile.
    async fn pace(&mut self, token: &CancellationToken) -> bool {
        self.state = VuState::Pacing;
        let completed = tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.pacing) => true,
        };
        self.state = VuState::Idle;
        completed
    }

    /// Loops until `stop` fires or the iteration budget runs out.
    ///
    /// Returns the number of iterations this worker ran.
    pub async fn run(mut self, stop: StopSignal) -> u64 {
        let metrics = Arc::clone(self.ctx.executor.metrics());
        metrics.vu_started();

        loop {
            if stop.token.is_cancelled() {
                break;
            }
            if let Some(budget) = &stop.budget {
                if !budget.claim() {
                    break;
                }
            }

            self.iterate().await;

            if stop.budget.as_ref().is_some_and(|b| b.exhausted()) {
                break;
            }
            if !self.pace(&stop.token).await {
                break;
            }
        }

        self.state = VuState::Terminated;
        metrics.vu_stopped();
        tracing::trace!(vu = self.id, iterations = self.iteration, "virtual user stopped");
        self.iteration
    }

    /// Runs one iteration per ticket taken from `tickets`, until `token` fires.
    ///
    /// `idle` counts workers currently waiting for a ticket, so the dispatcher can tell whether
    /// a new iteration will be picked up.
    pub async fn run_on_demand(
        mut self,
        tickets: Arc<Semaphore>,
        idle: Arc<AtomicUsize>,
        token: CancellationToken,
    ) -> u64 {
        let metrics = Arc::clone(self.ctx.executor.metrics());
        metrics.vu_started();

        loop {
            idle.fetch_add(1, Ordering::AcqRel);
            let ticket = tokio::select! {
                _ = token.cancelled() => None,
                ticket = tickets.acquire() => ticket.ok(),
            };
            idle.fetch_sub(1, Ordering::AcqRel);

            let Some(ticket) = ticket else {
                break;
            };
            ticket.forget();

            self.iterate().await;
            if !self.pace(&token).await {
                break;
            }
        }

        self.state = VuState::Terminated;
        metrics.vu_stopped();
        self.iteration
    }
}
