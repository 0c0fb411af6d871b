//! Drives a fleet of virtual users according to a [`Schedule`].
//!
//! Worker-driven schedules re-evaluate the target fleet size on a fixed tick and scale up or
//! down. Scaling down cancels the most recently started workers, which finish their current
//! iteration first. Arrival-rate schedules instead hand out one ticket per iteration start to a
//! pool of waiting workers, growing that pool up to `max_vus` and counting iterations that could
//! not start as dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::profile::Schedule;
use crate::vu::{IterationBudget, RunContext, StopSignal, VirtualUser};

/// How often worker-driven schedules re-evaluate the fleet size.
pub const RAMP_TICK: Duration = Duration::from_millis(100);
/// How often arrival-rate schedules start owed iterations.
pub const DISPATCH_TICK: Duration = Duration::from_millis(10);

/// How a schedule ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Time from the first worker start until the last worker stopped.
    pub elapsed: Duration,
    /// The run was cancelled from outside before the schedule completed.
    pub interrupted: bool,
    /// A shared-iterations schedule hit its `max_duration`.
    pub timed_out: bool,
}

/// The set of running virtual users.
#[derive(Debug)]
pub struct Fleet {
    ctx: Arc<RunContext>,
    token: CancellationToken,
    members: Vec<CancellationToken>,
    tasks: JoinSet<u64>,
    next_id: u32,
}

impl Fleet {
    pub fn new(ctx: Arc<RunContext>, token: CancellationToken) -> Self {
        Self {
            ctx,
            token,
            members: Vec::new(),
            tasks: JoinSet::new(),
            next_id: 0,
        }
    }

    /// Number of workers that have not been asked to stop.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn enlist(&mut self) -> (VirtualUser, CancellationToken) {
        self.next_id += 1;
        let token = self.token.child_token();
        self.members.push(token.clone());
        (VirtualUser::new(self.next_id, Arc::clone(&self.ctx)), token)
    }

    /// Starts a looping worker, optionally drawing from a shared iteration budget.
    pub fn spawn(&mut self, budget: Option<Arc<IterationBudget>>) {
        let (vu, token) = self.enlist();
        let stop = StopSignal { token, budget };
        self.tasks.spawn(vu.run(stop));
    }

    /// Starts a worker that waits for tickets.
    pub fn spawn_on_demand(&mut self, tickets: &Arc<Semaphore>, idle: &Arc<AtomicUsize>) {
        let (vu, token) = self.enlist();
        self.tasks
            .spawn(vu.run_on_demand(Arc::clone(tickets), Arc::clone(idle), token));
    }

    /// Starts or stops looping workers until exactly `target` are active.
    pub fn scale_to(&mut self, target: usize) {
        while self.members.len() < target {
            self.spawn(None);
        }
        while self.members.len() > target {
            if let Some(token) = self.members.pop() {
                token.cancel();
            }
        }
    }

    /// Asks every worker to stop after its current iteration.
    pub fn shutdown(&mut self) {
        self.token.cancel();
        self.members.clear();
    }

    /// Waits for all spawned workers to stop.
    pub async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = &err as &dyn std::error::Error, "virtual user failed");
            }
        }
    }
}

/// Runs `schedule` to completion or until `cancel` fires.
pub async fn drive(
    schedule: &Schedule,
    ctx: Arc<RunContext>,
    cancel: &CancellationToken,
) -> ScheduleOutcome {
    let start = Instant::now();
    let mut fleet = Fleet::new(Arc::clone(&ctx), cancel.child_token());
    let mut timed_out = false;

    match schedule {
        Schedule::ConstantVus { .. } | Schedule::RampingVus { .. } => {
            let total = schedule.total_duration();
            let mut ticker = tokio::time::interval(RAMP_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let elapsed = start.elapsed();
                if elapsed >= total {
                    break;
                }
                let target = schedule.vus_at(elapsed).unwrap_or_default();
                if target as usize != fleet.len() {
                    tracing::debug!(from = fleet.len(), to = target, "scaling virtual users");
                    fleet.scale_to(target as usize);
                }
            }
        }

        Schedule::SharedIterations {
            vus,
            iterations,
            max_duration,
        } => {
            let budget = Arc::new(IterationBudget::new(*iterations));
            for _ in 0..*vus {
                fleet.spawn(Some(Arc::clone(&budget)));
            }

            tokio::select! {
                _ = fleet.wait() => {}
                _ = tokio::time::sleep(*max_duration) => {
                    tracing::warn!(
                        claimed = budget.claimed(),
                        iterations,
                        "shared iterations exceeded their max duration"
                    );
                    timed_out = true;
                }
                _ = cancel.cancelled() => {}
            }
        }

        Schedule::ConstantArrivalRate {
            pre_allocated_vus,
            max_vus,
            ..
        }
        | Schedule::RampingArrivalRate {
            pre_allocated_vus,
            max_vus,
            ..
        } => {
            dispatch(schedule, &ctx, &mut fleet, cancel, *pre_allocated_vus, *max_vus).await;
        }
    }

    fleet.shutdown();
    fleet.wait().await;

    ScheduleOutcome {
        elapsed: start.elapsed(),
        interrupted: cancel.is_cancelled(),
        timed_out,
    }
}

async fn dispatch(
    schedule: &Schedule,
    ctx: &RunContext,
    fleet: &mut Fleet,
    cancel: &CancellationToken,
    pre_allocated_vus: u32,
    max_vus: u32,
) {
    let metrics = ctx.executor.metrics();
    let tickets = Arc::new(Semaphore::new(0));
    let idle = Arc::new(AtomicUsize::new(0));
    for _ in 0..pre_allocated_vus {
        fleet.spawn_on_demand(&tickets, &idle);
    }

    let total = schedule.total_duration();
    let start = Instant::now();
    let mut last = start;
    let mut owed = 0.0;

    let mut ticker = tokio::time::interval(DISPATCH_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let elapsed = now - start;
        if elapsed >= total {
            break;
        }

        owed += schedule.rate_at(elapsed).unwrap_or_default() * (now - last).as_secs_f64();
        last = now;

        while owed >= 1.0 {
            owed -= 1.0;

            let free = idle
                .load(Ordering::Acquire)
                .saturating_sub(tickets.available_permits());
            if free == 0 {
                if fleet.len() >= max_vus as usize {
                    metrics.record_dropped_iteration();
                    continue;
                }
                fleet.spawn_on_demand(&tickets, &idle);
            }
            tickets.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SeedPool;
    use crate::profile::Stage;
    use crate::remote::{Endpoint, InMemoryRemote};
    use crate::vu::tests::context;
    use crate::workload::{ActionKind, WeightTable};

    fn list_context(remote: &InMemoryRemote, pacing: Duration) -> Arc<RunContext> {
        context(
            remote,
            WeightTable::only(ActionKind::List),
            SeedPool::default(),
            pacing,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn constant_vus_run_for_their_duration() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_secs(1));
        let schedule = Schedule::ConstantVus {
            vus: 3,
            duration: Duration::from_secs(10),
        };

        let outcome = drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        assert!(!outcome.interrupted);
        assert!(outcome.elapsed >= Duration::from_secs(10));
        assert!(outcome.elapsed < Duration::from_secs(12));
        let snapshot = ctx.executor.metrics().snapshot();
        assert_eq!(snapshot.max_vus, 3);
        assert_eq!(snapshot.active_vus, 0);
        // One iteration per second and worker.
        let lists = remote.requests_to(Endpoint::ListOwners);
        assert!((27..=33).contains(&lists), "{lists}");
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_vus_follow_stages() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_millis(200));
        let schedule = Schedule::RampingVus {
            start_vus: 0,
            stages: vec![
                Stage::new(Duration::from_secs(5), 10),
                Stage::new(Duration::from_secs(5), 0),
            ],
        };

        let outcome = drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        assert!(outcome.elapsed >= Duration::from_secs(10));
        let snapshot = ctx.executor.metrics().snapshot();
        assert_eq!(snapshot.max_vus, 10);
        assert_eq!(snapshot.active_vus, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_iterations_skip_final_pacing() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_secs(15 * 60));
        let schedule = Schedule::SharedIterations {
            vus: 1,
            iterations: 5,
            max_duration: Duration::from_secs(2 * 60 * 60),
        };

        let outcome = drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        assert!(!outcome.timed_out);
        // Four pauses between five iterations.
        assert!(outcome.elapsed >= Duration::from_secs(60 * 60));
        assert!(outcome.elapsed < Duration::from_secs(61 * 60));
        assert_eq!(remote.requests_to(Endpoint::ListOwners), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_iterations_respect_max_duration() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_secs(60));
        let schedule = Schedule::SharedIterations {
            vus: 1,
            iterations: 100,
            max_duration: Duration::from_secs(150),
        };

        let outcome = drive(&schedule, ctx, &CancellationToken::new()).await;

        assert!(outcome.timed_out);
        assert_eq!(remote.requests_to(Endpoint::ListOwners), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_rate_starts_iterations_at_rate() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::ZERO);
        let schedule = Schedule::ConstantArrivalRate {
            rate: 20,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(10),
            pre_allocated_vus: 2,
            max_vus: 5,
        };

        drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        let snapshot = ctx.executor.metrics().snapshot();
        assert!((195..=200).contains(&snapshot.iterations), "{snapshot:?}");
        assert_eq!(snapshot.dropped_iterations, 0);
        assert!(snapshot.max_vus <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_arrival_rate_follows_stages() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::ZERO);
        let schedule = Schedule::RampingArrivalRate {
            start_rate: 0,
            time_unit: Duration::from_secs(1),
            stages: vec![Stage::new(Duration::from_secs(10), 10)],
            pre_allocated_vus: 2,
            max_vus: 5,
        };

        let outcome = drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        assert!(!outcome.interrupted);
        assert!(outcome.elapsed >= Duration::from_secs(10));
        let snapshot = ctx.executor.metrics().snapshot();
        // The area under a ramp from 0 to 10/s over 10s.
        assert!((45..=50).contains(&snapshot.iterations), "{snapshot:?}");
        assert_eq!(snapshot.dropped_iterations, 0);
        assert!(snapshot.max_vus <= 5);
        assert_eq!(remote.requests_to(Endpoint::ListOwners), snapshot.iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_rate_drops_iterations_without_workers() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_secs(1));
        let schedule = Schedule::ConstantArrivalRate {
            rate: 10,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(2),
            pre_allocated_vus: 1,
            max_vus: 1,
        };

        drive(&schedule, Arc::clone(&ctx), &CancellationToken::new()).await;

        let snapshot = ctx.executor.metrics().snapshot();
        assert_eq!(snapshot.max_vus, 1);
        assert!(snapshot.iterations <= 3, "{snapshot:?}");
        assert!(snapshot.dropped_iterations >= 15, "{snapshot:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_schedule() {
        let remote = InMemoryRemote::new();
        let ctx = list_context(&remote, Duration::from_millis(200));
        let schedule = Schedule::ConstantVus {
            vus: 2,
            duration: Duration::from_secs(3600),
        };
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            })
        };
        let outcome = drive(&schedule, ctx, &cancel).await;
        canceller.await.unwrap();

        assert!(outcome.interrupted);
        assert!(outcome.elapsed < Duration::from_secs(6));
    }
}
