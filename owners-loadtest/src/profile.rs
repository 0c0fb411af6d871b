//! Traffic-shape profiles and their registry.
//!
//! A [`Profile`] bundles everything that distinguishes one kind of load test from another: how
//! many workers run over time ([`Schedule`]), which operations they perform ([`WeightTable`]), how
//! long they pause between iterations, and which [`Thresholds`] decide whether the run passed.
//!
//! The [`Registry`] holds the built-in catalogue and any profiles declared in configuration. A
//! selected profile is immutable for the duration of the run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::MetricsSnapshot;
use crate::pool::PickScope;
use crate::workload::{ActionKind, WeightTable};

/// Profile used when no scenario is selected.
pub const DEFAULT_PROFILE: &str = "spike";

/// Pause between iterations unless a profile says otherwise.
pub const DEFAULT_PACING: Duration = Duration::from_millis(200);

/// A step of a ramping schedule: move linearly to `target` over `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn mins(mins: u64) -> Duration {
    Duration::from_secs(mins * 60)
}

fn one_second() -> Duration {
    secs(1)
}

/// How the number of workers, or the rate of iterations, evolves over a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum Schedule {
    /// A fixed number of workers looping for a fixed duration.
    ConstantVus {
        vus: u32,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Workers interpolated linearly from `start_vus` through each stage target.
    RampingVus {
        #[serde(default)]
        start_vus: u32,
        stages: Vec<Stage>,
    },
    /// `rate` iteration starts per `time_unit`, regardless of how long iterations take.
    ConstantArrivalRate {
        rate: u32,
        #[serde(with = "humantime_serde", default = "one_second")]
        time_unit: Duration,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        pre_allocated_vus: u32,
        max_vus: u32,
    },
    /// Like [`ConstantArrivalRate`](Self::ConstantArrivalRate) with a rate that follows stages.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: u32,
        #[serde(with = "humantime_serde", default = "one_second")]
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: u32,
        max_vus: u32,
    },
    /// Exactly `iterations` iterations shared between `vus` workers.
    SharedIterations {
        vus: u32,
        iterations: u64,
        #[serde(with = "humantime_serde")]
        max_duration: Duration,
    },
}

/// Linearly interpolates `start` through `stages` at `elapsed`.
///
/// Past the last stage the value stays at the final target.
pub fn ramp(start: u32, stages: &[Stage], elapsed: Duration) -> f64 {
    let mut from = f64::from(start);
    let mut remaining = elapsed;

    for stage in stages {
        let target = f64::from(stage.target);
        if remaining < stage.duration {
            let progress = remaining.as_secs_f64() / stage.duration.as_secs_f64();
            return from + (target - from) * progress;
        }
        remaining -= stage.duration;
        from = target;
    }

    from
}

impl Schedule {
    /// Target number of looping workers at `elapsed`, for worker-driven schedules.
    ///
    /// Returns `None` for arrival-rate schedules, which size their fleet on demand.
    pub fn vus_at(&self, elapsed: Duration) -> Option<u32> {
        match self {
            Schedule::ConstantVus { vus, duration } => {
                Some(if elapsed < *duration { *vus } else { 0 })
            }
            Schedule::RampingVus { start_vus, stages } => {
                Some(ramp(*start_vus, stages, elapsed).round() as u32)
            }
            Schedule::SharedIterations { vus, .. } => Some(*vus),
            Schedule::ConstantArrivalRate { .. } | Schedule::RampingArrivalRate { .. } => None,
        }
    }

    /// Iteration starts per second at `elapsed`, for arrival-rate schedules.
    pub fn rate_at(&self, elapsed: Duration) -> Option<f64> {
        match self {
            Schedule::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                ..
            } => Some(if elapsed < *duration {
                f64::from(*rate) / time_unit.as_secs_f64()
            } else {
                0.0
            }),
            Schedule::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                ..
            } => Some(ramp(*start_rate, stages, elapsed) / time_unit.as_secs_f64()),
            _ => None,
        }
    }

    /// Nominal length of the schedule. For shared iterations, this is the upper bound.
    pub fn total_duration(&self) -> Duration {
        match self {
            Schedule::ConstantVus { duration, .. }
            | Schedule::ConstantArrivalRate { duration, .. } => *duration,
            Schedule::RampingVus { stages, .. } | Schedule::RampingArrivalRate { stages, .. } => {
                stages.iter().map(|s| s.duration).sum()
            }
            Schedule::SharedIterations { max_duration, .. } => *max_duration,
        }
    }

    /// The largest number of workers the schedule may run at once.
    pub fn max_vus(&self) -> u32 {
        match self {
            Schedule::ConstantVus { vus, .. } | Schedule::SharedIterations { vus, .. } => *vus,
            Schedule::RampingVus { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .fold(*start_vus, u32::max),
            Schedule::ConstantArrivalRate { max_vus, .. }
            | Schedule::RampingArrivalRate { max_vus, .. } => *max_vus,
        }
    }

    /// Short name of the executor, as used in configuration.
    pub fn executor(&self) -> &'static str {
        match self {
            Schedule::ConstantVus { .. } => "constant-vus",
            Schedule::RampingVus { .. } => "ramping-vus",
            Schedule::ConstantArrivalRate { .. } => "constant-arrival-rate",
            Schedule::RampingArrivalRate { .. } => "ramping-arrival-rate",
            Schedule::SharedIterations { .. } => "shared-iterations",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> {
            Err(Error::InvalidConfig(format!("{}: {msg}", self.executor())))
        };

        match self {
            Schedule::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return invalid("vus must be positive");
                }
                if duration.is_zero() {
                    return invalid("duration must be positive");
                }
            }
            Schedule::RampingVus { stages, .. } => {
                if stages.is_empty() {
                    return invalid("at least one stage is required");
                }
            }
            Schedule::ConstantArrivalRate {
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                if duration.is_zero() {
                    return invalid("duration must be positive");
                }
                validate_rate_fleet(*time_unit, *pre_allocated_vus, *max_vus).or_else(invalid)?;
            }
            Schedule::RampingArrivalRate {
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                if stages.is_empty() {
                    return invalid("at least one stage is required");
                }
                validate_rate_fleet(*time_unit, *pre_allocated_vus, *max_vus).or_else(invalid)?;
            }
            Schedule::SharedIterations {
                vus, max_duration, ..
            } => {
                if *vus == 0 {
                    return invalid("vus must be positive");
                }
                if max_duration.is_zero() {
                    return invalid("max_duration must be positive");
                }
            }
        }

        Ok(())
    }
}

fn validate_rate_fleet(
    time_unit: Duration,
    pre_allocated_vus: u32,
    max_vus: u32,
) -> std::result::Result<(), &'static str> {
    if time_unit.is_zero() {
        return Err("time_unit must be positive");
    }
    if max_vus == 0 {
        return Err("max_vus must be positive");
    }
    if pre_allocated_vus > max_vus {
        return Err("pre_allocated_vus must not exceed max_vus");
    }
    Ok(())
}

/// Pass/fail criteria evaluated against the final metrics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Highest acceptable share of failed requests.
    pub max_error_rate: f64,
    /// Highest acceptable 95th percentile latency.
    #[serde(with = "humantime_serde")]
    pub max_p95: Duration,
    /// Lowest acceptable share of successful requests.
    pub min_success_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.01,
            max_p95: Duration::from_millis(400),
            min_success_rate: 0.99,
        }
    }
}

impl Thresholds {
    /// Looser rates for runs that deliberately push towards saturation.
    pub fn relaxed() -> Self {
        Self {
            max_error_rate: 0.10,
            min_success_rate: 0.95,
            ..Default::default()
        }
    }

    /// Evaluates every criterion. A criterion without data passes.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
        let has_latency = snapshot.latency.count > 0;
        vec![
            ThresholdResult {
                metric: "error_rate",
                condition: format!("< {:.2}%", self.max_error_rate * 100.0),
                actual: snapshot.error_rate(),
                passed: snapshot
                    .error_rate()
                    .is_none_or(|rate| rate < self.max_error_rate),
            },
            ThresholdResult {
                metric: "p95_latency_ms",
                condition: format!("< {}", self.max_p95.as_millis()),
                actual: has_latency.then_some(snapshot.latency.p95_ms),
                passed: !has_latency || snapshot.latency.p95() < self.max_p95,
            },
            ThresholdResult {
                metric: "success_rate",
                condition: format!("> {:.2}%", self.min_success_rate * 100.0),
                actual: snapshot.success_rate(),
                passed: snapshot
                    .success_rate()
                    .is_none_or(|rate| rate > self.min_success_rate),
            },
        ]
    }
}

/// The outcome of one threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: &'static str,
    pub condition: String,
    pub actual: Option<f64>,
    pub passed: bool,
}

fn default_weights() -> WeightTable {
    WeightTable::crud()
}

fn default_read_scope() -> PickScope {
    PickScope::All
}

fn default_pacing() -> Duration {
    DEFAULT_PACING
}

/// A named traffic shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Filled in from the registry key.
    #[serde(default, skip_serializing)]
    pub name: String,
    /// The quality attribute this profile exercises.
    #[serde(default)]
    pub attribute: String,
    pub schedule: Schedule,
    #[serde(default = "default_weights")]
    pub weights: WeightTable,
    /// Targets for by-id reads.
    #[serde(default = "default_read_scope")]
    pub read_scope: PickScope,
    #[serde(with = "humantime_serde", default = "default_pacing")]
    pub pacing: Duration,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Profile {
    fn new(name: &str, attribute: &str, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            schedule,
            weights: WeightTable::crud(),
            read_scope: PickScope::All,
            pacing: DEFAULT_PACING,
            thresholds: Thresholds::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        self.weights
            .selector()
            .map_err(|err| Error::InvalidConfig(format!("profile `{}`: {err}", self.name)))?;
        Ok(())
    }
}

/// The catalogue of profiles selectable by name.
#[derive(Clone, Debug)]
pub struct Registry {
    profiles: BTreeMap<String, Profile>,
}

impl Registry {
    /// The built-in catalogue.
    pub fn builtin() -> Self {
        let spike_stages = {
            let mut stages = vec![Stage::new(secs(30), 10), Stage::new(secs(20), 30)];
            for spike in 0..3 {
                if spike > 0 {
                    stages.push(Stage::new(secs(40), 10));
                }
                stages.push(Stage::new(secs(10), 50));
                stages.push(Stage::new(secs(10), 0));
            }
            stages
        };

        let mut ramp = Profile::new(
            "ramp",
            "scalability",
            Schedule::RampingVus {
                start_vus: 0,
                stages: vec![
                    Stage::new(mins(2), 20),
                    Stage::new(mins(1), 20),
                    Stage::new(mins(3), 60),
                    Stage::new(mins(2), 60),
                    Stage::new(mins(3), 100),
                    Stage::new(mins(2), 0),
                ],
            },
        );
        ramp.weights = WeightTable::reads();
        ramp.read_scope = PickScope::HotSeeds(5);
        ramp.thresholds = Thresholds::relaxed();

        let mut critical = Profile::new(
            "critical",
            "write consistency",
            Schedule::ConstantVus {
                vus: 20,
                duration: mins(5),
            },
        );
        critical.weights = WeightTable::writes();

        let mut cold = Profile::new(
            "cold",
            "cold start",
            Schedule::SharedIterations {
                vus: 1,
                iterations: 5,
                max_duration: mins(120),
            },
        );
        cold.weights = WeightTable::only(ActionKind::List);
        cold.pacing = mins(15);

        let profiles = [
            Profile::new(
                "spike",
                "elasticity",
                Schedule::RampingVus {
                    start_vus: 0,
                    stages: spike_stages,
                },
            ),
            ramp,
            Profile::new(
                "soak",
                "stability",
                Schedule::ConstantVus {
                    vus: 30,
                    duration: mins(60),
                },
            ),
            Profile::new(
                "peak",
                "sustained performance",
                Schedule::ConstantVus {
                    vus: 100,
                    duration: mins(10),
                },
            ),
            Profile::new(
                "stress",
                "resilience",
                Schedule::RampingVus {
                    start_vus: 10,
                    stages: (1..=5).map(|step| Stage::new(mins(2), step * 100)).collect(),
                },
            ),
            critical,
            cold,
            Profile::new(
                "throughput",
                "sustained throughput",
                Schedule::ConstantArrivalRate {
                    rate: 20,
                    time_unit: secs(1),
                    duration: mins(30),
                    pre_allocated_vus: 30,
                    max_vus: 100,
                },
            ),
            Profile::new(
                "surge",
                "elasticity under arrival rate",
                Schedule::RampingArrivalRate {
                    start_rate: 1,
                    time_unit: secs(1),
                    stages: vec![
                        Stage::new(secs(10), 1),
                        Stage::new(secs(30), 80),
                        Stage::new(secs(60), 80),
                        Stage::new(secs(20), 0),
                    ],
                    pre_allocated_vus: 20,
                    max_vus: 100,
                },
            ),
        ];

        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    /// Adds profiles declared in configuration, replacing built-ins with the same name.
    pub fn with_custom(mut self, custom: &BTreeMap<String, Profile>) -> Result<Self> {
        for (name, profile) in custom {
            let mut profile = profile.clone();
            profile.name = name.clone();
            profile.validate()?;
            self.profiles.insert(name.clone(), profile);
        }
        Ok(self)
    }

    /// Looks up a profile by name.
    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::UnknownProfile(name.to_owned()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }
}
