//! A load generator for the owners CRUD API.
//!
//! A run selects a traffic-shape [`Profile`](profile::Profile) from the
//! [`Registry`](profile::Registry), seeds a baseline of owners, and then drives a fleet of
//! virtual users against a [`Remote`](remote::Remote). Each virtual user picks weighted actions
//! (list, read, create, update, delete), resolves targets from the seed pool and the owners it
//! created itself, and records every request into shared [`Metrics`](metrics::Metrics).
//!
//! Request failures never abort a run. They are retried when transient, counted by status and
//! sampled for diagnosis. The run ends with a [`RunReport`](report::RunReport) that is evaluated
//! against the profile's thresholds.
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod observability;
pub mod pool;
pub mod profile;
pub mod remote;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod setup;
pub mod vu;
pub mod workload;

pub use crate::runner::run;
