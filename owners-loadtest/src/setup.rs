//! Seeding of baseline owners before load begins.
//!
//! The setup phase creates owners one at a time, so the system under test sees a gentle, ordered
//! stream of writes. Its requests are recorded into their own [`Metrics`] and never mix with the
//! metrics of the load phase. Alternatively, the ids of a previous run can be reused from the seed
//! file written at the end of every run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::entity::{Origin, OwnerFactory, OwnerOverrides};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metrics::{ErrorSample, Metrics, MetricsSnapshot};
use crate::pool::{OwnerId, SeedPool};

/// Contents of `seed-owners.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
    pub seed_ids: Vec<OwnerId>,
}

/// What the setup phase did.
#[derive(Clone, Debug, Serialize)]
pub struct SetupSummary {
    /// Owners the setup phase tried to create.
    pub attempted: u64,
    /// Size of the resulting seed pool.
    pub seeded: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// The seed pool was loaded from a previous run.
    pub reused: bool,
    pub metrics: MetricsSnapshot,
    /// Failed creations, bounded like the samples of the load phase.
    pub error_samples: Vec<ErrorSample>,
}

/// Creates `count` owners, pausing `pacing` between creations, and collects their ids.
///
/// Creations that fail are skipped, so the pool may end up smaller than `count`, and sampled up to
/// the sample capacity of the executor's metrics. The whole phase fails with
/// [`Error::SetupTimeout`] if it takes longer than `timeout`.
pub async fn seed(
    executor: &Executor,
    factory: &OwnerFactory,
    count: usize,
    pacing: Duration,
    timeout: Duration,
) -> Result<(SeedPool, SetupSummary)> {
    let metrics = Arc::new(Metrics::new(executor.metrics().sample_capacity()));
    let executor = executor.with_metrics(Arc::clone(&metrics));
    let start = Instant::now();

    let create_all = async {
        let mut ids = Vec::with_capacity(count);
        for sequence in 0..count {
            let owner = factory.make(&OwnerOverrides::default(), Origin::Sequence(sequence as u64));
            let response = executor.create(&owner).await;
            match response.owner_id() {
                Some(id) => ids.push(id),
                None => tracing::debug!(status = ?response.status, sequence, "failed to seed owner"),
            }
            if sequence + 1 < count {
                tokio::time::sleep(pacing).await;
            }
        }
        ids
    };

    let ids = tokio::time::timeout(timeout, create_all)
        .await
        .map_err(|_| Error::SetupTimeout(timeout))?;

    let summary = SetupSummary {
        attempted: count as u64,
        seeded: ids.len(),
        duration: start.elapsed(),
        reused: false,
        metrics: metrics.snapshot(),
        error_samples: metrics.error_samples(),
    };
    tracing::info!(seeded = summary.seeded, attempted = count, "setup finished");

    Ok((SeedPool::new(ids), summary))
}

/// Loads the seed pool persisted by a previous run.
pub fn load_seed_file(path: &Path) -> Result<(SeedPool, SetupSummary)> {
    let start = Instant::now();
    let contents = std::fs::read(path)?;
    let file: SeedFile = serde_json::from_slice(&contents).map_err(|cause| Error::SeedFile {
        path: path.to_owned(),
        cause,
    })?;

    tracing::info!(seeded = file.seed_ids.len(), path = %path.display(), "reusing seed owners");
    let summary = SetupSummary {
        attempted: 0,
        seeded: file.seed_ids.len(),
        duration: start.elapsed(),
        reused: true,
        metrics: MetricsSnapshot::default(),
        error_samples: Vec::new(),
    };
    Ok((SeedPool::new(file.seed_ids), summary))
}

/// Persists `seeds` for reuse by a later run.
pub fn write_seed_file(path: &Path, seeds: &SeedPool) -> Result<()> {
    let file = SeedFile {
        seed_ids: seeds.ids().to_vec(),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(|cause| Error::Serde {
        context: "seed file".into(),
        cause,
    })?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}
