//! Complete runs of the built-in profiles against the in-memory owners store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use owners_loadtest::config::Config;
use owners_loadtest::entity::OwnerFactory;
use owners_loadtest::error::Error;
use owners_loadtest::executor::{Executor, RetryPolicy};
use owners_loadtest::metrics::Metrics;
use owners_loadtest::pool::{OwnerId, SeedPool};
use owners_loadtest::profile::Profile;
use owners_loadtest::remote::{Endpoint, InMemoryRemote, Method, SharedRemote};
use owners_loadtest::{run, setup};
use tokio_util::sync::CancellationToken;

fn config(scenario: &str, seed_count: usize) -> Config {
    Config {
        base_url: "memory://".into(),
        scenario: scenario.into(),
        phone_len: 20,
        seed_count,
        setup_pacing: Duration::ZERO,
        ..Default::default()
    }
}

fn shared(remote: &InMemoryRemote) -> SharedRemote {
    Arc::new(remote.clone())
}

#[tokio::test(start_paused = true)]
async fn critical_only_writes() {
    let remote = InMemoryRemote::new();
    let report = run(&config("critical", 5), shared(&remote), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.setup.seeded, 5);
    assert!(!report.interrupted);

    let metrics = &report.metrics;
    assert!(metrics.requests_to(Endpoint::CreateOwner) > 0);
    assert!(metrics.requests_to(Endpoint::UpdateOwner) > 0);
    assert_eq!(metrics.requests_to(Endpoint::ListOwners), 0);
    assert_eq!(metrics.requests_to(Endpoint::GetOwner), 0);
    assert_eq!(metrics.requests_to(Endpoint::DeleteOwner), 0);
    assert_eq!(remote.requests_with(Method::Delete), 0);

    // Telephones never collide, so every write is accepted.
    assert_eq!(metrics.named_errors.conflict, 0);
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn cold_lists_five_times() {
    let remote = InMemoryRemote::new();
    let report = run(&config("cold", 3), shared(&remote), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.requests_to(Endpoint::ListOwners), 5);
    assert_eq!(report.metrics.requests, 5);
    assert_eq!(report.metrics.iterations, 5);
    assert!(report.duration >= Duration::from_secs(60 * 60));
    assert!(report.duration < Duration::from_secs(61 * 60));
    assert_eq!(report.seed_ids.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_falls_back_to_listing() {
    let deletes: Profile = serde_json::from_value(serde_json::json!({
        "attribute": "cleanup",
        "schedule": {"executor": "constant-vus", "vus": 2, "duration": "10s"},
        "weights": [{"action": "delete", "weight": 1}],
        "pacing": "1s"
    }))
    .unwrap();
    let config = Config {
        profiles: BTreeMap::from([("cleanup".to_owned(), deletes)]),
        ..config("cleanup", 0)
    };

    let remote = InMemoryRemote::new();
    let report = run(&config, shared(&remote), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.setup.seeded, 0);
    assert!(report.metrics.requests_to(Endpoint::ListOwners) >= 10);
    assert_eq!(report.metrics.requests_to(Endpoint::DeleteOwner), 0);
    assert_eq!(report.metrics.failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn setup_is_repeatable() {
    let factory = OwnerFactory::new(20).unwrap();
    let mut sizes = Vec::new();

    for _ in 0..2 {
        let remote = InMemoryRemote::new();
        let executor = Executor::new(
            shared(&remote),
            Arc::new(Metrics::default()),
            RetryPolicy::default(),
        );
        let (seeds, summary) = setup::seed(
            &executor,
            &factory,
            10,
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(seeds.len(), remote.len());
        assert_eq!(summary.attempted, 10);
        sizes.push(seeds.len());
    }

    assert_eq!(sizes, [10, 10]);
}

#[tokio::test(start_paused = true)]
async fn slow_setup_aborts_the_run() {
    let config = Config {
        setup_pacing: Duration::from_secs(1),
        setup_timeout: Duration::from_secs(5),
        ..config("critical", 20)
    };

    let remote = InMemoryRemote::new();
    let err = run(&config, shared(&remote), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SetupTimeout(_)));
    assert!(remote.requests_to(Endpoint::CreateOwner) <= 6);
    assert_eq!(remote.requests_to(Endpoint::UpdateOwner), 0);
}

#[tokio::test(start_paused = true)]
async fn reuses_persisted_seeds() {
    let tempdir = tempfile::tempdir().unwrap();
    let seed_file = tempdir.path().join("seed-owners.json");
    let seeds = SeedPool::new(vec![OwnerId::Number(7), OwnerId::Text("abc".into())]);
    setup::write_seed_file(&seed_file, &seeds).unwrap();

    let config = Config {
        reuse_seeds: true,
        seed_file,
        ..config("cold", 50)
    };

    let remote = InMemoryRemote::new();
    let report = run(&config, shared(&remote), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.setup.reused);
    assert_eq!(report.setup.seeded, 2);
    assert_eq!(remote.requests_to(Endpoint::CreateOwner), 0);
    assert_eq!(report.seed_ids, seeds.ids());
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_still_reports() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let remote = InMemoryRemote::new();
    let report = run(&config("soak", 2), shared(&remote), cancel)
        .await
        .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.setup.seeded, 2);
    assert!(report.duration < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn failing_api_crosses_thresholds() {
    let remote = InMemoryRemote::new();
    remote.fail_next(404, 1_000);

    let report = run(&config("cold", 2), shared(&remote), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.setup.seeded, 0);
    assert_eq!(report.metrics.named_errors.not_found, 5);
    assert_eq!(report.error_samples.len(), 5);
    assert!(!report.passed());

    let failed: Vec<_> = report
        .thresholds
        .iter()
        .filter(|threshold| !threshold.passed)
        .map(|threshold| threshold.metric)
        .collect();
    assert!(!failed.is_empty());
}
