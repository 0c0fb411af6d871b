//! Configuration for a load test run.
//!
//! Values are merged from, in increasing order of precedence:
//! 1. Built-in defaults
//! 2. A YAML configuration file
//! 3. Environment variables prefixed with `LT__`, nested with `__`
//! 4. Command line overrides
//!
//! ```yaml
//! base_url: https://owners.example.com/prod
//! scenario: critical
//! seed_count: 200
//! retry:
//!   max_attempts: 2
//!   retry_on: any
//! profiles:
//!   smoke:
//!     attribute: availability
//!     schedule:
//!       executor: constant-vus
//!       vus: 2
//!       duration: 30s
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::entity::OwnerFactory;
use crate::error::{Error, Result};
use crate::executor::{MAX_ATTEMPTS, RetryPolicy};
use crate::metrics::DEFAULT_ERROR_SAMPLES;
use crate::profile::{DEFAULT_PROFILE, Profile, Registry};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "LT__";

/// Runtime configuration of the load tester.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the owners API. `memory://` runs against an in-process store.
    pub base_url: String,
    /// Name of the traffic-shape profile to run.
    pub scenario: String,
    /// Length of generated telephone numbers. Longer numbers make self-inflicted conflicts in
    /// long runs less likely, see [`OwnerFactory`].
    pub phone_len: usize,
    /// Number of owners created by the setup phase.
    pub seed_count: usize,
    /// Logs every failed request and raises the log level.
    pub debug: bool,
    /// Maximum number of failed requests kept in the report.
    pub error_samples_max: usize,

    #[serde(with = "humantime_serde")]
    pub setup_timeout: Duration,
    /// Pause after each creation of the setup phase.
    #[serde(with = "humantime_serde")]
    pub setup_pacing: Duration,
    /// Timeout of a single attempt.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How often progress is logged during load.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Directory receiving the run summaries.
    pub output_dir: PathBuf,
    /// Where seed owner ids are persisted after each run.
    pub seed_file: PathBuf,
    /// Load the seed pool from `seed_file` instead of creating owners.
    pub reuse_seeds: bool,

    pub retry: RetryPolicy,

    /// Additional profiles, overriding built-ins of the same name.
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            scenario: DEFAULT_PROFILE.into(),
            phone_len: 10,
            seed_count: 500,
            debug: false,
            error_samples_max: DEFAULT_ERROR_SAMPLES,
            setup_timeout: Duration::from_secs(120),
            setup_pacing: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
            output_dir: PathBuf::from("load_tests"),
            seed_file: PathBuf::from("load_tests/seed-owners.json"),
            reuse_seeds: false,
            retry: RetryPolicy::default(),
            profiles: BTreeMap::new(),
        }
    }
}

/// Values given on the command line, taking precedence over all other sources.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub scenario: Option<String>,
    pub base_url: Option<String>,
}

impl Config {
    /// Loads and validates configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, if environment variables
    /// contain invalid values, or if [`validate`](Self::validate) rejects the result.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file_exact(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(scenario) = &overrides.scenario {
            figment = figment.merge(Serialized::default("scenario", scenario));
        }
        if let Some(base_url) = &overrides.base_url {
            figment = figment.merge(Serialized::default("base_url", base_url));
        }

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The profile catalogue including custom profiles.
    pub fn registry(&self) -> Result<Registry> {
        Registry::builtin().with_custom(&self.profiles)
    }

    /// Rejects out-of-range values and unknown scenarios.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(Error::InvalidConfig(msg)) };

        OwnerFactory::new(self.phone_len)?;
        if !(1..=MAX_ATTEMPTS).contains(&self.retry.max_attempts) {
            return invalid(format!(
                "retry.max_attempts must be between 1 and {MAX_ATTEMPTS}, got {}",
                self.retry.max_attempts
            ));
        }
        if self.retry.jitter > self.retry.base {
            return invalid("retry.jitter must not exceed retry.base".into());
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive".into());
        }
        if self.monitor_interval.is_zero() {
            return invalid("monitor_interval must be positive".into());
        }
        if self.setup_timeout.is_zero() {
            return invalid("setup_timeout must be positive".into());
        }

        self.registry()?.get(&self.scenario)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::executor::RetryOn;
    use crate::profile::Schedule;

    #[test]
    fn defaults_are_valid() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &Overrides::default()).unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.scenario, "spike");
            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LT__BASE_URL", "memory://");
            jail.set_env("LT__SCENARIO", "critical");
            jail.set_env("LT__PHONE_LEN", "12");
            jail.set_env("LT__SETUP_TIMEOUT", "5m");
            jail.set_env("LT__RETRY__RETRY_ON", "any");
            jail.set_env("LT__RETRY__MAX_ATTEMPTS", "2");

            let config = Config::load(None, &Overrides::default()).unwrap();
            assert_eq!(config.base_url, "memory://");
            assert_eq!(config.scenario, "critical");
            assert_eq!(config.phone_len, 12);
            assert_eq!(config.setup_timeout, Duration::from_secs(300));
            assert_eq!(config.retry.retry_on, RetryOn::Any);
            assert_eq!(config.retry.max_attempts, 2);
            assert_eq!(config.retry.base, Duration::from_millis(100));

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            scenario: smoke
            seed_count: 10
            reuse_seeds: true
            profiles:
                smoke:
                    attribute: availability
                    schedule:
                        executor: constant-vus
                        vus: 2
                        duration: 30s
                    weights:
                        - action: list
                          weight: 3
                        - action: read_by_id
                          weight: 1
                    read_scope:
                        hot_seeds: 5
                    thresholds:
                        max_p95: 1s
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path()), &Overrides::default()).unwrap();
            assert_eq!(config.seed_count, 10);
            assert!(config.reuse_seeds);

            let registry = config.registry().unwrap();
            let smoke = registry.get("smoke").unwrap();
            assert_eq!(
                smoke.schedule,
                Schedule::ConstantVus {
                    vus: 2,
                    duration: Duration::from_secs(30)
                }
            );
            assert_eq!(smoke.thresholds.max_p95, Duration::from_secs(1));
            assert_eq!(smoke.thresholds.max_error_rate, 0.01);

            Ok(())
        });
    }

    #[test]
    fn cli_overrides_win() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LT__SCENARIO", "soak");

            let overrides = Overrides {
                scenario: Some("peak".into()),
                base_url: Some("https://example.com/prod".into()),
            };
            let config = Config::load(None, &overrides).unwrap();
            assert_eq!(config.scenario, "peak");
            assert_eq!(config.base_url, "https://example.com/prod");

            Ok(())
        });
    }

    #[test]
    fn rejects_unknown_scenario() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LT__SCENARIO", "nope");
            let err = Config::load(None, &Overrides::default()).unwrap_err();
            assert!(matches!(err, Error::UnknownProfile(_)));
            Ok(())
        });
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = Config {
            phone_len: 7,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config());

        let config = Config {
            retry: RetryPolicy {
                max_attempts: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            retry: RetryPolicy {
                jitter: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        figment::Jail::expect_with(|_jail| {
            let result = Config::load(Some(Path::new("does-not-exist.yml")), &Overrides::default());
            assert!(matches!(result, Err(Error::Config(_))));
            Ok(())
        });
    }
}
