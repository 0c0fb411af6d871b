//! Error types for the load test engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that abort a load test run before or instead of producing a report.
///
/// Request failures against the system under test are never surfaced through this type. They are
/// recorded in [`Metrics`](crate::metrics::Metrics) and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested traffic-shape profile is not part of the registry.
    #[error("unknown traffic-shape profile `{0}`")]
    UnknownProfile(String),

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration sources could not be merged or extracted.
    #[error("failed to load configuration")]
    Config(#[from] Box<figment::Error>),

    /// Seeding the baseline owners did not finish in time.
    #[error("setup did not finish within {0:?}")]
    SetupTimeout(Duration),

    /// The HTTP client for the remote could not be constructed.
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    /// A persisted seed file could not be read or parsed.
    #[error("failed to load seed file {}", .path.display())]
    SeedFile {
        /// Location of the seed file.
        path: PathBuf,
        #[source]
        cause: serde_json::Error,
    },

    /// Errors related to de/serialization of report artifacts.
    #[error("serde error: {context}")]
    Serde {
        /// What was being serialized.
        context: String,
        #[source]
        cause: serde_json::Error,
    },

    /// IO errors when reading inputs or writing report artifacts.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for errors raised while validating the run configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::UnknownProfile(_) | Error::InvalidConfig(_) | Error::Config(_)
        )
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
