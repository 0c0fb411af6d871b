use std::env;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs the global tracing subscriber, logging to stderr.
///
/// With `debug`, the default level is raised to `DEBUG`, which logs every failed request.
pub fn init_tracing(debug: bool) {
    let (level, env_filter) = parse_rust_log(env::var(EnvFilter::DEFAULT_ENV).ok(), debug);
    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(level)))
        .with(env_filter)
        .init();
}

pub fn parse_rust_log(rust_log: Option<String>, debug: bool) -> (Level, EnvFilter) {
    // Try to parse RUST_LOG as a simple level filter and apply default levels internally.
    // Otherwise, use it literally if the user knows which overrides they want to run.
    let default = if debug { Level::DEBUG } else { Level::INFO };
    let level = match rust_log {
        Some(value) => match value.parse::<Level>() {
            Ok(level) => level,
            Err(_) => return (Level::TRACE, EnvFilter::new(value)),
        },
        None => default,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        hyper=WARN,\
        reqwest=WARN,\
        owners_loadtest=TRACE,\
        ",
    );

    (level, env_filter)
}
