//! Load generator for the owners API.
#![warn(missing_debug_implementations)]

use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    owners_loadtest::cli::execute()
}
