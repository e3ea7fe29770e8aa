//! # capsule
//!
//! Runs a shell or command inside an isolated container built from a
//! root filesystem directory, or inside a running named instance.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use clap::Parser;
use capsule_common::error::EXIT_CONFIG;
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, LogFormat};

fn init_tracing(debug: bool, format: LogFormat) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[allow(clippy::print_stderr)]
fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_format);

    let code = match commands::execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("capsule: config failed: {e:#}");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}
