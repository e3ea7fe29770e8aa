//! `capsule exec`: run a command inside a container.

use clap::Args;
use capsule_common::config::EngineConfig;

use super::LaunchArgs;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Launch options.
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Command to execute, searched on the container `PATH`.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// The process exits with the command's own status.
///
/// # Errors
///
/// Returns an error if the image path cannot be resolved.
pub fn execute(args: ExecArgs, config: EngineConfig) -> anyhow::Result<i32> {
    let mut options = args.launch.to_options()?;
    options.set_list("command", args.command);
    Ok(super::launch(config, &options))
}
