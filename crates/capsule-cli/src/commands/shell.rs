//! `capsule shell`: start an interactive shell inside a container.

use clap::Args;
use capsule_common::config::EngineConfig;

use super::LaunchArgs;

/// Arguments for the `shell` command.
#[derive(Args, Debug)]
pub struct ShellArgs {
    /// Launch options.
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Shell to run instead of the configured default.
    #[arg(short = 's', long)]
    pub shell: Option<String>,
}

/// Executes the `shell` command.
///
/// # Errors
///
/// Returns an error if the image path cannot be resolved.
pub fn execute(args: ShellArgs, config: EngineConfig) -> anyhow::Result<i32> {
    let mut options = args.launch.to_options()?;
    if let Some(shell) = args.shell {
        options.set_value("shell", shell);
    }
    Ok(super::launch(config, &options))
}
