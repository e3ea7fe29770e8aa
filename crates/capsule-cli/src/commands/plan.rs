//! `capsule plan`: print what a launch would set up, without running it.

use clap::Args;
use capsule_common::config::EngineConfig;
use capsule_runtime::engine::{Engine, report_failure};

use super::LaunchArgs;
use crate::output;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Launch options.
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Print the normalized option map as JSON instead of the plan.
    #[arg(long)]
    pub json: bool,

    /// Command the launch would run.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Executes the `plan` command.
///
/// Resolves and plans the launch exactly as `shell` or `exec` would, then
/// prints the namespaces and ordered mount operations. No namespace is
/// created and nothing is mounted.
///
/// # Errors
///
/// Returns an error if the image path cannot be resolved or the JSON
/// rendering fails.
#[allow(clippy::print_stdout)]
pub fn execute(args: &PlanArgs, config: EngineConfig) -> anyhow::Result<i32> {
    let mut options = args.launch.to_options()?;
    if !args.command.is_empty() {
        options.set_list("command", args.command.clone());
    }
    let engine = Engine::new(config);
    let prepared = match engine.prepare(&options) {
        Ok(prepared) => prepared,
        Err(e) => {
            report_failure(&e);
            return Ok(e.exit_code());
        }
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&prepared.spec().to_options())?);
    } else {
        print!("{}", output::render_plan(&prepared));
    }
    Ok(0)
}
