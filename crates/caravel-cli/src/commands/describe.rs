//! `describe`: print the package identity, hardware expectations, and
//! per-task parameter tables. Platform-independent: no runner section
//! participates and nothing is validated against a substrate.

use caravel_config::effective::{build_effective, BuildRequest};
use caravel_config::hooks::NoRunner;
use caravel_config::ParsedArgs;
use caravel_core::{CaravelResult, Parameter};
use colored::Colorize;
use serde_yaml::Value;

use crate::CommonOpts;

pub(crate) fn execute(common: &CommonOpts) -> CaravelResult<()> {
    let args = ParsedArgs::parse(&common.extra)?;
    let config = build_effective(&BuildRequest {
        package: &common.package,
        args: &args,
        runner_defaults: Value::Null,
        hooks: &NoRunner,
        workspace: common.workspace.as_deref(),
        resolve: false,
    })?;
    let description = config.description();

    println!(
        "{} {} ({})",
        "Package:".bold(),
        description.name.cyan().bold(),
        description.version
    );
    println!("{} {}", "Root:".bold(), config.root().display());
    println!("{} {}", "Workspace:".bold(), config.workspace().display());

    if let Some(hw) = &description.platform {
        println!("{}", "Declared hardware expectations:".bold());
        if let Some(count) = hw.accelerator_count {
            let kind = hw.accelerator_type.as_deref().unwrap_or("accelerator");
            println!("  accelerators: {count} x {kind}");
        }
        if let Some(memory) = &hw.memory {
            println!("  memory: {memory}");
        }
        if let Some(disk) = &hw.disk {
            println!("  disk: {disk}");
        }
    }

    println!("{}", "Tasks:".bold());
    for (name, task) in &description.tasks {
        println!("  {}", name.cyan());
        if let Some(entrypoint) = &task.entrypoint {
            println!("    entrypoint: {entrypoint}");
        }
        print_params("inputs", &task.parameters.inputs);
        print_params("outputs", &task.parameters.outputs);
    }
    Ok(())
}

fn print_params(side: &str, params: &indexmap::IndexMap<String, Parameter>) {
    if params.is_empty() {
        return;
    }
    println!("    {side}:");
    for (name, param) in params {
        let default = param.default.as_deref().unwrap_or("");
        let opts = param.opts.map(|o| o.to_string()).unwrap_or_default();
        println!("      {name}: {} {default} ({opts})", param.kind);
    }
}
