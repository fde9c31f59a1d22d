//! `run`: execute tasks sequentially on the selected platform.

use caravel_core::CaravelResult;
use colored::Colorize;

use crate::engine::Engine;
use crate::CommonOpts;

pub(crate) async fn execute(engine: &Engine, common: &CommonOpts) -> CaravelResult<()> {
    let (config, plugin) = engine.build_config(common, false)?;

    // A comma-separated task list runs in command-line order; the first
    // failure halts the sequence.
    let tasks: Vec<Option<String>> = match &common.task {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Some(t.to_owned()))
            .collect(),
        None => vec![None],
    };

    for task in tasks {
        if let Some(name) = &task {
            println!(
                "Running task {} on platform {}...",
                name.cyan().bold(),
                common.platform.yellow()
            );
        }
        let mut runner = Engine::runner(plugin, &config, task)?;
        runner.run().await?;
    }

    println!("{}", "Done.".green());
    Ok(())
}
