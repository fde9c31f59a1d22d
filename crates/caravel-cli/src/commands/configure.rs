//! `configure`: prepare the substrate for the package.

use caravel_core::CaravelResult;
use colored::Colorize;

use crate::engine::Engine;
use crate::CommonOpts;

pub(crate) async fn execute(engine: &Engine, common: &CommonOpts) -> CaravelResult<()> {
    let (config, plugin) = engine.build_config(common, false)?;
    println!(
        "Configuring {} for platform {}...",
        config.description().name.cyan().bold(),
        common.platform.yellow()
    );

    let mut runner = Engine::runner(plugin, &config, None)?;
    runner.configure().await?;

    println!("{}", "Configured.".green());
    Ok(())
}
