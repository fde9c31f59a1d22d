//! `show-config`: render the effective configuration as YAML.

use caravel_core::CaravelResult;

use crate::engine::Engine;
use crate::CommonOpts;

pub(crate) fn execute(engine: &Engine, common: &CommonOpts, resolve: bool) -> CaravelResult<()> {
    let (config, _) = engine.build_config(common, resolve)?;
    print!("{}", config.to_yaml());
    Ok(())
}
