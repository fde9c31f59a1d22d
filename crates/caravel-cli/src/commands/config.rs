//! `config`: inspect and edit the system settings file.

use caravel_core::CaravelResult;
use colored::Colorize;

use crate::engine::Engine;
use crate::ConfigCommands;

pub(crate) fn execute(engine: &mut Engine, command: &ConfigCommands) -> CaravelResult<()> {
    match command {
        ConfigCommands::List => list(engine),
        ConfigCommands::CreatePlatform { runner, name } => {
            let defaults = engine.registry.get(runner)?.default_config()?;
            engine.settings.create_platform(runner, name, &defaults)?;
            println!("Created platform {} ({})", name.cyan(), runner.yellow());
            Ok(())
        },
        ConfigCommands::RemovePlatform { name } => {
            engine.settings.remove_platform(name)?;
            println!("Removed platform {}", name.cyan());
            Ok(())
        },
        ConfigCommands::RenamePlatform { old, new } => {
            engine.settings.rename_platform(old, new)?;
            println!("Renamed platform {} to {}", old.cyan(), new.cyan());
            Ok(())
        },
        ConfigCommands::CopyPlatform { src, dst } => {
            engine.settings.copy_platform(src, dst)?;
            println!("Copied platform {} to {}", src.cyan(), dst.cyan());
            Ok(())
        },
        ConfigCommands::RenameRunner {
            old,
            new,
            update_platforms,
        } => {
            engine.settings.rename_runner(old, new, *update_platforms)?;
            println!("Renamed runner {} to {}", old.yellow(), new.yellow());
            Ok(())
        },
        ConfigCommands::RemoveRunner {
            name,
            remove_platforms,
        } => {
            engine.settings.remove_runner(name, *remove_platforms)?;
            println!("Removed runner {}", name.yellow());
            Ok(())
        },
    }
}

fn list(engine: &Engine) -> CaravelResult<()> {
    println!(
        "{} {}",
        "Settings file:".bold(),
        engine.settings.path().display()
    );
    println!("{}", "Platforms:".bold());
    for name in engine.settings.platform_names() {
        let (kind, _) = engine.settings.resolve_platform(&name)?;
        println!("  {} -> {}", name.cyan(), kind.yellow());
    }
    Ok(())
}
