//! `create`: scaffold a minimal runnable package.
//!
//! The generated package builds its own image (`build_strategy: auto`)
//! and declares one task writing a greeting into the workspace.

use std::path::Path;

use caravel_core::{CaravelError, CaravelResult, DESCRIPTION_FILE};
use colored::Colorize;

pub(crate) fn execute(name: &str, directory: &Path) -> CaravelResult<()> {
    let root = directory.join(name);
    let description = root.join(DESCRIPTION_FILE);
    if description.exists() {
        return Err(CaravelError::config(format!(
            "`{}` already exists; refusing to overwrite it",
            description.display()
        )));
    }

    let io_err = |path: &Path, e: std::io::Error| CaravelError::io(path.display().to_string(), e);

    for dir in [root.clone(), root.join("workspace"), root.join("build")] {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }

    std::fs::write(&description, description_template(name))
        .map_err(|e| io_err(&description, e))?;

    let dockerfile = root.join("build/Dockerfile");
    std::fs::write(&dockerfile, DOCKERFILE_TEMPLATE).map_err(|e| io_err(&dockerfile, e))?;

    let entrypoint = root.join("build/entrypoint.sh");
    std::fs::write(&entrypoint, ENTRYPOINT_TEMPLATE).map_err(|e| io_err(&entrypoint, e))?;

    println!("Created package {} at {}", name.cyan().bold(), root.display());
    println!("Try: caravel run --package={} --task=hello", root.display());
    Ok(())
}

fn description_template(name: &str) -> String {
    format!(
        r"name: {name}
version: 0.1.0
container:
  image: {name}:0.1.0
  build_strategy: auto
tasks:
  hello:
    parameters:
      outputs:
        greetings_dir: greetings/
"
    )
}

const DOCKERFILE_TEMPLATE: &str = "\
FROM ubuntu:22.04
COPY entrypoint.sh /workload/entrypoint.sh
RUN chmod +x /workload/entrypoint.sh
ENTRYPOINT [\"/workload/entrypoint.sh\"]
";

const ENTRYPOINT_TEMPLATE: &str = "\
#!/bin/sh
# First argument is the task name; the rest are --param=value pairs.
task=\"$1\"
shift
case \"$task\" in
  hello)
    for arg in \"$@\"; do
      case \"$arg\" in
        --greetings_dir=*) dir=\"${arg#--greetings_dir=}\" ;;
      esac
    done
    mkdir -p \"$dir\"
    echo \"Hello from $(hostname)\" > \"$dir/greeting.txt\"
    ;;
  *)
    echo \"unknown task: $task\" >&2
    exit 1
    ;;
esac
";
