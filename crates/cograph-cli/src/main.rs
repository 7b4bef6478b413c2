use anyhow::{Context, Result};
use cograph_cli::cli::{Cli, parse_cli};
use cograph_cli::logging::init_logging;
use cograph_cli::run_command;
use cograph_config::{config_path, ensure_workspace_config, validate_config};

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging(cli.log_format, cli.verbose)?;
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_command(&workspace, &config, cli.command, &mut out)
}
