use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

const DEFAULT_DIRECTIVES: &str = "cograph_cli=info,cograph_build=info,cograph_store=warn";
const VERBOSE_DIRECTIVES: &str = "cograph_cli=debug,cograph_build=debug,cograph_store=debug";

/// `RUST_LOG` wins over `--verbose` when set. Logs go to stderr; stdout carries
/// command output only.
pub fn init_logging(format: LogFormat, verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_DIRECTIVES
        } else {
            DEFAULT_DIRECTIVES
        })
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let installed = match format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}
