//! Kiln CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("kiln={level}").parse()?)
        .add_directive(format!("kiln_driver={level}").parse()?);

    // Logs go to stderr; stdout may carry an archive.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            cli.json_logs
                .then(|| fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.json_logs)
                .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr)),
        )
        .init();

    cli.execute().await
}
