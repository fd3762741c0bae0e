mod commands;
mod output;

use clap::{Parser, Subcommand};
use miette::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use transit_core::config::DEFAULT_DATA_DIR;
use transit_core::prelude::*;

#[derive(Parser)]
#[command(name = "transit")]
#[command(about = "Move a model's state between controllers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Agent data directory
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Machine whose agent configuration supplies the store connection
    #[arg(long, default_value = "0", value_parser = parse_machine)]
    machine: MachineId,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a model's state as a snapshot
    Export {
        /// UUID of the model to export
        uuid: ModelUuid,

        /// Write the snapshot here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Import a model from a snapshot file
    Import {
        /// Snapshot file produced by `transit export`
        file: PathBuf,
    },
    /// Remove what an interrupted import left behind
    Recover {
        /// UUID of the model whose import was interrupted
        uuid: ModelUuid,
    },
}

fn parse_machine(s: &str) -> std::result::Result<MachineId, String> {
    MachineId::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .rgb_colors(miette::RgbColors::Preferred)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if cli.debug {
        EnvFilter::new("transit_core=debug,transit_cli=debug,warn")
    } else {
        EnvFilter::new("transit_core=info,transit_cli=info,warn")
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
        .compact()
        .init();

    // Load the agent configuration of the machine we run on
    let agent = AgentConfig::load(&cli.data_dir, &cli.machine).await?;
    info!("Using agent configuration of {}", agent.tag);

    let store_config = agent.store_connection_info()?;
    tracing::debug!("Using store config: {:?}", store_config);
    let store = open_store(&store_config).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling the running operation");
            on_interrupt.cancel();
        }
    });

    let ctx = MigrationContext::new(
        cancel,
        tracing::info_span!("transit", machine = %cli.machine),
        agent.migration_config(),
    );

    match &cli.command {
        Commands::Export { uuid, output } => {
            commands::export(store, uuid, output.as_deref(), &ctx).await?;
        }
        Commands::Import { file } => {
            commands::import(store, file, &ctx).await?;
        }
        Commands::Recover { uuid } => {
            commands::recover(store, uuid, &ctx).await?;
        }
    }

    Ok(())
}
