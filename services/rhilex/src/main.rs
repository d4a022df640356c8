//! rhilex gateway binary

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use common::LoadedConfig;
use rhilex::maintenance::{self, WorkDir};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "rhilex",
    version = env!("CARGO_PKG_VERSION"),
    about = "Industrial IoT edge gateway",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway
    Run {
        #[arg(long, default_value = "rhilex.ini", env = "RHILEX_CONFIG")]
        config: PathBuf,
    },
    /// Replace the working database with upload/recovery.db
    Recover {
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        recover: bool,
        #[arg(long, default_value = "rhilex.ini")]
        config: PathBuf,
    },
    /// Install upload/firmware/rhilex over the running binary
    Upgrade {
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        upgrade: bool,
    },
}

fn db_path(config: &Path) -> String {
    match LoadedConfig::load(config) {
        Ok(loaded) => loaded.app.db_path,
        Err(e) => {
            info!("Config {} unavailable ({}), using default database path", config.display(), e);
            common::RhilexConfig::default().db_path
        },
    }
}

async fn execute(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { config } => rhilex::bootstrap::run(config).await,
        Command::Recover { recover, config } => {
            let _ = common::logging::init("info");
            if !recover {
                info!("[DATA RECOVER] Nothing todo");
                return Ok(());
            }
            let dir = WorkDir::current()?;
            let backup = maintenance::recover(&dir, db_path(&config)).context("Data recover failed")?;
            if let Some(backup) = backup {
                info!("[DATA RECOVER] Old database kept at {}", backup.display());
            }
            info!("[DATA RECOVER] Finished");
            Ok(())
        },
        Command::Upgrade { upgrade } => {
            let _ = common::logging::init("info");
            if !upgrade {
                info!("[RHILEX UPGRADE] Nothing todo");
                return Ok(());
            }
            let exe = std::env::current_exe().context("Cannot locate the running binary")?;
            let dir = WorkDir::current()?;
            let old = maintenance::upgrade(&dir, exe).context("Upgrade failed")?;
            info!("[RHILEX UPGRADE] Finished, previous binary at {}", old.display());
            Ok(())
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = execute(cli.command).await {
        error!("{:#}", e);
        eprintln!("rhilex: {:#}", e);
        std::process::exit(1);
    }
}
