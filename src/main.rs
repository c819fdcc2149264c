/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use mdstore::{BackendKind, Container, Database, Migrator, StoreConfig};

#[derive(Parser)]
#[command(name = "mdstore")]
#[command(about = "Maintenance of a multi-device messaging store", long_about = None)]
struct Cli {
    /// Configuration file, defaults to <config dir>/mdstore/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema upgrades
    Upgrade,

    /// Show the schema version and the stored devices
    Status,

    /// Delete a device and everything stored for it
    DeleteDevice {
        jid: String,
    },
}

fn default_database() -> Result<String> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("Cannot find data dir"))?
        .join("mdstore");
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Cannot create data dir {}", data_dir.display()))?;
    Ok(data_dir.join("store.db").to_string_lossy().into_owned())
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    let default_path = dirs::config_dir().map(|dir| dir.join("mdstore").join("config.toml"));
    let mut config = match (path, default_path) {
        (Some(path), _) => StoreConfig::load(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?,
        (None, Some(path)) if path.exists() => StoreConfig::load(&path)
            .with_context(|| format!("Cannot read config {}", path.display()))?,
        (None, _) => {
            let mut config = StoreConfig::default();
            config.database.url = default_database()?;
            config
        }
    };
    if config.database.backend == BackendKind::Sqlite && config.database.url.is_empty() {
        config.database.url = default_database()?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _logger = flexi_logger::Logger::try_with_env_or_str(&config.log_level)?.start()?;

    match cli.command {
        Commands::Upgrade => {
            let database = Database::connect(&config).context("Cannot open database")?;
            let version = Migrator::new(&database)
                .upgrade()
                .context("Cannot upgrade database")?;
            println!("Database is at v{version}");
        }
        Commands::Status => {
            let database = Database::connect(&config).context("Cannot open database")?;
            let migrator = Migrator::new(&database);
            let version = migrator.version()?;
            println!("Schema v{version} (latest v{})", migrator.latest());
            if version != migrator.latest() {
                println!("Run `mdstore upgrade` to list devices");
                return Ok(());
            }
            let container = Container::from_database(database)?;
            for device in container.get_all_devices()? {
                println!("{} ({})", device.jid, device.push_name);
            }
        }
        Commands::DeleteDevice { jid } => {
            let container = Container::open(&config).context("Cannot open store")?;
            if container.get_device(&jid)?.is_none() {
                bail!("Unknown device {jid}");
            }
            container.delete_device(&jid)?;
            println!("Deleted {jid}");
        }
    }

    Ok(())
}
