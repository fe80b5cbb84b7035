use anyhow::Result;
use tracing::info;

use agency::board::server::{self, ServerConfig};
use agency::config::{AgencyConfig, AgencyToml};

pub async fn cmd_serve(config: &AgencyConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }
    server::start_server(config.server_config()).await
}

/// Create the config file (if missing) and the database with its schema.
pub fn cmd_init(config: &AgencyConfig) -> Result<()> {
    if config.config_path.exists() {
        println!("Using existing config at {}", config.config_path.display());
    } else {
        if let Some(parent) = config.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        AgencyToml::default().save(&config.config_path)?;
        println!("Created config at {}", config.config_path.display());
    }

    let server_config: ServerConfig = config.server_config();
    server::open_database(&server_config)?;
    info!(db = %server_config.db_path.display(), "database initialized");
    println!("Database initialized at {}", server_config.db_path.display());
    Ok(())
}
