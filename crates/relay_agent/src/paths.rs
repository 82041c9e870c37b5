use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "relay";
pub const APP_NAME: &str = "relay-agent";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Default location of the SQLite queue/mediation store.
pub fn queue_database_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("RELAY_QUEUE_DATABASE") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("relay.db"))
}
