use anyhow::Context;
use clap::Parser;
use collaboration::{AccessLevel, SyncConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Default)]
#[command(name = "collab-server")]
#[command(about = "Authoritative room server for shared beatmap editing")]
#[command(version)]
pub struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept WebSocket connections on
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Directory holding one snapshot file per document
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Access level for users without an explicit grant
    #[arg(long)]
    pub default_access: Option<AccessLevel>,

    /// How often dirty rooms are written to disk
    #[arg(long)]
    pub persist_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub snapshot_dir: PathBuf,
    pub default_access: AccessLevel,
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            snapshot_dir: PathBuf::from("snapshots"),
            default_access: AccessLevel::Edit,
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// File values (or defaults) with command-line overrides applied.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(listen) = args.listen {
            config.listen = listen;
        }
        if let Some(dir) = &args.snapshot_dir {
            config.snapshot_dir = dir.clone();
        }
        if let Some(access) = args.default_access {
            config.default_access = access;
        }
        if let Some(ms) = args.persist_interval_ms {
            config.sync.persist_interval_ms = ms;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"listen": "0.0.0.0:9000", "default_access": "view", "sync": {"history_capacity": 20}}"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "collab-server",
            "--config",
            path.to_str().unwrap(),
            "--default-access",
            "edit",
            "--persist-interval-ms",
            "250",
        ]);
        let config = ServerConfig::load(&args).unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.default_access, AccessLevel::Edit);
        assert_eq!(config.sync.history_capacity, 20);
        assert_eq!(config.sync.persist_interval_ms, 250);
        assert_eq!(config.snapshot_dir, PathBuf::from("snapshots"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/server.json")),
            ..Args::default()
        };
        assert!(ServerConfig::load(&args).is_err());
    }
}
