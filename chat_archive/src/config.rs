use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::error::ArchiveError;

/// Command line options for the archiver.
#[derive(Parser, Debug, Default)]
#[command(name = "chat-archive", about = "Archive chat history into a local store")]
pub struct Cli {
    /// Walk every dialog back to the start of its history.
    #[arg(long, conflicts_with = "days")]
    pub all: bool,
    /// Only archive messages from the last N days.
    #[arg(long)]
    pub days: Option<u32>,
    /// Restrict the backfill to one dialog id.
    #[arg(long)]
    pub dialog: Option<i64>,
    /// Keep listening for new events after the backfill.
    #[arg(long)]
    pub listen: bool,
    /// Alternate session file for the bridge.
    #[arg(long)]
    pub session: Option<PathBuf>,
    /// Do not forward self-destructing media to the own chat.
    #[arg(long)]
    pub dont_save_self_destructing: bool,
    /// Print the N most recent archived messages and exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "10", value_name = "N")]
    pub log: Option<usize>,
    /// Reconcile media files with the store and exit (dry run unless --commit).
    #[arg(long)]
    pub consolidate: bool,
    /// Apply the changes found by --consolidate.
    #[arg(long, requires = "consolidate")]
    pub commit: bool,
    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Credentials {
    pub api_id: String,
    pub api_hash: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .finish()
    }
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the dialog folders.
    pub root: PathBuf,
    pub database: PathBuf,
    /// Bridge program and its arguments.
    pub bridge_command: String,
    pub bridge_args: Vec<String>,
    pub session: PathBuf,
    pub page_size: usize,
    pub reconnect_backoff: Duration,
    pub save_self_destructing: bool,
    pub logging_enabled: bool,
    pub credentials: Option<Credentials>,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    store: FileStore,
    #[serde(default)]
    bridge: FileBridge,
    #[serde(default)]
    media: FileMedia,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    credentials: Option<FileCredentials>,
}

#[derive(Deserialize, Default)]
struct FileStore {
    root: Option<PathBuf>,
    database: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileBridge {
    #[serde(default = "default_bridge_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_session")]
    session: PathBuf,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default = "default_backoff_secs")]
    reconnect_backoff_secs: u64,
}

#[derive(Deserialize)]
struct FileMedia {
    #[serde(default = "default_true")]
    save_self_destructing: bool,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileCredentials {
    api_id: String,
    api_hash: String,
}

fn default_root() -> PathBuf {
    PathBuf::from("store")
}

fn default_bridge_command() -> String {
    "chat-bridge".into()
}

fn default_session() -> PathBuf {
    PathBuf::from(".session")
}

fn default_page_size() -> usize {
    100
}

fn default_backoff_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for FileBridge {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
            session: default_session(),
            page_size: default_page_size(),
            reconnect_backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for FileMedia {
    fn default() -> Self {
        Self {
            save_self_destructing: default_true(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_ARCHIVE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("chat_archive.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let mut root = file_cfg.store.root.unwrap_or_else(default_root);
        let mut session = file_cfg.bridge.session;
        let mut logging = file_cfg.logging.enabled;
        let mut save_self_destructing = file_cfg.media.save_self_destructing;
        let mut api_id = file_cfg.credentials.as_ref().map(|c| c.api_id.clone());
        let mut api_hash = file_cfg.credentials.map(|c| c.api_hash);

        // environment overrides
        if let Ok(r) = std::env::var("CHAT_ARCHIVE_ROOT") {
            root = PathBuf::from(r);
        }
        if let Ok(s) = std::env::var("CHAT_ARCHIVE_SESSION") {
            session = PathBuf::from(s);
        }
        if let Ok(l) = std::env::var("CHAT_ARCHIVE_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(id) = std::env::var("CHAT_ARCHIVE_API_ID") {
            api_id = Some(id);
        }
        if let Ok(hash) = std::env::var("CHAT_ARCHIVE_API_HASH") {
            api_hash = Some(hash);
        }

        // CLI overrides
        if let Some(s) = &cli.session {
            session = s.clone();
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if cli.dont_save_self_destructing {
            save_self_destructing = false;
        }

        if file_cfg.bridge.page_size == 0 {
            anyhow::bail!("invalid_page_size");
        }

        let database = file_cfg
            .store
            .database
            .unwrap_or_else(|| root.join("store.sqlite"));
        let credentials = match (api_id, api_hash) {
            (Some(api_id), Some(api_hash)) if !api_id.is_empty() && !api_hash.is_empty() => {
                Some(Credentials { api_id, api_hash })
            }
            _ => None,
        };

        Ok(Self {
            root,
            database,
            bridge_command: file_cfg.bridge.command,
            bridge_args: file_cfg.bridge.args,
            session,
            page_size: file_cfg.bridge.page_size,
            reconnect_backoff: Duration::from_secs(file_cfg.bridge.reconnect_backoff_secs),
            save_self_destructing,
            logging_enabled: logging,
            credentials,
        })
    }

    /// Credentials for modes that talk to the bridge.
    pub fn require_credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ArchiveError::MissingCredentials.into())
    }
}
