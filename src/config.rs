use crate::error::{Error, Result};
use crate::repo::Meta;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "meshgrep";
const CONFIG_FILE: &str = "config.json";

/// Directory created under a repo root when indexes live in-repo
pub const IN_REPO_INDEX_DIR: &str = ".meshgrep";

/// Node configuration, passed explicitly to every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the node's RPC server listens on
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,

    /// Shards per repo; 0 falls back to the default
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Upper bound on concurrently running sub-queries per request
    #[serde(default = "default_max_search_c")]
    pub max_search_c: usize,

    /// Distinct remote hosts a single query may fan out to (0 = unlimited)
    #[serde(default = "default_max_remote_hosts")]
    pub max_remote_hosts: usize,

    /// Worker pool size for filename lookups
    #[serde(default = "default_find_concurrency")]
    pub find_concurrency: usize,

    #[serde(default = "default_timeout_index_ms")]
    pub timeout_index_ms: u64,

    #[serde(default = "default_timeout_search_ms")]
    pub timeout_search_ms: u64,

    /// Where shard directories are created (defaults to the app data dir)
    #[serde(default)]
    pub index_root: Option<PathBuf>,

    /// Place shards inside the indexed tree instead of under `index_root`
    #[serde(default)]
    pub index_in_repo: bool,

    /// This node's identity, conventionally `host` and `port.rpc`
    #[serde(default)]
    pub repo_meta: Meta,

    /// Extra name this node answers to when resolving `host` metadata
    #[serde(default)]
    pub local_host: Option<String>,

    /// Local index requests rebuild repos older than this
    #[serde(default = "default_repo_stale_after_secs")]
    pub repo_stale_after_secs: u64,

    /// Backing file for the repo store; in-memory only when unset
    #[serde(default)]
    pub repo_store: Option<PathBuf>,

    /// File name globs skipped while walking (directories prune their subtree)
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    #[serde(default = "default_index_extension")]
    pub index_extension: String,

    /// RPC port assumed for peers whose metadata carries no `port.rpc`
    #[serde(default = "default_rpc_port")]
    pub default_rpc_port: u16,
}

fn default_rpc_addr() -> String {
    format!("0.0.0.0:{}", default_rpc_port())
}

fn default_num_shards() -> usize {
    2
}

fn default_max_search_c() -> usize {
    16
}

fn default_max_remote_hosts() -> usize {
    8
}

fn default_find_concurrency() -> usize {
    4
}

fn default_timeout_index_ms() -> u64 {
    10 * 60 * 1000
}

fn default_timeout_search_ms() -> u64 {
    30 * 1000
}

fn default_repo_stale_after_secs() -> u64 {
    60 * 60
}

fn default_index_extension() -> String {
    "mgi".to_string()
}

fn default_exclude() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".hg".to_string(),
        ".svn".to_string(),
        IN_REPO_INDEX_DIR.to_string(),
        format!("*.{}", default_index_extension()),
    ]
}

fn default_rpc_port() -> u16 {
    7820
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_addr: default_rpc_addr(),
            num_shards: default_num_shards(),
            max_search_c: default_max_search_c(),
            max_remote_hosts: default_max_remote_hosts(),
            find_concurrency: default_find_concurrency(),
            timeout_index_ms: default_timeout_index_ms(),
            timeout_search_ms: default_timeout_search_ms(),
            index_root: None,
            index_in_repo: false,
            repo_meta: Meta::default(),
            local_host: None,
            repo_stale_after_secs: default_repo_stale_after_secs(),
            repo_store: None,
            exclude: default_exclude(),
            index_extension: default_index_extension(),
            default_rpc_port: default_rpc_port(),
        }
    }
}

impl Config {
    /// Load config from the app data directory, or return default if not found
    pub fn load() -> anyhow::Result<Self> {
        let path = get_config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the app data directory
    pub fn save(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        let path = get_config_path()?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        if self.num_shards == 0 {
            default_num_shards()
        } else {
            self.num_shards
        }
    }

    pub fn timeout_index(&self) -> Duration {
        Duration::from_millis(self.timeout_index_ms)
    }

    pub fn timeout_search(&self) -> Duration {
        Duration::from_millis(self.timeout_search_ms)
    }

    pub fn repo_stale_after(&self) -> Duration {
        Duration::from_secs(self.repo_stale_after_secs)
    }

    /// Directory that holds the shards for `key` rooted at `root`
    pub fn index_path_for(&self, key: &str, root: &Path) -> Result<PathBuf> {
        if self.index_in_repo {
            return Ok(root.join(IN_REPO_INDEX_DIR));
        }
        let base = match &self.index_root {
            Some(base) => base.clone(),
            None => get_app_data_dir()
                .map_err(|e| Error::Internal(e.to_string()))?
                .join("indexes"),
        };
        Ok(base.join(key))
    }

    /// Compile the exclusion globs, matched against entry file names
    pub fn exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob = Glob::new(pattern).map_err(|e| Error::validation("exclude", e))?;
            builder.add(glob);
        }
        builder.build().map_err(|e| Error::validation("exclude", e))
    }
}

/// Get the path to the config file
pub fn get_config_path() -> anyhow::Result<PathBuf> {
    Ok(get_app_data_dir()?.join(CONFIG_FILE))
}

/// Get the application data directory
pub fn get_app_data_dir() -> anyhow::Result<PathBuf> {
    use anyhow::Context;

    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    let app_dir = base.join(APP_NAME);

    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}
