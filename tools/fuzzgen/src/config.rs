use crate::errors::FuzzError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub listen: Option<String>,
    pub server_seed: Option<u64>,
    pub engine_seed: Option<u64>,
    pub spin_limit: Option<u32>,
    pub depth_limit: Option<u32>,
    pub strict_decisions: bool,
    pub store_path: Option<PathBuf>,
    pub session_log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub server: ServerConfig,
    pub tree: TreeConfig,
    pub driver: DriverConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    Never,
    Coin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub spin_limit: u32,
    pub depth_limit: u32,
    pub seed: Option<u64>,
    pub buffer_max: u64,
    pub text_max_len: u64,
    pub reuse: ReusePolicy,
    pub flush_each_record: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,
    pub seed: u64,
    pub strict_decisions: bool,
    pub session_log_dir: Option<PathBuf>,
    pub session_log_budget_bytes: u64,
    pub snapshot_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeConfig {
    pub window: usize,
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverConfig {
    pub count: u64,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub events_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spin_limit: 3,
            depth_limit: 20,
            seed: None,
            buffer_max: 4196,
            text_max_len: 64,
            reuse: ReusePolicy::Never,
            flush_each_record: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            server: ServerConfig {
                listen: "127.0.0.1:5555".to_string(),
                seed: 0,
                strict_decisions: false,
                session_log_dir: None,
                session_log_budget_bytes: 256 * 1024 * 1024,
                snapshot_every: 0,
            },
            tree: TreeConfig {
                window: 10,
                store_path: None,
            },
            driver: DriverConfig {
                count: 1000,
                endpoint: "127.0.0.1:5555".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                events_path: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    engine: Option<PartialEngineConfig>,
    server: Option<PartialServerConfig>,
    tree: Option<PartialTreeConfig>,
    driver: Option<PartialDriverConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEngineConfig {
    spin_limit: Option<u32>,
    depth_limit: Option<u32>,
    seed: Option<u64>,
    buffer_max: Option<u64>,
    text_max_len: Option<u64>,
    reuse: Option<ReusePolicy>,
    flush_each_record: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialServerConfig {
    listen: Option<String>,
    seed: Option<u64>,
    strict_decisions: Option<bool>,
    session_log_dir: Option<PathBuf>,
    session_log_budget_bytes: Option<u64>,
    snapshot_every: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTreeConfig {
    window: Option<usize>,
    store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDriverConfig {
    count: Option<u64>,
    endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    level: Option<String>,
    events_path: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, FuzzError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| FuzzError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    absolutize_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(engine) = partial.engine {
        if let Some(value) = engine.spin_limit {
            cfg.engine.spin_limit = value;
        }
        if let Some(value) = engine.depth_limit {
            cfg.engine.depth_limit = value;
        }
        if let Some(value) = engine.seed {
            cfg.engine.seed = Some(value);
        }
        if let Some(value) = engine.buffer_max {
            cfg.engine.buffer_max = value;
        }
        if let Some(value) = engine.text_max_len {
            cfg.engine.text_max_len = value;
        }
        if let Some(value) = engine.reuse {
            cfg.engine.reuse = value;
        }
        if let Some(value) = engine.flush_each_record {
            cfg.engine.flush_each_record = value;
        }
    }

    if let Some(server) = partial.server {
        if let Some(value) = server.listen {
            cfg.server.listen = value;
        }
        if let Some(value) = server.seed {
            cfg.server.seed = value;
        }
        if let Some(value) = server.strict_decisions {
            cfg.server.strict_decisions = value;
        }
        if let Some(value) = server.session_log_dir {
            cfg.server.session_log_dir = Some(value);
        }
        if let Some(value) = server.session_log_budget_bytes {
            cfg.server.session_log_budget_bytes = value;
        }
        if let Some(value) = server.snapshot_every {
            cfg.server.snapshot_every = value;
        }
    }

    if let Some(tree) = partial.tree {
        if let Some(value) = tree.window {
            cfg.tree.window = value;
        }
        if let Some(value) = tree.store_path {
            cfg.tree.store_path = Some(value);
        }
    }

    if let Some(driver) = partial.driver {
        if let Some(value) = driver.count {
            cfg.driver.count = value;
        }
        if let Some(value) = driver.endpoint {
            cfg.driver.endpoint = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.level {
            cfg.logging.level = value;
        }
        if let Some(value) = logging.events_path {
            cfg.logging.events_path = Some(value);
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(listen) = &overrides.listen {
        cfg.server.listen = listen.clone();
    }
    if let Some(seed) = overrides.server_seed {
        cfg.server.seed = seed;
    }
    if let Some(seed) = overrides.engine_seed {
        cfg.engine.seed = Some(seed);
    }
    if let Some(limit) = overrides.spin_limit {
        cfg.engine.spin_limit = limit;
    }
    if let Some(limit) = overrides.depth_limit {
        cfg.engine.depth_limit = limit;
    }
    if overrides.strict_decisions {
        cfg.server.strict_decisions = true;
    }
    if let Some(path) = &overrides.store_path {
        cfg.tree.store_path = Some(path.clone());
    }
    if let Some(dir) = &overrides.session_log_dir {
        cfg.server.session_log_dir = Some(dir.clone());
    }
    if let Some(level) = &overrides.log_level {
        cfg.logging.level = level.clone();
    }
}

fn absolutize_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    for path in [
        &mut cfg.server.session_log_dir,
        &mut cfg.tree.store_path,
        &mut cfg.logging.events_path,
    ]
    .into_iter()
    .flatten()
    {
        *path = absolutize_path(process_cwd, path);
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), FuzzError> {
    if cfg.engine.depth_limit == 0 {
        return Err(FuzzError::InvalidConfig(
            "engine.depth_limit must be greater than zero".to_string(),
        ));
    }

    if cfg.engine.buffer_max == 0 {
        return Err(FuzzError::InvalidConfig(
            "engine.buffer_max must be greater than zero".to_string(),
        ));
    }

    if cfg.tree.window == 0 {
        return Err(FuzzError::InvalidConfig(
            "tree.window must be greater than zero".to_string(),
        ));
    }

    if cfg.server.listen.parse::<SocketAddr>().is_err() {
        return Err(FuzzError::InvalidConfig(format!(
            "server.listen is not a socket address: {}",
            cfg.server.listen
        )));
    }

    Ok(())
}
