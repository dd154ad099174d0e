use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub http: HttpConfig,
    pub hooks: HookConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkspaceConfig {
    /// Workspace identifier; derived from the working directory when unset
    pub id: Option<String>,
    /// Store root, relative to the project root unless absolute
    pub store_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    /// Serve the read-only loopback mirror
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HookConfig {
    pub security_enabled: bool,
    pub auto_checkpoint: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Config {
    /// Load configuration: embedded defaults, then an optional CONFIG_FILE,
    /// then environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("COORD")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml));

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;
        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Flat environment variables used in deployment scripts.
    fn apply_standard_env_vars(config: &mut Config) {
        if let Ok(id) = env::var("COORD_WORKSPACE_ID") {
            config.workspace.id = Some(id);
        }
        if let Ok(dir) = env::var("COORD_STORE_DIR") {
            config.workspace.store_dir = dir;
        }
        if let Ok(port) = env::var("COORD_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                config.http.port = port;
                config.http.enabled = true;
            }
        }
        if let Ok(flag) = env::var("COORD_SECURITY_HOOKS") {
            config.hooks.security_enabled = parse_bool(&flag);
        }
        if let Ok(flag) = env::var("COORD_AUTO_CHECKPOINT") {
            config.hooks.auto_checkpoint = parse_bool(&flag);
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
    }

    /// Effective workspace id: configured, or a fingerprint of the project
    /// root path.
    pub fn workspace_id(&self, project_root: &Path) -> String {
        match &self.workspace.id {
            Some(id) => id.clone(),
            None => fingerprint_path(project_root),
        }
    }

    /// Store directory resolved against the project root.
    pub fn store_dir(&self, project_root: &Path) -> PathBuf {
        let dir = Path::new(&self.workspace.store_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            project_root.join(dir)
        }
    }

    /// Database file path, fingerprinted by workspace id.
    pub fn database_path(&self, project_root: &Path) -> PathBuf {
        self.store_dir(project_root)
            .join(format!("coord.{}.sqlite", self.workspace_id(project_root)))
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {other}. Must be one of: trace, debug, info, warn, error"
                ));
            }
        }
        if self.http.enabled && self.http.port == 0 {
            return Err(anyhow::anyhow!("HTTP mirror port cannot be 0"));
        }
        if self.workspace.store_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("Store directory cannot be empty"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig {
                id: None,
                store_dir: ".coord".into(),
            },
            http: HttpConfig {
                enabled: false,
                port: 4477,
            },
            hooks: HookConfig {
                security_enabled: true,
                auto_checkpoint: true,
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: LogFormat::Compact,
            },
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// FNV-1a hash of the canonical path, hex-encoded. Stable per workspace.
fn fingerprint_path(path: &Path) -> String {
    let canonical = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in canonical.to_string_lossy().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}
