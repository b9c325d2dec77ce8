use std::sync::OnceLock;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mode::HookMode;

pub const ENV_HOOK_MODE: &str = "MEMHOOK_MMAP_HOOK_MODE";
pub const ENV_VERIFY_INSTALL: &str = "MEMHOOK_VERIFY_INSTALL";
pub const ENV_RELOC_HOOK_DLOPEN: &str = "MEMHOOK_RELOC_HOOK_DLOPEN";
pub const ENV_ASSUME_SUPERVISED: &str = "MEMHOOK_ASSUME_SUPERVISED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requested redirection mechanism.
    pub mmap_hook_mode: HookMode,
    /// Exercise every installed entry point once and fail installation if no event arrives.
    pub verify_install: bool,
    /// In relocation mode, also patch libraries loaded later with `dlopen`.
    pub reloc_hook_dlopen: bool,
    /// Skip supervising-tool detection and use this answer instead.
    pub assume_supervised: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mmap_hook_mode: HookMode::Auto,
            verify_install: false,
            reloc_hook_dlopen: true,
            assume_supervised: None,
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "on" | "true" => Ok(true),
        "n" | "no" | "0" | "off" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool { var, value: value.to_string() }),
    }
}

impl Config {
    /// Defaults overridden by the `MEMHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(v) = lookup(ENV_HOOK_MODE) {
            config.mmap_hook_mode = v.parse()?;
        }
        if let Some(v) = lookup(ENV_VERIFY_INSTALL) {
            config.verify_install = parse_bool(ENV_VERIFY_INSTALL, &v)?;
        }
        if let Some(v) = lookup(ENV_RELOC_HOOK_DLOPEN) {
            config.reloc_hook_dlopen = parse_bool(ENV_RELOC_HOOK_DLOPEN, &v)?;
        }
        if let Some(v) = lookup(ENV_ASSUME_SUPERVISED) {
            config.assume_supervised = Some(parse_bool(ENV_ASSUME_SUPERVISED, &v)?);
        }
        Ok(config)
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Fix the process-wide configuration. Only the first call, made before any installation,
/// takes effect.
pub fn configure(config: Config) -> Result<(), ConfigError> {
    CONFIG.set(config).map_err(|_| ConfigError::AlreadyConfigured)
}

/// The process-wide configuration, read from the environment if [`configure`] was never
/// called.
pub fn current() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::from_env().unwrap_or_else(|e| {
            warn!("ignoring memhook environment configuration: {}", e);
            Config::default()
        })
    })
}
