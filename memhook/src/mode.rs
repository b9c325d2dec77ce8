use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use log::debug;
use memhook_intercept::arch::INLINE_PATCHING;
use serde::{Deserialize, Serialize};

use crate::config::{self, Config};
use crate::error::ConfigError;

/// How entry points are redirected to the shims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Let [`select_mode`] decide. Never the effective mode.
    #[default]
    Auto,
    /// Rewrite the relocation slots through which modules call the entry points.
    Reloc,
    /// Rewrite the first instructions of the entry points themselves.
    Bistro,
}

impl HookMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookMode::Auto => "auto",
            HookMode::Reloc => "reloc",
            HookMode::Bistro => "bistro",
        }
    }
}

impl fmt::Display for HookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(HookMode::Auto),
            "reloc" => Ok(HookMode::Reloc),
            "bistro" => Ok(HookMode::Bistro),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Resolve a requested mode against the platform and the presence of a supervising
/// dynamic-analysis tool.
///
/// Such a tool runs the program on translated code, so bytes written into the original
/// instructions are never executed; only relocation slots are honoured.
pub fn select_mode(requested: HookMode, supervised: bool) -> HookMode {
    let bistro_usable = INLINE_PATCHING && !supervised;
    match requested {
        HookMode::Auto | HookMode::Bistro if bistro_usable => HookMode::Bistro,
        HookMode::Auto | HookMode::Bistro => HookMode::Reloc,
        HookMode::Reloc => HookMode::Reloc,
    }
}

/// Whether the process runs under Valgrind, judged by its preload library.
pub fn detect_supervisor() -> bool {
    let preloaded = std::env::var_os("LD_PRELOAD")
        .is_some_and(|p| p.to_string_lossy().contains("vgpreload"));
    preloaded
        || memhook_intercept::module::enumerate_modules()
            .iter()
            .any(|m| m.name.starts_with("vgpreload"))
}

/// `assume_supervised` overrides detection when set.
pub fn is_supervised(config: &Config) -> bool {
    config.assume_supervised.unwrap_or_else(detect_supervisor)
}

/// The mode used for every installation in this process, computed on first use.
pub fn effective_mode() -> HookMode {
    static MODE: OnceLock<HookMode> = OnceLock::new();
    *MODE.get_or_init(|| {
        let config = config::current();
        let supervised = is_supervised(config);
        let mode = select_mode(config.mmap_hook_mode, supervised);
        debug!(
            "hook mode: requested {}, supervised {}, effective {}",
            config.mmap_hook_mode, supervised, mode
        );
        mode
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervised_bistro_request_downgrades_to_reloc() {
        assert_eq!(select_mode(HookMode::Bistro, true), HookMode::Reloc);
        assert_eq!(select_mode(HookMode::Auto, true), HookMode::Reloc);
        assert_eq!(select_mode(HookMode::Reloc, true), HookMode::Reloc);
    }

    #[test]
    fn unsupervised_request_follows_platform() {
        let inline = if INLINE_PATCHING { HookMode::Bistro } else { HookMode::Reloc };
        assert_eq!(select_mode(HookMode::Auto, false), inline);
        assert_eq!(select_mode(HookMode::Bistro, false), inline);
        assert_eq!(select_mode(HookMode::Reloc, false), HookMode::Reloc);
    }

    #[test]
    fn mode_names_parse_case_insensitively() {
        assert_eq!("Bistro".parse::<HookMode>(), Ok(HookMode::Bistro));
        assert_eq!(" reloc ".parse::<HookMode>(), Ok(HookMode::Reloc));
        assert_eq!(HookMode::Auto.to_string(), "auto");
        assert_eq!("plt".parse::<HookMode>(), Err(ConfigError::InvalidMode("plt".into())));
    }

    #[test]
    fn not_running_under_valgrind() {
        assert!(!detect_supervisor());
        let config = Config { assume_supervised: Some(true), ..Config::default() };
        assert!(is_supervised(&config));
    }
}
