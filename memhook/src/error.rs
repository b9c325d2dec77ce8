use memhook_intercept::HookError;
use thiserror::Error;

use crate::event::EventCategory;

/// Outcome of [`install`](crate::install) when not every requested category is covered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    /// Some entry points could not be hooked. `covered` is what now fires.
    #[error("{} entry point(s) not hooked; covered events {covered:?}", failures.len())]
    Partial {
        covered: EventCategory,
        failures: Vec<(&'static str, HookError)>,
    },

    /// Hooks were installed, but exercising them produced no event for `missing`.
    #[error("hooks installed but no event observed for {missing:?}")]
    Verification { missing: EventCategory },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid hook mode `{0}` (expected auto, reloc or bistro)")]
    InvalidMode(String),

    #[error("invalid value `{value}` for {var} (expected y or n)")]
    InvalidBool { var: &'static str, value: String },

    #[error("configuration already applied")]
    AlreadyConfigured,
}

pub type Result<T> = std::result::Result<T, InstallError>;
