use std::env;

use thiserror::Error;

/// Environment variable that enables or disables NUMA awareness. Accepts `0`, `1`, `true` or
/// `false` (case-insensitive).
pub const NUMA_AWARE_ENV: &str = "GC_NUMA_AWARE";

/// Environment variable that enables or disables processor group support. Accepts `0`, `1`,
/// `true` or `false` (case-insensitive).
pub const CPU_GROUPS_ENV: &str = "GC_CPU_GROUPS";

/// Switches that decide which optional operating system features the [`OsInterface`][1] is
/// allowed to use.
///
/// A feature enabled here is still only used if the operating system actually supports it. The
/// configuration can only narrow what is used, never widen it.
///
/// # Example
///
/// ```rust
/// use gc_os::{OsConfig, OsInterface};
///
/// let config = OsConfig::new().with_numa_aware(false);
/// let os = OsInterface::new(config);
///
/// assert!(!os.can_enable_numa_aware());
/// ```
///
/// [1]: crate::OsInterface
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OsConfig {
    numa_aware: bool,
    cpu_groups: bool,
}

impl OsConfig {
    /// Creates the default configuration: NUMA awareness on, processor group support off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            numa_aware: true,
            cpu_groups: false,
        }
    }

    /// Loads the configuration from the `GC_NUMA_AWARE` and `GC_CPU_GROUPS` environment
    /// variables. Variables that are not set keep their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that is not a recognized boolean.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(value) = lookup(NUMA_AWARE_ENV) {
            config.numa_aware = parse_bool(NUMA_AWARE_ENV, &value)?;
        }

        if let Some(value) = lookup(CPU_GROUPS_ENV) {
            config.cpu_groups = parse_bool(CPU_GROUPS_ENV, &value)?;
        }

        Ok(config)
    }

    /// Sets whether NUMA-aware behavior may be used.
    #[must_use]
    pub const fn with_numa_aware(mut self, value: bool) -> Self {
        self.numa_aware = value;
        self
    }

    /// Sets whether threads may be distributed across multiple processor groups.
    #[must_use]
    pub const fn with_cpu_groups(mut self, value: bool) -> Self {
        self.cpu_groups = value;
        self
    }

    /// Whether NUMA-aware behavior may be used.
    #[must_use]
    pub const fn numa_aware(&self) -> bool {
        self.numa_aware
    }

    /// Whether threads may be distributed across multiple processor groups.
    #[must_use]
    pub const fn cpu_groups(&self) -> bool {
        self.cpu_groups
    }
}

impl Default for OsConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    let trimmed = value.trim();

    if trimmed == "1" || trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed == "0" || trimmed.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ConfigError::InvalidBoolean {
            variable,
            value: value.to_string(),
        })
    }
}

/// Errors that can occur when loading an [`OsConfig`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A configuration variable was set to something other than `0`, `1`, `true` or `false`.
    #[error("invalid value '{value}' for {variable}: expected one of 0, 1, true, false")]
    InvalidBoolean {
        /// Name of the offending variable.
        variable: &'static str,

        /// The value that could not be parsed.
        value: String,
    },
}
