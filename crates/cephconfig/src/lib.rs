//! ceph.conf parser and typed options
//!
//! Reads the INI-style `ceph.conf` format: `[section]` headers followed by
//! `key = value` lines. Option names are matched the way Ceph matches them,
//! so `osd backoff on peering`, `osd-backoff-on-peering` and
//! `osd_backoff_on_peering` all name the same option.
//!
//! # Example
//!
//! ```
//! use cephconfig::CephConfig;
//!
//! let conf = CephConfig::parse("[osd]\nosd backoff on peering = true\n").unwrap();
//! assert_eq!(conf.get("osd", "osd_backoff_on_peering"), Some("true"));
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    #[error("Invalid {kind} value: {value}")]
    InvalidValue { kind: &'static str, value: String },
}

/// Canonical spelling of an option name: runs of spaces, dashes and
/// underscores become a single underscore
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut sep = false;
    for c in key.trim().chars() {
        if c == ' ' || c == '-' || c == '_' || c == '\t' {
            sep = true;
            continue;
        }
        if sep && !out.is_empty() {
            out.push('_');
        }
        sep = false;
        out.push(c);
    }
    out
}

/// A value that can be read from ceph.conf
pub trait ConfigValue: Sized + Clone {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Name used in error messages
    fn type_name() -> &'static str;
}

fn invalid<T: ConfigValue>(s: &str) -> ConfigError {
    ConfigError::InvalidValue {
        kind: T::type_name(),
        value: s.to_string(),
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(invalid::<bool>(s)),
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// Plain unsigned integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        s.trim()
            .replace('_', "")
            .parse()
            .map(Count)
            .map_err(|_| invalid::<Count>(s))
    }

    fn type_name() -> &'static str {
        "count"
    }
}

/// Time span; a bare number is seconds, otherwise one of `ms`, `s`, `m`, `h`, `d`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        let t = s.trim();
        let split = t
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(t.len());
        let (num, unit) = t.split_at(split);
        let num: f64 = num.parse().map_err(|_| invalid::<Duration>(s))?;
        let scale = match unit.trim().to_lowercase().as_str() {
            "" | "s" | "sec" | "secs" | "seconds" => 1.0,
            "ms" | "msec" => 1e-3,
            "us" | "usec" => 1e-6,
            "m" | "min" | "mins" | "minutes" => 60.0,
            "h" | "hr" | "hours" => 3600.0,
            "d" | "days" => 86400.0,
            _ => return Err(invalid::<Duration>(s)),
        };
        Ok(Duration(std::time::Duration::from_secs_f64(num * scale)))
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// One named option with its default
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// Look the option up in `sections`, in order
    ///
    /// A value that does not parse is treated like an absent one.
    pub fn get(&self, config: &CephConfig, sections: &[&str]) -> T {
        config
            .get_with_fallback(sections, self.name)
            .and_then(|s| T::parse_config_value(s).ok())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// Parsed ceph.conf; keys are stored normalized
#[derive(Debug, Clone, Default)]
pub struct CephConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl CephConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse ceph.conf text
    ///
    /// Lines before the first section header belong to `[global]`. `#` and
    /// `;` start a comment, at the start of a line or after a value.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::from("global");

        for (n, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::ParseError {
                    line: n + 1,
                    reason: format!("unterminated section header: {}", line),
                })?;
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::ParseError {
                line: n + 1,
                reason: format!("expected key = value: {}", line),
            })?;
            let key = normalize_key(key);
            if key.is_empty() {
                return Err(ConfigError::ParseError {
                    line: n + 1,
                    reason: "empty key".to_string(),
                });
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key, value.trim().to_string());
        }

        Ok(Self { sections })
    }

    /// Value of `key` in `section`
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(&normalize_key(key)))
            .map(String::as_str)
    }

    /// First value of `key` found in `sections`, most specific first
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> Option<&str> {
        sections.iter().find_map(|section| self.get(section, key))
    }

    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Normalized keys of `section`
    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|s| s.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Define a struct of typed options, each with a default
///
/// Generates `new()`/`Default` (all defaults), `from_ceph_config()` and
/// `option_names()`.
///
/// # Example
///
/// ```
/// use cephconfig::{define_options, CephConfig, Count, Duration};
///
/// define_options! {
///     /// Heartbeat settings
///     pub struct HeartbeatConfig {
///         /// Seconds between pings
///         osd_heartbeat_interval: Duration = Duration(std::time::Duration::from_secs(6)),
///
///         /// Pings in flight before a peer is reported
///         osd_heartbeat_min_peers: Count = Count(10),
///     }
/// }
///
/// let conf = CephConfig::parse("[osd]\nosd heartbeat interval = 500ms\n").unwrap();
/// let hb = HeartbeatConfig::from_ceph_config(&conf, &["osd", "global"]);
/// assert_eq!(hb.osd_heartbeat_interval.0, std::time::Duration::from_millis(500));
/// assert_eq!(hb.osd_heartbeat_min_peers.0, 10);
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// All options at their defaults
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Read every option from `config`, looking in `sections` in order
            pub fn from_ceph_config(
                config: &$crate::CephConfig,
                sections: &[&str],
            ) -> Self {
                Self {
                    $(
                        $field: $crate::ConfigOption::new(stringify!($field), $default)
                            .get(config, sections),
                    )*
                }
            }

            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
