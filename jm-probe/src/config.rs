use std::env;

pub const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_ALIAS_COUNT: usize = 2;
pub const DEFAULT_CODE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Bytes of backing segment, and the size of each alias.
    pub segment_size: usize,
    pub alias_count: usize,
    pub link_blocks: bool,
    /// Capacity of the executable buffer used by the block cache check.
    pub code_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            alias_count: DEFAULT_ALIAS_COUNT,
            link_blocks: true,
            code_size: DEFAULT_CODE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.key, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl ProbeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let segment_size = parse_size(&lookup, "JM_SEGMENT_SIZE", defaults.segment_size)?;
        let alias_count = parse_size(&lookup, "JM_ALIAS_COUNT", defaults.alias_count)?;
        let link_blocks = parse_bool(&lookup, "JM_LINK_BLOCKS", defaults.link_blocks)?;
        let code_size = parse_size(&lookup, "JM_CODE_SIZE", defaults.code_size)?;

        if segment_size.checked_mul(alias_count).is_none() {
            return Err(invalid(
                "JM_ALIAS_COUNT",
                &alias_count.to_string(),
                "aliases overflow the address space",
            ));
        }

        Ok(Self {
            segment_size,
            alias_count,
            link_blocks,
            code_size,
        })
    }
}

fn parse_size(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    match parsed {
        Ok(0) => Err(invalid(key, &raw, "must be non-zero")),
        Ok(size) => Ok(size),
        Err(_) => Err(invalid(key, &raw, "expected a decimal or 0x-prefixed number")),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &raw, "expected true or false")),
    }
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError {
        key,
        value: value.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ProbeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ProbeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn missing_variables_use_defaults() {
        let config = config_from(&[]).expect("defaults should parse");
        assert_eq!(config, ProbeConfig::default());
        assert_eq!(config.segment_size, 32 * 1024 * 1024);
        assert_eq!(config.alias_count, 2);
        assert!(config.link_blocks);
    }

    #[test]
    fn sizes_accept_decimal_and_hex() {
        let config = config_from(&[
            ("JM_SEGMENT_SIZE", "0x200000"),
            ("JM_CODE_SIZE", " 8192 "),
            ("JM_ALIAS_COUNT", "3"),
            ("JM_LINK_BLOCKS", "off"),
        ])
        .expect("config should parse");
        assert_eq!(config.segment_size, 0x20_0000);
        assert_eq!(config.code_size, 8192);
        assert_eq!(config.alias_count, 3);
        assert!(!config.link_blocks);
    }

    #[test]
    fn malformed_values_are_reported_not_defaulted() {
        let err = config_from(&[("JM_SEGMENT_SIZE", "32M")]).expect_err("suffix is not accepted");
        assert_eq!(err.key, "JM_SEGMENT_SIZE");
        assert_eq!(err.value, "32M");

        let err = config_from(&[("JM_LINK_BLOCKS", "maybe")]).expect_err("not a bool");
        assert_eq!(err.key, "JM_LINK_BLOCKS");

        let err = config_from(&[("JM_CODE_SIZE", "0")]).expect_err("zero size");
        assert_eq!(err.reason, "must be non-zero");
    }

    #[test]
    fn alias_count_must_fit_the_address_space() {
        let err = config_from(&[
            ("JM_SEGMENT_SIZE", &usize::MAX.to_string()),
            ("JM_ALIAS_COUNT", "2"),
        ])
        .expect_err("overflowing span");
        assert_eq!(err.key, "JM_ALIAS_COUNT");
    }
}
