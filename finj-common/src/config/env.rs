//! Environment variable overrides.
//!
//! Every option of [`FinjConfig`](super::FinjConfig) can be overridden with a
//! `FINJ_<OPTION>` variable. The parser collects errors instead of failing on
//! the first one so that all problems are reported together at startup.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the FINJ_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("FINJ_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        match parse_bool(&value) {
            Some(parsed) => Sourced::from_env(parsed, var_name),
            None => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                Sourced::from_env(default, var_name)
            }
        }
    }

    /// Get a numeric value with default and inclusive range validation.
    pub fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name.clone(),
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::from_env(default, var_name)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: format!("number in {min}..={max}"),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Get any value implementing `FromStr`, recording `expected` on failure.
    pub fn get_parsed<T: FromStr>(&mut self, name: &str, default: T, expected: &str) -> Sourced<T> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(parsed) => Sourced::from_env(parsed, var_name),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: expected.to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Get a path value with ~ expansion.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (value, source) = match env::var(&var_name) {
            Ok(v) => (v, ConfigSource::Environment),
            Err(_) => (default.to_string(), ConfigSource::Default),
        };

        let expanded = match (value.strip_prefix("~/"), dirs::home_dir()) {
            (Some(stripped), Some(home)) => home.join(stripped),
            _ => PathBuf::from(&value),
        };

        if source == ConfigSource::Environment {
            Sourced::from_env(expanded, var_name)
        } else {
            Sourced::default_value(expanded)
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default.to_string());
        };
        let lower = value.to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                Sourced::from_env(lower, var_name)
            }
            _ => {
                self.errors.push(EnvError::InvalidLogLevel {
                    var: var_name.clone(),
                    value,
                });
                Sourced::from_env(default.to_string(), var_name)
            }
        }
    }

    /// Get a comma-separated list of strings.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(split_list(&value), var_name),
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get an optional string. Empty, `none` and `null` read as unset.
    pub fn get_optional_string(
        &mut self,
        name: &str,
        default: Option<String>,
    ) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let trimmed = value.trim();
                let parsed = match trimmed.to_lowercase().as_str() {
                    "" | "none" | "null" => None,
                    _ => Some(trimmed.to_string()),
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env tests are serialized, no concurrent access to env vars
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env tests are serialized, no concurrent access to env vars
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_get_bool_values() {
        let var = "FINJ_TEST_BOOL";
        for (raw, expected) in [("1", true), ("Yes", true), ("off", false), ("", false)] {
            set_env(var, raw);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_bool("TEST_BOOL", !expected).value, expected);
            assert!(!parser.has_errors());
        }
        cleanup_env(&[var]);
    }

    #[test]
    #[serial]
    fn test_get_bool_invalid_uses_default() {
        set_env("FINJ_TEST_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("TEST_BAD_BOOL", true);
        assert!(result.value);
        assert_eq!(parser.errors().len(), 1);
        cleanup_env(&["FINJ_TEST_BAD_BOOL"]);
    }

    #[test]
    #[serial]
    fn test_get_range_signed_and_out_of_range() {
        set_env("FINJ_TEST_PRE_SEND", "-1");
        set_env("FINJ_TEST_PORT", "70000");
        let mut parser = EnvParser::new();

        let pre_send = parser.get_range("TEST_PRE_SEND", 600i64, i64::MIN, i64::MAX);
        assert_eq!(pre_send.value, -1);
        assert_eq!(pre_send.source, ConfigSource::Environment);

        let port = parser.get_range("TEST_PORT", 30000u32, 1, 65535);
        assert_eq!(port.value, 30000);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        cleanup_env(&["FINJ_TEST_PRE_SEND", "FINJ_TEST_PORT"]);
    }

    #[test]
    #[serial]
    fn test_get_range_unparsable() {
        set_env("FINJ_TEST_WORKERS", "twenty");
        let mut parser = EnvParser::new();
        let result = parser.get_range("TEST_WORKERS", 20usize, 1, 4096);
        assert_eq!(result.value, 20);
        assert_eq!(result.source, ConfigSource::Default);
        assert!(matches!(parser.errors()[0], EnvError::InvalidValue { .. }));
        cleanup_env(&["FINJ_TEST_WORKERS"]);
    }

    #[test]
    #[serial]
    fn test_get_string_list_and_optional() {
        set_env("FINJ_TEST_HOSTS", " 10.0.0.1:30000, ,10.0.0.2:30000 ");
        set_env("FINJ_TEST_CORES", "None");
        let mut parser = EnvParser::new();

        let hosts = parser.get_string_list("TEST_HOSTS", Vec::new());
        assert_eq!(hosts.value, vec!["10.0.0.1:30000", "10.0.0.2:30000"]);

        let cores = parser.get_optional_string("TEST_CORES", Some("0-3".into()));
        assert_eq!(cores.value, None);
        assert_eq!(cores.source, ConfigSource::Environment);

        let unset = parser.get_optional_string("TEST_CORES_UNSET", Some("0-3".into()));
        assert_eq!(unset.value.as_deref(), Some("0-3"));

        cleanup_env(&["FINJ_TEST_HOSTS", "FINJ_TEST_CORES"]);
    }

    #[test]
    #[serial]
    fn test_get_log_level_invalid() {
        set_env("FINJ_TEST_LEVEL", "loud");
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("TEST_LEVEL", "info");
        assert_eq!(level.value, "info");
        assert!(matches!(
            parser.take_errors().pop(),
            Some(EnvError::InvalidLogLevel { .. })
        ));
        assert!(!parser.has_errors());
        cleanup_env(&["FINJ_TEST_LEVEL"]);
    }

    mod proptest_tests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_parse_bool_no_panic(s in ".*") {
                let _ = parse_bool(&s);
            }

            #[test]
            fn test_split_list_has_no_empty_items(s in "[a-z0-9:., ]{0,80}") {
                for item in split_list(&s) {
                    prop_assert!(!item.is_empty());
                    prop_assert_eq!(item.trim(), item.as_str());
                }
            }
        }
    }
}
