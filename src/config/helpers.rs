//! Environment snapshot and parsing helpers shared by the config sections.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::ConfigError;

/// A snapshot of environment variables that configuration is resolved from.
///
/// The process environment is read exactly once, in [`EnvSource::from_process`].
/// Everything downstream (config resolution, the env overlay forwarded into
/// bootstrap steps) works off this snapshot, so tests can build one from
/// literal pairs instead of mutating the real environment.
#[derive(Clone, Default)]
pub struct EnvSource {
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    /// Capture the current process environment.
    ///
    /// Variables whose name or value is not valid unicode are dropped: they
    /// cannot be represented in a remote command's environment.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values are routinely secrets.
        f.debug_struct("EnvSource")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read a variable, treating an empty value as unset.
pub(crate) fn optional_env(env: &EnvSource, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(env
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

pub(crate) fn required_env(env: &EnvSource, key: &str) -> Result<String, ConfigError> {
    optional_env(env, key)?.ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

pub(crate) fn parse_optional_env<T>(env: &EnvSource, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(env, key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_bool_env(env: &EnvSource, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(env, key)? {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{}'", raw),
            }),
        },
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(env: &EnvSource, key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(env, key)?.unwrap_or_else(|| default.to_string()))
}

/// Like [`optional_env`] but keeps an explicitly empty value, which callers
/// use to mean "disabled".
pub(crate) fn raw_env(env: &EnvSource, key: &str) -> Option<String> {
    env.get(key).map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_are_unset() {
        let env = EnvSource::from_pairs([("A", ""), ("B", "  ")]);
        assert_eq!(optional_env(&env, "A").unwrap(), None);
        assert_eq!(optional_env(&env, "B").unwrap(), None);
        assert_eq!(raw_env(&env, "A").as_deref(), Some(""));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        let env = EnvSource::from_pairs([("X", "TRUE"), ("Y", "0"), ("Z", "maybe")]);
        assert!(parse_bool_env(&env, "X", false).unwrap());
        assert!(!parse_bool_env(&env, "Y", true).unwrap());
        assert!(parse_bool_env(&env, "Z", true).is_err());
        assert!(parse_bool_env(&env, "MISSING", true).unwrap());
    }

    #[test]
    fn parse_optional_reports_key_on_error() {
        let env = EnvSource::from_pairs([("PORT", "not-a-port")]);
        let err = parse_optional_env::<u16>(&env, "PORT", 3000).unwrap_err();
        assert!(err.to_string().contains("PORT"), "got: {}", err);
    }

    #[test]
    fn required_env_names_missing_key() {
        let env = EnvSource::default();
        let err = required_env(&env, "CRON_SECRET").unwrap_err();
        assert_eq!(err.to_string(), "CRON_SECRET is not set");
    }

    #[test]
    fn debug_does_not_print_values() {
        let env = EnvSource::from_pairs([("CRON_SECRET", "hunter2")]);
        let rendered = format!("{:?}", env);
        assert!(rendered.contains("CRON_SECRET"));
        assert!(!rendered.contains("hunter2"));
    }
}
