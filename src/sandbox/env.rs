use std::collections::BTreeMap;

use crate::config::EnvSource;

/// Host-specific variables that must not leak into a sandbox: they describe
/// the orchestrator's own machine and would break the remote shell.
const HOST_ONLY_VARS: &[&str] = &[
    "HOME", "HOSTNAME", "OLDPWD", "PATH", "PWD", "SHELL", "SHLVL", "TERM", "TMPDIR", "USER", "_",
];

/// Environment variables applied to one remote command.
///
/// A value of `None` marks a variable as explicitly undefined. Undefined
/// entries take part in merging (a later `None` masks an earlier value) but
/// are never transmitted: [`EnvOverlay::defined`] drops them, because the
/// remote execution layer cannot represent "unset".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, Option<String>>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host environment minus [`HOST_ONLY_VARS`].
    pub fn from_host(env: &EnvSource) -> Self {
        env.iter()
            .filter(|(k, _)| !HOST_ONLY_VARS.contains(k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), Some(value.into()));
        self
    }

    /// Mark `key` undefined so it is not sent even if a lower layer sets it.
    pub fn unset(&mut self, key: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), None);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Layer `other` on top of `self`; keys in `other` win.
    pub fn merged(mut self, other: &EnvOverlay) -> Self {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The variables that are actually transmitted.
    pub fn defined(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// `KEY=value` list, the shape Docker exec expects.
    pub fn to_env_list(&self) -> Vec<String> {
        self.defined()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.values().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.vars.values().filter(|v| v.is_some()).count()
    }
}

impl FromIterator<(String, String)> for EnvOverlay {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }
}

impl std::fmt::Debug for EnvOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys only; forwarded values include the shared secret.
        f.debug_struct("EnvOverlay")
            .field("keys", &self.defined().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_values_are_never_transmitted() {
        let mut env = EnvOverlay::new();
        env.set("A", "1").unset("B");

        let defined = env.defined();
        assert_eq!(defined.get("A").map(String::as_str), Some("1"));
        assert!(!defined.contains_key("B"));
        assert_eq!(env.to_env_list(), vec!["A=1".to_string()]);
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn later_layers_win_including_unset() {
        let base = EnvOverlay::new().with("A", "base").with("B", "base");
        let mut top = EnvOverlay::new();
        top.set("A", "top").unset("B");

        let merged = base.merged(&top);
        assert_eq!(merged.get("A"), Some("top"));
        assert_eq!(merged.get("B"), None);
        assert!(!merged.defined().contains_key("B"));
    }

    #[test]
    fn host_only_vars_are_filtered() {
        let host = EnvSource::from_pairs([
            ("PATH", "/usr/bin"),
            ("HOME", "/root"),
            ("CRON_SECRET", "abc"),
        ]);
        let env = EnvOverlay::from_host(&host);
        assert_eq!(env.get("CRON_SECRET"), Some("abc"));
        assert!(!env.contains_key("PATH"));
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn debug_hides_values() {
        let env = EnvOverlay::new().with("CRON_SECRET", "hunter2");
        let rendered = format!("{:?}", env);
        assert!(rendered.contains("CRON_SECRET"));
        assert!(!rendered.contains("hunter2"));
    }
}
