use std::collections::BTreeMap;
use tokio::process::Command;

/// Environment variable overrides for a launched example program.
///
/// Launched processes inherit the harness environment; the entries here are
/// layered on top.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Creates an empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value` in the launched process.
    ///
    /// # Examples
    /// ```
    /// use example_harness::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("PN_TRACE_FRM", "1");
    /// assert_eq!(env.get("PN_TRACE_FRM"), Some("1"));
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Value that will be set for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Applies the overrides to a command about to be spawned.
    pub(crate) fn apply(&self, command: &mut Command) {
        command.envs(&self.vars);
    }
}
