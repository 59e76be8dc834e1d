//! Execution request for a remote process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Child starts from an empty environment instead of inheriting the agent's.
pub const EXECUTE_FLAG_REPLACE_ENVIRONMENT: u32 = 0x1;

/// Everything needed to run one process on a remote agent.
///
/// Paths are relative to the agent's sandbox unless absolute inside it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Executable to run.
    pub executable: String,

    /// Command-line arguments.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Working directory, defaulting to the sandbox root.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Environment overrides. A `None` value removes the variable.
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,

    /// `EXECUTE_FLAG_*` bits.
    #[serde(default)]
    pub flags: u32,

    /// Channel the agent relays the child's worker connection over.
    #[serde(default)]
    pub worker_channel: Option<i32>,
}

impl ExecuteRequest {
    /// Create a request for an executable with no arguments.
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Set the arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), Some(value.into()));
        self
    }

    /// Remove an inherited environment variable.
    #[must_use]
    pub fn unset_env(mut self, key: impl Into<String>) -> Self {
        self.env.insert(key.into(), None);
        self
    }

    /// Start from an empty environment.
    #[must_use]
    pub const fn replace_environment(mut self) -> Self {
        self.flags |= EXECUTE_FLAG_REPLACE_ENVIRONMENT;
        self
    }

    /// Relay the child's worker connection over `channel_id`.
    #[must_use]
    pub const fn worker_channel(mut self, channel_id: i32) -> Self {
        self.worker_channel = Some(channel_id);
        self
    }

    /// Whether the child starts from an empty environment.
    #[must_use]
    pub const fn replaces_environment(&self) -> bool {
        self.flags & EXECUTE_FLAG_REPLACE_ENVIRONMENT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let request = ExecuteRequest::new("cmd")
            .args(["/c", "echo"])
            .working_dir("work")
            .env("A", "1")
            .unset_env("B")
            .replace_environment();

        assert_eq!(request.arguments, vec!["/c", "echo"]);
        assert_eq!(request.working_dir.as_deref(), Some("work"));
        assert_eq!(request.env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(request.env.get("B"), Some(&None));
        assert!(request.replaces_environment());
        assert_eq!(request.worker_channel, None);
    }
}
