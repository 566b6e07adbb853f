//! Command definitions - one HTTP endpoint per entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An external command exposed at `/api/v1/{slug}/...`.
///
/// `arguments` is a template: `$1`, `$2`, … are replaced by the request's
/// path segments, anything else is passed through as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub slug: String,

    /// Executable, resolved through `PATH` when not absolute.
    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    /// Default: text/plain
    #[serde(default = "CommandConfig::default_content_type")]
    pub content_type: String,

    /// The complete environment of the child process. Nothing is inherited.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl CommandConfig {
    fn default_content_type() -> String {
        "text/plain".to_string()
    }

    pub fn new(slug: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            command: command.into(),
            arguments: Vec::new(),
            content_type: Self::default_content_type(),
            environment: HashMap::new(),
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cmd = CommandConfig::new("nmap", "nmap")
            .with_arguments(["-v", "$1"])
            .with_env("LANG", "C");
        assert_eq!(cmd.arguments, vec!["-v", "$1"]);
        assert_eq!(cmd.content_type, "text/plain");
        assert_eq!(cmd.environment.get("LANG"), Some(&"C".to_string()));
    }
}
