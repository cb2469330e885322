//! Service process configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

fn default_command() -> String {
    "tsserver".to_string()
}

fn default_project_markers() -> Vec<String> {
    vec!["tsconfig.json".to_string(), "jsconfig.json".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// How to start and talk to a compiler service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Executable command (e.g. "tsserver"), resolved through `PATH`.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the service process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Config file names that mark a project root, in priority order.
    #[serde(default = "default_project_markers")]
    pub project_markers: Vec<String>,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            env: HashMap::new(),
            project_markers: default_project_markers(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
