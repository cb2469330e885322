use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};
use tsmux_service::ServiceConfig;

fn default_debounce_ms() -> u64 {
    50
}

fn default_delay_ms() -> u64 {
    100
}

fn default_reference_tile() -> String {
    "grammar-selector".to_string()
}

fn default_priority() -> i32 {
    100
}

fn default_extensions() -> Vec<String> {
    vec!["ts".to_string(), "tsx".to_string()]
}

fn default_language_ids() -> Vec<String> {
    vec!["typescript".to_string(), "typescriptreact".to_string()]
}

/// Contents of `~/.tsmux/config.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TsmuxConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub languages: LanguageConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Batched project checks.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    /// Quiet period after the last check signal before a batch is sent.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Delay hint passed to the service between files of one batch.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl CheckConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Placement of the status tile.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Existing tile to sit just left of, if the display has it.
    #[serde(default = "default_reference_tile")]
    pub reference_tile: String,
    /// Priority used when the reference tile is absent.
    #[serde(default = "default_priority")]
    pub default_priority: i32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            reference_tile: default_reference_tile(),
            default_priority: default_priority(),
        }
    }
}

/// Which documents get checked.
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    /// File extensions, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Host language identifiers; take precedence over the extension.
    #[serde(default = "default_language_ids")]
    pub language_ids: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            language_ids: default_language_ids(),
        }
    }
}

impl LanguageConfig {
    /// Whether a document with this path and host language is checked.
    #[must_use]
    pub fn is_target(&self, path: Option<&Path>, language_id: Option<&str>) -> bool {
        if let Some(id) = language_id
            && self.language_ids.iter().any(|l| l == id)
        {
            return true;
        }
        path.and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unclosed; keep the remainder verbatim.
                out.push_str(&rest[pos..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

impl TsmuxConfig {
    /// Load `~/.tsmux/config.toml`. `Ok(None)` when there is no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = match config_path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        match toml::from_str::<Self>(content) {
            Ok(mut config) => {
                config.expand_env();
                Ok(config)
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    fn expand_env(&mut self) {
        self.service.command = expand_env_vars(&self.service.command);
        for arg in &mut self.service.args {
            *arg = expand_env_vars(arg);
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tsmux").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> TsmuxConfig {
        TsmuxConfig::parse(Path::new("/test/config.toml"), content).unwrap()
    }

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("TSMUX_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${TSMUX_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("TSMUX_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("TSMUX_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${TSMUX_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_dropped() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        unsafe {
            std::env::set_var("TSMUX_UNICODE_VAR", "λ");
        }
        let result = expand_env_vars("héllo ${TSMUX_UNICODE_VAR} wörld");
        assert_eq!(result, "héllo λ wörld");
        unsafe {
            std::env::remove_var("TSMUX_UNICODE_VAR");
        }
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config.service.command, "tsserver");
        assert_eq!(config.check.debounce(), Duration::from_millis(50));
        assert_eq!(config.check.delay(), Duration::from_millis(100));
        assert_eq!(config.status.reference_tile, "grammar-selector");
        assert_eq!(config.status.default_priority, 100);
        assert_eq!(config.languages.extensions, vec!["ts", "tsx"]);
    }

    #[test]
    fn parse_full_config() {
        unsafe {
            std::env::set_var("TSMUX_TEST_NODE_HOME", "/opt/node");
        }
        let config = parse(
            r#"
            [service]
            command = "${TSMUX_TEST_NODE_HOME}/bin/tsserver"
            args = ["--locale", "en"]
            project_markers = ["tsconfig.json"]
            request_timeout_secs = 5

            [check]
            debounce_ms = 200

            [status]
            reference_tile = "cursor-position"
            default_priority = 7

            [languages]
            extensions = ["ts", "mts"]
            "#,
        );
        unsafe {
            std::env::remove_var("TSMUX_TEST_NODE_HOME");
        }

        assert_eq!(config.service.command, "/opt/node/bin/tsserver");
        assert_eq!(config.service.args, vec!["--locale", "en"]);
        assert_eq!(config.service.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.check.debounce_ms, 200);
        assert_eq!(config.check.delay_ms, 100);
        assert_eq!(config.status.reference_tile, "cursor-position");
        assert_eq!(config.status.default_priority, 7);
        assert_eq!(config.languages.extensions, vec!["ts", "mts"]);
        assert_eq!(config.languages.language_ids, default_language_ids());
    }

    #[test]
    fn parse_error_carries_path() {
        let err = TsmuxConfig::parse(Path::new("/test/config.toml"), "[check\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &PathBuf::from("/test/config.toml"));
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TsmuxConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[check]\ndelay_ms = 0\n").unwrap();
        let config = TsmuxConfig::load_from(&path).unwrap();
        assert_eq!(config.check.delay(), Duration::ZERO);
    }

    #[test]
    fn language_targeting() {
        let languages = LanguageConfig::default();
        assert!(languages.is_target(Some(Path::new("/p/a.ts")), None));
        assert!(languages.is_target(Some(Path::new("/p/A.TSX")), None));
        assert!(!languages.is_target(Some(Path::new("/p/a.js")), None));
        assert!(!languages.is_target(None, None));
        // Unsaved buffer identified by its host language.
        assert!(languages.is_target(None, Some("typescript")));
        assert!(!languages.is_target(Some(Path::new("/p/notes.md")), Some("markdown")));
    }
}
