//! Services tsmux offers back to the host: completions, go-to-definition and
//! project config loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tsmux_service::{CompletionEntry, Location, ServiceError, ServiceResolver};
use tsmux_types::Position;

/// Completions at a position, answered by the file's project service.
pub struct AutocompleteProvider {
    resolver: Arc<ServiceResolver>,
}

impl AutocompleteProvider {
    #[must_use]
    pub fn new(resolver: Arc<ServiceResolver>) -> Self {
        Self { resolver }
    }

    pub async fn completions(
        &self,
        path: &Path,
        position: Position,
        prefix: &str,
    ) -> Result<Vec<CompletionEntry>, ServiceError> {
        let service = self.resolver.resolve(path).await?;
        let mut entries = service.completions(path, position, prefix).await?;
        let prefix = prefix.to_lowercase();
        entries.retain(|e| e.name.to_lowercase().starts_with(&prefix));
        entries.sort_by(|a, b| a.sort_text.cmp(&b.sort_text).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }
}

/// Go-to-definition.
pub struct NavigationProvider {
    resolver: Arc<ServiceResolver>,
}

impl NavigationProvider {
    #[must_use]
    pub fn new(resolver: Arc<ServiceResolver>) -> Self {
        Self { resolver }
    }

    pub async fn definition(&self, path: &Path, position: Position) -> Result<Vec<Location>, ServiceError> {
        let service = self.resolver.resolve(path).await?;
        service.definition(path, position).await
    }
}

/// A parsed project config file.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectConfig {
    pub path: PathBuf,
    pub config: Value,
}

/// Ask the service which config governs `path`, then read and parse it.
pub async fn load_project_config(resolver: &ServiceResolver, path: &Path) -> Result<ProjectConfig> {
    let service = resolver
        .resolve(path)
        .await
        .with_context(|| format!("resolving service for {}", path.display()))?;
    let info = service
        .project_info(path)
        .await
        .with_context(|| format!("querying project info for {}", path.display()))?;
    read_project_config(&info.config_file_name)
}

pub fn read_project_config(path: &Path) -> Result<ProjectConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = parse_tsconfig(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ProjectConfig {
        path: path.to_path_buf(),
        config,
    })
}

/// Parse tsconfig-flavoured JSON: a leading BOM, `//` and `/* */` comments
/// and trailing commas are accepted. An empty file is `{}`.
pub fn parse_tsconfig(text: &str) -> Result<Value> {
    let cleaned = strip_trailing_commas(&strip_comments(text.trim_start_matches('\u{feff}')));
    if cleaned.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    Ok(serde_json::from_str(&cleaned)?)
}

/// Replace comments with whitespace, leaving string literals intact.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek().copied()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    if next == '\n' {
                        out.push('\n');
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Drop commas that directly precede `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().copied().find(|n| !n.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let value = parse_tsconfig(r#"{"compilerOptions": {"strict": true}}"#).unwrap();
        assert_eq!(value["compilerOptions"]["strict"], true);
    }

    #[test]
    fn test_parse_comments_and_trailing_commas() {
        let text = r#"
        // generated by tsc --init
        {
            /* Visit https://aka.ms/tsconfig */
            "compilerOptions": {
                "target": "es2022", // modern output
                "outDir": "./dist",
                "paths": { "@/*": ["src/*",], },
            },
            "include": ["src/**/*",],
        }
        "#;
        let value = parse_tsconfig(text).unwrap();
        assert_eq!(value["compilerOptions"]["target"], "es2022");
        assert_eq!(value["compilerOptions"]["paths"]["@/*"][0], "src/*");
        assert_eq!(value["include"][0], "src/**/*");
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let text = r#"{"a": "http://example.com/*x*/", "b": "q\"//,}"}"#;
        let value = parse_tsconfig(text).unwrap();
        assert_eq!(value["a"], "http://example.com/*x*/");
        assert_eq!(value["b"], "q\"//,}");
    }

    #[test]
    fn test_bom_and_empty_file() {
        assert_eq!(parse_tsconfig("\u{feff}{\"x\": 1}").unwrap()["x"], 1);
        assert!(parse_tsconfig("  // nothing here\n").unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(parse_tsconfig("{\"compilerOptions\": ").is_err());
    }

    #[test]
    fn test_read_project_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsconfig.json");
        fs::write(&path, "{ \"files\": [\"a.ts\",], }").unwrap();
        let config = read_project_config(&path).unwrap();
        assert_eq!(config.path, path);
        assert_eq!(config.config["files"][0], "a.ts");

        assert!(read_project_config(&dir.path().join("missing.json")).is_err());
    }
}
