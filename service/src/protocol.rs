//! Message shapes of the tsserver-style JSON protocol.
//!
//! Only the process connector and the typed request helpers on
//! [`crate::ServiceInstance`] look at these; the rest of tsmux treats
//! requests as opaque `(command, arguments)` pairs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tsmux_types::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Position};

pub mod commands {
    pub const OPEN: &str = "open";
    pub const UPDATE_OPEN: &str = "updateOpen";
    pub const CLOSE: &str = "close";
    pub const GETERR: &str = "geterr";
    pub const PROJECT_INFO: &str = "projectInfo";
    pub const COMPLETIONS: &str = "completions";
    pub const DEFINITION: &str = "definition";
    pub const EXIT: &str = "exit";
}

/// Event that completes an asynchronous request such as `geterr`.
pub(crate) const REQUEST_COMPLETED_EVENT: &str = "requestCompleted";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl<'a> Request<'a> {
    pub fn new(seq: u64, command: &'a str, arguments: Value) -> Self {
        Self {
            seq,
            kind: "request",
            command,
            arguments,
        }
    }
}

/// A message read from the service.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Incoming {
    Response(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseFrame {
    pub request_seq: u64,
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireLocation {
    line: u32,
    offset: u32,
}

impl From<WireLocation> for Position {
    fn from(loc: WireLocation) -> Self {
        Position::from_one_based(loc.line, loc.offset)
    }
}

#[derive(Debug, Deserialize)]
struct WireDiagnostic {
    start: WireLocation,
    end: WireLocation,
    text: String,
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

impl WireDiagnostic {
    fn into_diagnostic(self, category: DiagnosticCategory) -> Diagnostic {
        let fallback = match category {
            DiagnosticCategory::Suggestion => DiagnosticSeverity::Suggestion,
            DiagnosticCategory::Syntax | DiagnosticCategory::Semantic => DiagnosticSeverity::Error,
        };
        Diagnostic::new(
            self.category
                .as_deref()
                .and_then(DiagnosticSeverity::from_label)
                .unwrap_or(fallback),
            self.text,
            self.start.into(),
            self.end.into(),
            self.code,
            self.source.unwrap_or_else(|| String::from("ts")),
        )
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticEventBody {
    file: PathBuf,
    #[serde(default)]
    diagnostics: Vec<WireDiagnostic>,
}

/// Decode a `syntaxDiag` / `semanticDiag` / `suggestionDiag` event.
///
/// Returns `None` for other events and for malformed bodies.
pub(crate) fn parse_diagnostics_event(
    event: &str,
    body: Value,
) -> Option<(DiagnosticCategory, PathBuf, Vec<Diagnostic>)> {
    let category = DiagnosticCategory::from_event(event)?;
    let body: DiagnosticEventBody = serde_json::from_value(body).ok()?;
    let items = body
        .diagnostics
        .into_iter()
        .map(|d| d.into_diagnostic(category))
        .collect();
    Some((category, body.file, items))
}

/// Extract `request_seq` from a `requestCompleted` event body.
pub(crate) fn completed_request_seq(body: &Value) -> Option<u64> {
    body.get("request_seq").and_then(Value::as_u64)
}

fn file_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn open_args(path: &Path, content: Option<&str>) -> Value {
    let mut args = serde_json::json!({ "file": file_arg(path) });
    if let Some(content) = content {
        args["fileContent"] = Value::String(content.to_string());
    }
    args
}

/// Full-text resync of an already open file.
pub(crate) fn update_open_args(path: &Path, content: &str) -> Value {
    serde_json::json!({
        "openFiles": [{ "file": file_arg(path), "fileContent": content }],
        "changedFiles": [],
        "closedFiles": []
    })
}

pub(crate) fn close_args(path: &Path) -> Value {
    serde_json::json!({ "file": file_arg(path) })
}

pub(crate) fn geterr_args(files: &[PathBuf], delay: Duration) -> Value {
    let files: Vec<String> = files.iter().map(|p| file_arg(p)).collect();
    serde_json::json!({
        "files": files,
        "delay": delay.as_millis() as u64
    })
}

pub(crate) fn project_info_args(path: &Path) -> Value {
    serde_json::json!({ "file": file_arg(path), "needFileNameList": false })
}

/// Arguments addressing a position; converts to the service's 1-based form.
pub(crate) fn location_args(path: &Path, position: Position, prefix: Option<&str>) -> Value {
    let mut args = serde_json::json!({
        "file": file_arg(path),
        "line": position.line + 1,
        "offset": position.col + 1
    });
    if let Some(prefix) = prefix {
        args["prefix"] = Value::String(prefix.to_string());
    }
    args
}

/// Answer to a `projectInfo` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    /// The config file the service associated with the queried file.
    pub config_file_name: PathBuf,
    #[serde(default)]
    pub file_names: Vec<PathBuf>,
    #[serde(default)]
    pub language_service_disabled: bool,
}

/// One autocompletion candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEntry {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub kind_modifiers: String,
    #[serde(default)]
    pub sort_text: String,
}

#[derive(Debug, Deserialize)]
struct WireSpan {
    file: PathBuf,
    start: WireLocation,
    end: WireLocation,
}

/// A span in a file, e.g. the target of "jump to definition".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub path: PathBuf,
    pub start: Position,
    pub end: Position,
}

pub(crate) fn parse_locations(body: Value) -> Result<Vec<Location>, serde_json::Error> {
    if body.is_null() {
        return Ok(Vec::new());
    }
    let spans: Vec<WireSpan> = serde_json::from_value(body)?;
    Ok(spans
        .into_iter()
        .map(|s| Location {
            path: s.file,
            start: s.start.into(),
            end: s.end.into(),
        })
        .collect())
}

pub(crate) fn parse_completions(body: Value) -> Result<Vec<CompletionEntry>, serde_json::Error> {
    if body.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(7, commands::GETERR, serde_json::json!({"files": []}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "request");
        assert_eq!(json["command"], "geterr");
        assert!(json["arguments"]["files"].is_array());
    }

    #[test]
    fn test_request_without_arguments_omits_field() {
        let req = Request::new(1, commands::EXIT, Value::Null);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("arguments").is_none(), "arguments must be omitted, not null");
    }

    #[test]
    fn test_incoming_response() {
        let frame = serde_json::json!({
            "seq": 0,
            "type": "response",
            "command": "projectInfo",
            "request_seq": 3,
            "success": true,
            "body": { "configFileName": "/proj/tsconfig.json" }
        });
        let Incoming::Response(resp) = serde_json::from_value(frame).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.request_seq, 3);
        assert!(resp.success);
        let info: ProjectInfo = serde_json::from_value(resp.body).unwrap();
        assert_eq!(info.config_file_name, PathBuf::from("/proj/tsconfig.json"));
        assert!(info.file_names.is_empty());
    }

    #[test]
    fn test_incoming_failed_response_without_body() {
        let frame = serde_json::json!({
            "type": "response",
            "request_seq": 4,
            "success": false,
            "message": "No Project."
        });
        let Incoming::Response(resp) = serde_json::from_value(frame).unwrap() else {
            panic!("expected response");
        };
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("No Project."));
        assert!(resp.body.is_null());
    }

    #[test]
    fn test_parse_semantic_diagnostics_event() {
        let body = serde_json::json!({
            "file": "/proj/a.ts",
            "diagnostics": [{
                "start": { "line": 3, "offset": 5 },
                "end": { "line": 3, "offset": 9 },
                "text": "Cannot find name 'foo'.",
                "code": 2304,
                "category": "error"
            }]
        });
        let (category, path, items) = parse_diagnostics_event("semanticDiag", body).unwrap();
        assert_eq!(category, DiagnosticCategory::Semantic);
        assert_eq!(path, PathBuf::from("/proj/a.ts"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].start(), Position::new(2, 4));
        assert_eq!(items[0].code(), Some(2304));
        assert_eq!(items[0].source(), "ts");
        assert!(items[0].severity().is_error());
    }

    #[test]
    fn test_parse_suggestion_without_category_falls_back() {
        let body = serde_json::json!({
            "file": "/proj/a.ts",
            "diagnostics": [{
                "start": { "line": 1, "offset": 1 },
                "end": { "line": 1, "offset": 2 },
                "text": "File is a CommonJS module."
            }]
        });
        let (_, _, items) = parse_diagnostics_event("suggestionDiag", body).unwrap();
        assert_eq!(items[0].severity(), DiagnosticSeverity::Suggestion);
    }

    #[test]
    fn test_parse_diagnostics_ignores_other_events() {
        assert!(parse_diagnostics_event("projectLoadingStart", serde_json::json!({})).is_none());
        assert!(parse_diagnostics_event("syntaxDiag", serde_json::json!({"nope": 1})).is_none());
    }

    #[test]
    fn test_geterr_args() {
        let args = geterr_args(
            &[PathBuf::from("/p/a.ts"), PathBuf::from("/p/b.ts")],
            Duration::from_millis(100),
        );
        assert_eq!(args["files"][0], "/p/a.ts");
        assert_eq!(args["files"][1], "/p/b.ts");
        assert_eq!(args["delay"], 100);
    }

    #[test]
    fn test_location_args_are_one_based() {
        let args = location_args(Path::new("/p/a.ts"), Position::new(0, 4), Some("fo"));
        assert_eq!(args["line"], 1);
        assert_eq!(args["offset"], 5);
        assert_eq!(args["prefix"], "fo");
    }

    #[test]
    fn test_open_args_with_and_without_content() {
        let args = open_args(Path::new("/p/a.ts"), None);
        assert!(args.get("fileContent").is_none());
        let args = open_args(Path::new("/p/a.ts"), Some("let x = 1;"));
        assert_eq!(args["fileContent"], "let x = 1;");
    }

    #[test]
    fn test_parse_locations() {
        let body = serde_json::json!([{
            "file": "/p/lib.ts",
            "start": { "line": 10, "offset": 17 },
            "end": { "line": 10, "offset": 20 }
        }]);
        let locs = parse_locations(body).unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].path, PathBuf::from("/p/lib.ts"));
        assert_eq!(locs[0].start, Position::new(9, 16));
        assert!(parse_locations(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_completions() {
        let body = serde_json::json!([
            { "name": "forEach", "kind": "method", "sortText": "11" },
            { "name": "filter", "kind": "method", "kindModifiers": "declare", "sortText": "11" }
        ]);
        let entries = parse_completions(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind_modifiers, "declare");
        assert_eq!(entries[0].kind_modifiers, "");
    }

    #[test]
    fn test_completed_request_seq() {
        assert_eq!(completed_request_seq(&serde_json::json!({"request_seq": 9})), Some(9));
        assert_eq!(completed_request_seq(&serde_json::json!({})), None);
    }
}
