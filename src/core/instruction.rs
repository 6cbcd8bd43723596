//! Edit instructions and their ingestion from suggestion files.
//!
//! Upstream suggestion files are loosely shaped JSON. They are converted to a
//! closed set of typed instruction kinds here, once, so the apply pipeline
//! never has to look into untyped maps. Anything that does not fit a known
//! kind is kept as `Raw` with its parameters intact.

use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::EngineError;

/// Identifier shape accepted for tracking function / event names
static EVENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$.]*$").expect("static regex"));

/// User interaction a tracking call is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackAction {
    Click,
    Submit,
    View,
    Back,
    Exit,
    Select,
    Nav,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TrackAction {
    /// Lenient parse used during ingestion
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" => TrackAction::Click,
            "submit" => TrackAction::Submit,
            "view" | "page_load" | "pageview" => TrackAction::View,
            "back" => TrackAction::Back,
            "exit" => TrackAction::Exit,
            "select" => TrackAction::Select,
            "nav" | "navigate" | "navigation" => TrackAction::Nav,
            _ => TrackAction::Unknown,
        }
    }
}

/// What the generator is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionKind {
    /// Add a tracking call for a user action
    TrackEvent {
        event: String,
        action: TrackAction,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    /// Add a page-view call
    PageView {
        page_name: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    /// Add a `data-track` attribute to an element
    DataTrack { element: String, value: String },
    /// Unknown action, parameters passed through untouched
    Raw {
        action: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl InstructionKind {
    /// Short symbolic name for logs and reports
    pub fn name(&self) -> &str {
        match self {
            InstructionKind::TrackEvent { .. } => "track_event",
            InstructionKind::PageView { .. } => "page_view",
            InstructionKind::DataTrack { .. } => "data_track",
            InstructionKind::Raw { action, .. } => action.as_str(),
        }
    }
}

/// One unit of requested file edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditInstruction {
    /// Repository-relative target
    pub file_path: PathBuf,
    /// Why this edit is wanted (surfaced in reports)
    #[serde(default)]
    pub rationale: String,
    #[serde(flatten)]
    pub kind: InstructionKind,
    /// Explicit marker overriding the kind-derived one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl EditInstruction {
    pub fn new(file_path: impl Into<PathBuf>, rationale: impl Into<String>, kind: InstructionKind) -> Self {
        Self {
            file_path: file_path.into(),
            rationale: rationale.into(),
            kind,
            marker: None,
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Code fragments whose presence suggests the edit is already applied.
    /// Empty means there is no cheap way to tell.
    pub fn markers(&self) -> Vec<String> {
        if let Some(m) = self.marker.as_deref().map(str::trim)
            && !m.is_empty()
        {
            return vec![m.to_string()];
        }
        let derived = match &self.kind {
            InstructionKind::TrackEvent { event, .. } => Some(event.as_str()),
            InstructionKind::PageView { page_name, .. } => Some(page_name.as_str()),
            InstructionKind::DataTrack { value, .. } => Some(value.as_str()),
            InstructionKind::Raw { params, .. } => params.get("marker").map(String::as_str),
        };
        derived
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| vec![m.to_string()])
            .unwrap_or_default()
    }

    /// Structural checks that need no I/O
    pub fn validate(&self, backup_suffix: &str) -> Result<(), EngineError> {
        normalize_repo_rel(&self.file_path)?;

        let name = self
            .file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !backup_suffix.is_empty() && name.ends_with(backup_suffix) {
            return Err(EngineError::Validation(format!(
                "{} is a backup file",
                self.file_path.display()
            )));
        }

        match &self.kind {
            InstructionKind::TrackEvent { event, .. } => {
                if !EVENT_NAME.is_match(event) {
                    return Err(EngineError::Validation(format!(
                        "event name {event:?} is not an identifier"
                    )));
                }
            }
            InstructionKind::PageView { page_name, .. } => {
                if page_name.trim().is_empty() {
                    return Err(EngineError::Validation("page view without page_name".into()));
                }
            }
            InstructionKind::DataTrack { element, value } => {
                if element.trim().is_empty() || value.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "data_track needs both element and value".into(),
                    ));
                }
            }
            InstructionKind::Raw { action, .. } => {
                if action.trim().is_empty() {
                    return Err(EngineError::Validation("raw instruction without action".into()));
                }
            }
        }
        Ok(())
    }
}

/// Normalize a repo-relative path, rejecting anything that escapes the root.
pub fn normalize_repo_rel(p: &Path) -> Result<PathBuf, EngineError> {
    if p.is_absolute() {
        return Err(EngineError::Validation(format!(
            "path must be repo-relative: {}",
            p.display()
        )));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::ParentDir => {
                return Err(EngineError::Validation(format!(
                    "path escapes repo: {}",
                    p.display()
                )));
            }
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir => {
                return Err(EngineError::Validation(format!(
                    "path must be repo-relative: {}",
                    p.display()
                )));
            }
            Component::Normal(s) => out.push(s),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(EngineError::Validation("empty path".into()));
    }
    Ok(out)
}

/// Producer of ordered edit instructions
pub trait SuggestionSource {
    fn instructions(&self) -> anyhow::Result<Ingested>;
}

/// Ingestion outcome: usable instructions plus per-item rejections
#[derive(Debug, Default)]
pub struct Ingested {
    pub instructions: Vec<EditInstruction>,
    /// (item index, reason)
    pub rejected: Vec<(usize, EngineError)>,
}

/// Reads the suggestion/apply-plan JSON shapes produced upstream
#[derive(Debug, Clone)]
pub struct JsonSuggestionSource {
    path: PathBuf,
}

impl JsonSuggestionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SuggestionSource for JsonSuggestionSource {
    fn instructions(&self) -> anyhow::Result<Ingested> {
        use anyhow::Context;
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read suggestions: {}", self.path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse suggestions: {}", self.path.display()))?;
        Ok(ingest_value(value))
    }
}

/// Accepts a bare array, `{"items": [...]}`, or an object keyed by
/// `"path:lines"`.
pub fn ingest_value(value: Value) -> Ingested {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut map) if map.contains_key("items") => match map.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(key, item)| match item {
                Value::Object(mut obj) => {
                    // "src/App.jsx:12-20" -> "src/App.jsx"
                    let file = match key.rsplit_once(':') {
                        Some((file, lines))
                            if !lines.is_empty()
                                && lines.chars().all(|c| c.is_ascii_digit() || c == '-' || c == ',') =>
                        {
                            file.to_string()
                        }
                        _ => key.clone(),
                    };
                    obj.entry("file").or_insert(Value::String(file));
                    Some(Value::Object(obj))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut out = Ingested::default();
    for (idx, item) in items.iter().enumerate() {
        match instruction_from_item(item) {
            Ok(ins) => out.instructions.push(ins),
            Err(e) => out.rejected.push((idx, e)),
        }
    }
    out
}

fn str_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| item.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn params_field(item: &Value) -> BTreeMap<String, String> {
    let obj = ["params", "suggested_params"]
        .iter()
        .filter_map(|k| item.get(*k))
        .find_map(Value::as_object);
    let Some(obj) = obj else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

/// Map one loosely shaped item to a typed instruction
pub fn instruction_from_item(item: &Value) -> Result<EditInstruction, EngineError> {
    if !item.is_object() {
        return Err(EngineError::Validation("suggestion item is not an object".into()));
    }
    let file = str_field(item, &["file", "file_path"])
        .ok_or_else(|| EngineError::Validation("missing file path".into()))?;
    let rationale = str_field(item, &["rationale", "why_location", "implementation_note", "kpi"])
        .unwrap_or_default()
        .to_string();
    let action = str_field(item, &["action"]).unwrap_or_default().to_string();
    let kind_hint = str_field(item, &["kind"]).map(str::to_ascii_lowercase);
    let params = params_field(item);

    let kind = match kind_hint.as_deref() {
        Some("data_track") => InstructionKind::DataTrack {
            element: str_field(item, &["element"]).unwrap_or_default().to_string(),
            value: str_field(item, &["value", "data_track"]).unwrap_or_default().to_string(),
        },
        Some("page_view") => InstructionKind::PageView {
            page_name: str_field(item, &["page_name", "pageName"]).unwrap_or_default().to_string(),
            params,
        },
        Some("raw") => InstructionKind::Raw { action, params },
        _ => {
            if let Some(event) = str_field(item, &["event", "suggested_event_name"]) {
                InstructionKind::TrackEvent {
                    event: event.to_string(),
                    action: TrackAction::parse(&action),
                    params,
                }
            } else if let Some(page) = str_field(item, &["page_name", "pageName"]) {
                InstructionKind::PageView {
                    page_name: page.to_string(),
                    params,
                }
            } else if action.is_empty() {
                return Err(EngineError::Validation(format!(
                    "item for {file} has neither event, page_name nor action"
                )));
            } else {
                InstructionKind::Raw { action, params }
            }
        }
    };

    let mut ins = EditInstruction::new(file, rationale, kind);
    ins.marker = str_field(item, &["marker"]).map(str::to_string);
    Ok(ins)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn track(file: &str, event: &str) -> EditInstruction {
        EditInstruction::new(
            file,
            "",
            InstructionKind::TrackEvent {
                event: event.into(),
                action: TrackAction::Click,
                params: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn rejects_escaping_and_absolute_paths() {
        assert!(track("../x.js", "trackClick").validate(".bak").is_err());
        assert!(track("/etc/passwd", "trackClick").validate(".bak").is_err());
        assert!(track("./src/a.js", "trackClick").validate(".bak").is_ok());
        assert_eq!(
            normalize_repo_rel(Path::new("./src/./a.js")).unwrap(),
            PathBuf::from("src/a.js")
        );
    }

    #[test]
    fn rejects_backup_targets_and_bad_event_names() {
        assert!(track("a.js.taggingai.bak", "trackClick").validate(".taggingai.bak").is_err());
        assert!(track("a.js", "track click()").validate(".bak").is_err());
        assert!(track("a.js", "analytics.trackClick").validate(".bak").is_ok());
    }

    #[test]
    fn explicit_marker_wins_over_derived() {
        let ins = track("a.js", "trackClick");
        assert_eq!(ins.markers(), vec!["trackClick".to_string()]);
        let ins = ins.with_marker("useTracking(");
        assert_eq!(ins.markers(), vec!["useTracking(".to_string()]);

        let raw = EditInstruction::new(
            "a.js",
            "",
            InstructionKind::Raw {
                action: "wrap".into(),
                params: BTreeMap::new(),
            },
        );
        assert!(raw.markers().is_empty());
    }

    #[test]
    fn keyed_object_keeps_file_order() {
        let text = r#"{
            "src/b.jsx:1-2": { "event": "trackFirst" },
            "src/a.jsx:20-30": { "event": "trackSecond" },
            "src/a.jsx:5-10": { "event": "trackThird" }
        }"#;
        let got = ingest_value(serde_json::from_str(text).unwrap());
        let events: Vec<String> = got.instructions.iter().flat_map(|i| i.markers()).collect();
        assert_eq!(events, vec!["trackFirst", "trackSecond", "trackThird"]);
        assert_eq!(got.instructions[1].file_path, PathBuf::from("src/a.jsx"));
    }

    #[test]
    fn ingests_all_three_shapes() {
        let arr = json!([{ "file": "a.js", "event": "trackClick", "action": "click" }]);
        let items = json!({ "items": [{ "file_path": "b.js", "page_name": "Home" }] });
        let keyed = json!({ "src/c.jsx:10-20": { "suggested_event_name": "trackSubmit" } });

        let a = ingest_value(arr);
        assert_eq!(a.instructions.len(), 1);
        assert!(matches!(
            a.instructions[0].kind,
            InstructionKind::TrackEvent { action: TrackAction::Click, .. }
        ));

        let b = ingest_value(items);
        assert!(matches!(b.instructions[0].kind, InstructionKind::PageView { .. }));

        let c = ingest_value(keyed);
        assert_eq!(c.instructions[0].file_path, PathBuf::from("src/c.jsx"));
    }

    #[test]
    fn stringifies_params_and_reports_rejections() {
        let v = json!([
            { "file": "a.js", "event": "trackClick", "params": { "count": 3, "flag": true, "skip": null } },
            { "event": "noFile" },
            { "file": "b.js" }
        ]);
        let got = ingest_value(v);
        assert_eq!(got.instructions.len(), 1);
        match &got.instructions[0].kind {
            InstructionKind::TrackEvent { params, .. } => {
                assert_eq!(params.get("count").map(String::as_str), Some("3"));
                assert_eq!(params.get("flag").map(String::as_str), Some("true"));
                assert!(!params.contains_key("skip"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        let idx: Vec<usize> = got.rejected.iter().map(|(i, _)| *i).collect();
        assert_eq!(idx, vec![1, 2]);
    }

    #[test]
    fn serde_round_trip_keeps_kind_tag() {
        let ins = track("a.js", "trackClick");
        let s = serde_json::to_string(&ins).unwrap();
        assert!(s.contains(r#""kind":"track_event""#));
        let back: EditInstruction = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ins);
    }
}
