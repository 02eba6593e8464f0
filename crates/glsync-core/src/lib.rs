//! Core domain model for glsync: sources, raw and canonical issues, and the
//! pure normalization rules that derive local identities from remote records.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "glsync-core";

pub const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";

/// Which slice of a GitLab instance a source polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    #[default]
    Personal,
    Project(String),
    Group(String),
}

impl Scope {
    /// Parses `personal`, `project:<id>` or `group:<id>`. The id ends at the
    /// next `:`. Anything else, including a project/group selector without an
    /// id, is `Personal`.
    pub fn parse(selector: &str) -> Self {
        let mut parts = selector.trim().split(':');
        let kind = parts.next().unwrap_or_default();
        let id = parts.next().unwrap_or_default().trim();
        match kind {
            "project" if !id.is_empty() => Self::Project(id.to_string()),
            "group" if !id.is_empty() => Self::Group(id.to_string()),
            _ => Self::Personal,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Personal => f.write_str("personal"),
            Self::Project(id) => write!(f, "project:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.to_string()
    }
}

/// One fully resolved remote origin. Immutable for the duration of a run.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub gitlab_url: String,
    pub scope: Scope,
    pub filter: String,
    #[serde(skip_serializing)]
    pub token: String,
}

impl Source {
    pub fn personal(gitlab_url: impl Into<String>) -> Self {
        Self {
            gitlab_url: gitlab_url.into(),
            scope: Scope::Personal,
            filter: String::new(),
            token: String::new(),
        }
    }

    /// Issues endpoint for this source, before URI encoding.
    pub fn issues_url(&self) -> String {
        let base = format!("{}/api/v4", self.gitlab_url.trim_end_matches('/'));
        match &self.scope {
            Scope::Project(id) => format!("{base}/projects/{id}/issues?{}", self.filter),
            Scope::Group(id) => format!("{base}/groups/{id}/issues?{}", self.filter),
            Scope::Personal => format!("{base}/issues?{}", self.filter),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("gitlab_url", &self.gitlab_url)
            .field("scope", &self.scope)
            .field("filter", &self.filter)
            .field("token", &if self.has_token() { "<redacted>" } else { "" })
            .finish()
    }
}

/// Issue record as returned by the remote API. Only `id` is required; every
/// field the model does not name is kept in `extra` for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIssue {
    pub id: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub references: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawIssue {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: None,
            due_date: None,
            web_url: None,
            references: Value::Null,
            extra: Map::new(),
        }
    }

    pub fn with_references(mut self, references: Value) -> Self {
        self.references = references;
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Render-ready issue with its derived local identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalIssue {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub web_url: Option<String>,
    pub references: Value,
    /// Resolved `references.full` (or the plain string form).
    pub reference: String,
    pub filename: String,
    pub project: String,
    pub short_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Turns an arbitrary title into a file name the document store accepts.
pub trait FileNameSanitizer: Send + Sync {
    fn sanitize(&self, name: &str) -> String;
}

/// Lowercase slug: alphanumerics kept, every other run collapsed to `-`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlugSanitizer;

impl FileNameSanitizer for SlugSanitizer {
    fn sanitize(&self, name: &str) -> String {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for ch in name.chars() {
            if ch.is_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.extend(ch.to_lowercase());
            } else {
                pending_dash = true;
            }
        }
        slug
    }
}

const DERIVED_KEYS: [&str; 4] = ["reference", "filename", "project", "short_id"];

/// Normalizes a raw record. Total: malformed reference data degrades to
/// empty strings.
pub fn normalize(raw: RawIssue, sanitizer: &dyn FileNameSanitizer) -> CanonicalIssue {
    let reference = canonical_reference(&raw.references);
    let project = project_from_reference(&reference);
    let short_id = short_id_from_reference(&reference);
    let filename = sanitizer.sanitize(&raw.title);

    let mut extra = raw.extra;
    for key in DERIVED_KEYS {
        extra.remove(key);
    }

    CanonicalIssue {
        id: raw.id,
        title: raw.title,
        description: raw.description,
        due_date: raw.due_date,
        web_url: raw.web_url,
        references: raw.references,
        reference,
        filename,
        project,
        short_id,
        extra,
    }
}

pub fn canonical_reference(references: &Value) -> String {
    match references {
        Value::String(reference) => reference.clone(),
        Value::Object(map) => map
            .get("full")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// `group/project#42` becomes `group/project`.
pub fn project_from_reference(reference: &str) -> String {
    match reference.rfind('#') {
        Some(idx) => reference[..idx].to_string(),
        None => reference.to_string(),
    }
}

/// Uppercase acronym of the project path segment: `group/my-project#42`
/// becomes `MP`.
pub fn short_id_from_reference(reference: &str) -> String {
    if reference.is_empty() {
        return String::new();
    }
    acronym(project_segment(reference)).to_uppercase()
}

/// Segment between the last `/` that precedes a `#` and the first `#` after
/// it. References without that shape are used whole.
fn project_segment(reference: &str) -> &str {
    let Some(last_hash) = reference.rfind('#') else {
        return reference;
    };
    let Some(slash) = reference[..last_hash].rfind('/') else {
        return reference;
    };
    let tail = &reference[slash + 1..];
    let end = tail.find('#').unwrap_or(tail.len());
    &tail[..end]
}

fn is_word_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn acronym(segment: &str) -> String {
    let mut out = String::new();
    let mut chars = segment.chars();
    while let Some(ch) = chars.next() {
        out.push(ch);
        if is_word_char(ch) {
            // Skip the rest of the word, including the separator ending it.
            for next in chars.by_ref() {
                if matches!(next, '_' | ' ' | '-') {
                    break;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize_slug(raw: RawIssue) -> CanonicalIssue {
        normalize(raw, &SlugSanitizer)
    }

    #[test]
    fn scope_parsing_defaults_to_personal() {
        assert_eq!(Scope::parse("project:123"), Scope::Project("123".into()));
        assert_eq!(Scope::parse("group:acme"), Scope::Group("acme".into()));
        assert_eq!(Scope::parse("personal"), Scope::Personal);
        assert_eq!(Scope::parse(""), Scope::Personal);
        assert_eq!(Scope::parse("project"), Scope::Personal);
        assert_eq!(Scope::parse("project:"), Scope::Personal);
        assert_eq!(Scope::parse("team:9"), Scope::Personal);
        assert_eq!(Scope::Group("7".into()).to_string(), "group:7");
    }

    #[test]
    fn scope_id_stops_at_the_next_colon() {
        assert_eq!(Scope::parse("project:12:x"), Scope::Project("12".into()));
        assert_eq!(Scope::parse("group: acme :extra:more"), Scope::Group("acme".into()));
        assert_eq!(Scope::parse("project::12"), Scope::Personal);
    }

    #[test]
    fn issues_url_follows_scope() {
        let mut source = Source::personal("https://gitlab.example.com/");
        source.filter = "due_date=month".into();
        assert_eq!(
            source.issues_url(),
            "https://gitlab.example.com/api/v4/issues?due_date=month"
        );

        source.scope = Scope::Project("12345".into());
        assert_eq!(
            source.issues_url(),
            "https://gitlab.example.com/api/v4/projects/12345/issues?due_date=month"
        );

        source.scope = Scope::Group("99".into());
        assert_eq!(
            source.issues_url(),
            "https://gitlab.example.com/api/v4/groups/99/issues?due_date=month"
        );
    }

    #[test]
    fn debug_output_redacts_token() {
        let mut source = Source::personal(DEFAULT_GITLAB_URL);
        source.token = "glpat-secret".into();
        let rendered = format!("{source:?}");
        assert!(!rendered.contains("glpat-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn slug_sanitizer_produces_file_safe_names() {
        let s = SlugSanitizer;
        assert_eq!(s.sanitize("Fix bug"), "fix-bug");
        assert_eq!(s.sanitize("  Crash: /api/v4 <timeout>?  "), "crash-api-v4-timeout");
        assert_eq!(s.sanitize("Ünïcode Titel"), "ünïcode-titel");
        assert_eq!(s.sanitize("***"), "");
    }

    #[test]
    fn group_project_reference_regression() {
        let issue = normalize_slug(
            RawIssue::new(42, "Fix bug").with_references(json!("group/my-project#42")),
        );
        assert_eq!(issue.project, "group/my-project");
        assert_eq!(issue.short_id, "MP");
        assert_eq!(issue.filename, "fix-bug");
    }

    #[test]
    fn structured_references_use_full_variant() {
        let issue = normalize_slug(RawIssue::new(7, "Title").with_references(json!({
            "short": "#7",
            "relative": "my-cool_project#7",
            "full": "acme/platform/my-cool_project#7"
        })));
        assert_eq!(issue.reference, "acme/platform/my-cool_project#7");
        assert_eq!(issue.project, "acme/platform/my-cool_project");
        assert_eq!(issue.short_id, "MCP");
    }

    #[test]
    fn malformed_references_degrade_to_empty_strings() {
        for references in [
            Value::Null,
            json!(17),
            json!(["a/b#1"]),
            json!({ "short": "#1" }),
            json!({ "full": 12 }),
            json!(""),
        ] {
            let issue = normalize_slug(RawIssue::new(1, "x").with_references(references));
            assert_eq!(issue.reference, "");
            assert_eq!(issue.project, "");
            assert_eq!(issue.short_id, "");
        }
    }

    #[test]
    fn short_id_handles_references_without_path() {
        assert_eq!(short_id_from_reference("#42"), "#4");
        assert_eq!(short_id_from_reference("group/sub/api_gateway#1"), "AG");
        assert_eq!(project_from_reference("group/proj"), "group/proj");
    }

    #[test]
    fn normalization_is_deterministic_and_keeps_extra_fields() {
        let raw: RawIssue = serde_json::from_value(json!({
            "id": 5,
            "iid": 3,
            "title": "Broken login",
            "description": null,
            "due_date": "2026-10-31",
            "web_url": "https://gitlab.com/acme/web/-/issues/3",
            "references": { "full": "acme/web#3" },
            "labels": ["bug"],
            "state": "opened",
            "filename": "spoofed"
        }))
        .unwrap();

        let first = normalize_slug(raw.clone());
        let second = normalize_slug(raw);
        assert_eq!(first, second);
        assert_eq!(first.filename, "broken-login");
        assert_eq!(first.short_id, "W");
        assert_eq!(first.extra.get("labels"), Some(&json!(["bug"])));
        assert!(!first.extra.contains_key("filename"));

        let rendered = serde_json::to_value(&first).unwrap();
        assert_eq!(rendered["filename"], "broken-login");
        assert_eq!(rendered["state"], "opened");
        assert_eq!(rendered["references"]["full"], "acme/web#3");
    }

    #[test]
    fn null_title_deserializes_as_empty() {
        let raw: RawIssue = serde_json::from_value(json!({ "id": 9, "title": null })).unwrap();
        let issue = normalize_slug(raw);
        assert_eq!(issue.title, "");
        assert_eq!(issue.filename, "");
    }
}
