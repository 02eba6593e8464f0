//! Document templates. Issues render to Markdown through a compiled template;
//! the engine behind it is pluggable.

use glsync_core::CanonicalIssue;
use handlebars::{handlebars_helper, Handlebars, JsonValue};
use thiserror::Error;

/// Built-in document layout: YAML frontmatter followed by the description.
pub const DEFAULT_TEMPLATE: &str = r#"---
id: {{id}}
title: {{quoted title}}
dueDate: {{due_date}}
webUrl: {{quoted web_url}}
project: {{quoted project}}
shortId: {{short_id}}
---

### {{title}}
##### Due on {{due_date}}

{{description}}

[View On GitLab]({{web_url}})
"#;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template does not compile: {0}")]
    Compile(String),
    #[error("rendering issue {id}: {message}")]
    Render { id: u64, message: String },
}

pub trait IssueTemplate: Send + Sync {
    fn render(&self, issue: &CanonicalIssue) -> Result<String, TemplateError>;
}

pub trait TemplateEngine: Send + Sync {
    fn compile(&self, text: &str) -> Result<Box<dyn IssueTemplate>, TemplateError>;
}

/// Double-quoted YAML scalar for any value; missing values become `""`.
pub fn yaml_quoted(value: &JsonValue) -> String {
    let text = match value {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if ch.is_control() => out.push_str(&format!("\\u{:04X}", u32::from(ch))),
            ch => out.push(ch),
        }
    }
    out.push('"');
    out
}

handlebars_helper!(quoted: |value: Json| yaml_quoted(value));

/// Handlebars without HTML escaping; unknown fields render empty. Templates
/// get a `quoted` helper for frontmatter strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlebarsEngine;

const TEMPLATE_NAME: &str = "issue";

struct HandlebarsTemplate {
    registry: Handlebars<'static>,
}

impl IssueTemplate for HandlebarsTemplate {
    fn render(&self, issue: &CanonicalIssue) -> Result<String, TemplateError> {
        self.registry
            .render(TEMPLATE_NAME, issue)
            .map_err(|err| TemplateError::Render {
                id: issue.id,
                message: err.to_string(),
            })
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn compile(&self, text: &str) -> Result<Box<dyn IssueTemplate>, TemplateError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(false);
        registry.register_helper("quoted", Box::new(quoted));
        registry
            .register_template_string(TEMPLATE_NAME, text)
            .map_err(|err| TemplateError::Compile(err.to_string()))?;
        Ok(Box::new(HandlebarsTemplate { registry }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glsync_core::{normalize, RawIssue, SlugSanitizer};
    use serde_json::json;

    fn issue() -> CanonicalIssue {
        let mut raw = RawIssue::new(42, "Fix <bug> & \"crash\"")
            .with_references(json!({ "full": "group/my-project#42" }));
        raw.due_date = Some("2026-11-01".into());
        raw.web_url = Some("https://gitlab.com/group/my-project/-/issues/42".into());
        raw.extra.insert("labels".into(), json!(["bug", "p1"]));
        normalize(raw, &SlugSanitizer)
    }

    fn frontmatter(rendered: &str) -> serde_yaml::Mapping {
        let body = rendered.strip_prefix("---\n").expect("opening fence");
        let (yaml, _) = body.split_once("\n---\n").expect("closing fence");
        serde_yaml::from_str(yaml).expect("frontmatter is valid YAML")
    }

    fn field<'a>(map: &'a serde_yaml::Mapping, key: &str) -> &'a serde_yaml::Value {
        map.get(key).unwrap_or_else(|| panic!("missing {key}"))
    }

    #[test]
    fn default_template_renders_frontmatter() {
        let template = HandlebarsEngine.compile(DEFAULT_TEMPLATE).expect("compile");
        let rendered = template.render(&issue()).expect("render");
        let meta = frontmatter(&rendered);

        assert_eq!(field(&meta, "id").as_u64(), Some(42));
        assert_eq!(field(&meta, "title").as_str(), Some("Fix <bug> & \"crash\""));
        assert_eq!(field(&meta, "dueDate").as_str(), Some("2026-11-01"));
        assert_eq!(field(&meta, "project").as_str(), Some("group/my-project"));
        assert_eq!(field(&meta, "shortId").as_str(), Some("MP"));
        assert_eq!(
            field(&meta, "webUrl").as_str(),
            Some("https://gitlab.com/group/my-project/-/issues/42")
        );
        assert!(rendered.contains("### Fix <bug> & \"crash\"\n"));
        assert!(rendered.contains("[View On GitLab](https://gitlab.com/group/my-project/-/issues/42)"));
    }

    #[test]
    fn awkward_titles_round_trip_through_frontmatter() {
        let template = HandlebarsEngine.compile(DEFAULT_TEMPLATE).expect("compile");
        for title in [
            "Crash on \"save\" button",
            "Path C:\\temp\\x is \\ broken",
            "key: value # not a comment",
            "'single' and \"double\"",
            "two\nlines\tand a tab",
            "- starts like a list",
            "",
        ] {
            let issue = normalize(RawIssue::new(1, title), &SlugSanitizer);
            let rendered = template.render(&issue).expect("render");
            let meta = frontmatter(&rendered);
            assert_eq!(field(&meta, "title").as_str(), Some(title), "{rendered}");
            assert_eq!(field(&meta, "webUrl").as_str(), Some(""));
            assert_eq!(field(&meta, "project").as_str(), Some(""));
        }
    }

    #[test]
    fn yaml_quoted_escapes_quotes_backslashes_and_controls() {
        assert_eq!(yaml_quoted(&json!("a \"b\" \\ c")), r#""a \"b\" \\ c""#);
        assert_eq!(yaml_quoted(&json!("x\u{7}y")), r#""x\u0007y""#);
        assert_eq!(yaml_quoted(&json!(null)), r#""""#);
        assert_eq!(yaml_quoted(&json!(17)), r#""17""#);
    }

    #[test]
    fn extra_fields_are_available_and_missing_ones_render_empty() {
        let template = HandlebarsEngine
            .compile("{{#each labels}}[{{this}}]{{/each}}|{{assignee.name}}|{{filename}}")
            .expect("compile");
        assert_eq!(
            template.render(&issue()).expect("render"),
            "[bug][p1]||fix-bug-crash"
        );
    }

    #[test]
    fn unbalanced_blocks_fail_to_compile() {
        assert!(matches!(
            HandlebarsEngine.compile("{{#each labels}}never closed"),
            Err(TemplateError::Compile(_))
        ));
    }
}
