//! Persisted settings: loading, legacy-field migration and resolution of the
//! effective source list. The file is YAML; a JSON settings file written by
//! older tooling parses as-is because YAML accepts JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use glsync_core::{Scope, Source, DEFAULT_GITLAB_URL};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OUTPUT_DIR: &str = "Gitlab Issues";
pub const DEFAULT_FILTER: &str = "due_date=month";

/// One source entry as written in the settings file. Unset fields are filled
/// from the `default` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    #[serde(alias = "gitlabUrl", skip_serializing_if = "Option::is_none")]
    pub gitlab_url: Option<String>,
    #[serde(alias = "gitlabScope", skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(alias = "gitlabToken", skip_serializing)]
    pub token: Option<String>,
}

impl SourceSettings {
    /// Shallow merge: fields set here win over `base`.
    pub fn overlay_on(&self, base: &SourceSettings) -> SourceSettings {
        SourceSettings {
            gitlab_url: self.gitlab_url.clone().or_else(|| base.gitlab_url.clone()),
            scope: self.scope.clone().or_else(|| base.scope.clone()),
            filter: self.filter.clone().or_else(|| base.filter.clone()),
            token: self.token.clone().or_else(|| base.token.clone()),
        }
    }

    fn into_source(self) -> Source {
        Source {
            gitlab_url: self
                .gitlab_url
                .unwrap_or_else(|| DEFAULT_GITLAB_URL.to_string()),
            scope: self.scope.as_deref().map(Scope::parse).unwrap_or_default(),
            filter: self.filter.unwrap_or_default(),
            token: self.token.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "IntervalRepr")]
pub enum RefreshInterval {
    Off,
    Minutes(u32),
}

impl RefreshInterval {
    pub const ALLOWED_MINUTES: [u32; 5] = [15, 30, 45, 60, 120];

    pub fn period(self) -> Option<Duration> {
        match self {
            Self::Off => None,
            Self::Minutes(minutes) => Some(Duration::from_secs(u64::from(minutes) * 60)),
        }
    }
}

impl Default for RefreshInterval {
    fn default() -> Self {
        Self::Minutes(15)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<IntervalRepr> for RefreshInterval {
    type Error = String;

    fn try_from(value: IntervalRepr) -> Result<Self, Self::Error> {
        let minutes = match value {
            IntervalRepr::Text(text) if text.trim().eq_ignore_ascii_case("off") => return Ok(Self::Off),
            IntervalRepr::Text(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid refresh interval {text:?}"))?,
            IntervalRepr::Number(minutes) => minutes,
        };
        u32::try_from(minutes)
            .ok()
            .filter(|m| Self::ALLOWED_MINUTES.contains(m))
            .map(Self::Minutes)
            .ok_or_else(|| {
                format!(
                    "refresh interval must be off or one of {:?} minutes, got {minutes}",
                    Self::ALLOWED_MINUTES
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Store path of a user template; `None` renders with the default one.
    pub template_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub default: SourceSettings,
    pub sources: Vec<SourceSettings>,
    pub purge_issues: bool,
    pub refresh_on_startup: bool,
    pub interval_of_refresh: RefreshInterval,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            template_file: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            default: SourceSettings {
                gitlab_url: Some(DEFAULT_GITLAB_URL.to_string()),
                filter: Some(DEFAULT_FILTER.to_string()),
                ..SourceSettings::default()
            },
            sources: vec![SourceSettings {
                scope: Some("personal".to_string()),
                ..SourceSettings::default()
            }],
            purge_issues: true,
            refresh_on_startup: true,
            interval_of_refresh: RefreshInterval::default(),
        }
    }
}

impl Settings {
    /// Effective sources for one run: `default` overlaid under each entry,
    /// or a single personal source when none are configured.
    pub fn resolve_sources(&self) -> Vec<Source> {
        if self.sources.is_empty() {
            return vec![SourceSettings::default().overlay_on(&self.default).into_source()];
        }
        self.sources
            .iter()
            .map(|source| source.overlay_on(&self.default).into_source())
            .collect()
    }

    pub fn has_any_token(&self) -> bool {
        self.resolve_sources().iter().any(Source::has_token)
    }
}

/// On-disk shape. Everything is optional; the legacy flat fields predate the
/// `sources` list and are only read to migrate them.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    #[serde(alias = "templateFile")]
    template_file: Option<String>,
    #[serde(alias = "outputDir")]
    output_dir: Option<String>,
    default: Option<SourceSettings>,
    sources: Option<Vec<SourceSettings>>,
    #[serde(alias = "purgeIssues")]
    purge_issues: Option<bool>,
    #[serde(alias = "refreshOnStartup")]
    refresh_on_startup: Option<bool>,
    #[serde(alias = "intervalOfRefresh")]
    interval_of_refresh: Option<RefreshInterval>,

    #[serde(alias = "gitlabUrl")]
    gitlab_url: Option<String>,
    #[serde(alias = "gitlabToken")]
    gitlab_token: Option<String>,
    #[serde(alias = "gitlabIssuesLevel")]
    gitlab_issues_level: Option<String>,
    #[serde(alias = "gitlabAppId")]
    gitlab_app_id: Option<String>,
    filter: Option<String>,
}

impl SettingsFile {
    fn has_legacy_fields(&self) -> bool {
        self.gitlab_url.is_some()
            || self.gitlab_token.is_some()
            || self.gitlab_issues_level.is_some()
            || self.gitlab_app_id.is_some()
            || self.filter.is_some()
    }

    fn legacy_source(&self) -> SourceSettings {
        let app_id = self.gitlab_app_id.as_deref().unwrap_or_default();
        let scope = match self.gitlab_issues_level.as_deref() {
            Some("project") => format!("project:{app_id}"),
            Some("group") => format!("group:{app_id}"),
            _ => "personal".to_string(),
        };
        SourceSettings {
            gitlab_url: self.gitlab_url.clone(),
            scope: Some(scope),
            filter: self.filter.clone(),
            token: self.gitlab_token.clone(),
        }
    }

    fn into_settings(self) -> Result<Settings> {
        let defaults = Settings::default();

        let sources = match &self.sources {
            Some(sources) if !sources.is_empty() => sources.clone(),
            _ if self.has_legacy_fields() => vec![self.legacy_source()],
            _ => defaults.sources,
        };

        let output_dir = match self.output_dir.as_deref() {
            Some(dir) => normalize_output_dir(dir)?,
            None => defaults.output_dir,
        };

        let template_file = match self.template_file.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(path) => Some(normalize_store_path(path).context("invalid template_file")?),
        };

        Ok(Settings {
            template_file,
            output_dir,
            default: self.default.unwrap_or(defaults.default),
            sources,
            purge_issues: self.purge_issues.unwrap_or(defaults.purge_issues),
            refresh_on_startup: self.refresh_on_startup.unwrap_or(defaults.refresh_on_startup),
            interval_of_refresh: self
                .interval_of_refresh
                .unwrap_or(defaults.interval_of_refresh),
        })
    }
}

/// Store-relative form of a user supplied path: separators collapsed, no
/// leading or trailing `/`. Parent and absolute components are rejected.
fn normalize_store_path(raw: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for segment in raw.split(['/', '\\']) {
        match segment.trim() {
            "" | "." => {}
            ".." => bail!("path {raw:?} must not contain `..`"),
            _ => path.push(segment),
        }
    }
    if path.as_os_str().is_empty() {
        bail!("path {raw:?} is empty");
    }
    Ok(path)
}

pub fn normalize_output_dir(raw: &str) -> Result<PathBuf> {
    normalize_store_path(raw).context("invalid output_dir")
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    if text.trim().is_empty() {
        return Ok(Settings::default());
    }
    let file: SettingsFile = serde_yaml::from_str(text).context("parsing settings")?;
    file.into_settings()
}

/// Loads settings from `path`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "settings file not found, using defaults");
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_settings(&text).with_context(|| format!("loading {}", path.display()))
}
