//! Converges the documents under the output folder with a deduplicated issue
//! set: bootstrap the folder, purge stale documents, then upsert.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use futures::future::join_all;
use glsync_core::CanonicalIssue;
use glsync_storage::{DocumentStore, EntryKind, StoreError};

use crate::template::{IssueTemplate, TemplateEngine, DEFAULT_TEMPLATE};
use crate::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub output_dir: PathBuf,
    /// Store path of a user template; `None` uses the built-in one.
    pub template_file: Option<PathBuf>,
    pub purge: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub used_default_template: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ReconcileReport {
    fn record(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(kind = diagnostic.kind(), "{diagnostic}");
        self.diagnostics.push(diagnostic);
    }
}

enum Upserted {
    Created,
    Updated,
}

pub struct Reconciler<'a> {
    store: &'a dyn DocumentStore,
    engine: &'a dyn TemplateEngine,
    options: &'a ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        engine: &'a dyn TemplateEngine,
        options: &'a ReconcileOptions,
    ) -> Self {
        Self {
            store,
            engine,
            options,
        }
    }

    /// `output_dir/<filename>.md`
    pub fn document_path(&self, issue: &CanonicalIssue) -> PathBuf {
        self.options.output_dir.join(format!("{}.md", issue.filename))
    }

    /// Never fails as a whole; every per-document failure lands in the
    /// report's diagnostics.
    pub async fn reconcile(&self, issues: &[CanonicalIssue]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        self.ensure_output_dir(&mut report).await;
        if self.options.purge {
            self.purge(issues, &mut report).await;
        }
        if let Some(template) = self.resolve_template(&mut report).await {
            self.upsert_all(issues, template.as_ref(), &mut report).await;
        }
        report
    }

    async fn ensure_output_dir(&self, report: &mut ReconcileReport) {
        let path = &self.options.output_dir;
        match self.store.create_folder(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "created output folder"),
            Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => report.record(Diagnostic::FolderCreate {
                path: path.clone(),
                error: err.to_string(),
            }),
        }
    }

    async fn purge(&self, issues: &[CanonicalIssue], report: &mut ReconcileReport) {
        let folder = &self.options.output_dir;
        let existing = match self.store.list_files(folder).await {
            Ok(files) => files,
            Err(err) => {
                report.record(Diagnostic::PurgeListing {
                    path: folder.clone(),
                    error: err.to_string(),
                });
                return;
            }
        };

        let keep: BTreeSet<PathBuf> = issues.iter().map(|issue| self.document_path(issue)).collect();
        let stale: Vec<&PathBuf> = existing.iter().filter(|path| !keep.contains(*path)).collect();

        let results = join_all(stale.iter().map(|path| async move {
            let result = self.store.delete(path).await;
            (*path, result)
        }))
        .await;

        for (path, result) in results {
            match result {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "purged stale document");
                    report.deleted += 1;
                }
                Err(err) => report.record(Diagnostic::DocumentDelete {
                    path: path.clone(),
                    error: err.to_string(),
                }),
            }
        }
    }

    async fn resolve_template(&self, report: &mut ReconcileReport) -> Option<Box<dyn IssueTemplate>> {
        if let Some(path) = &self.options.template_file {
            let compiled = match self.store.read(path).await {
                Ok(text) => self.engine.compile(&text).map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match compiled {
                Ok(template) => return Some(template),
                Err(error) => report.record(Diagnostic::TemplateUnavailable {
                    path: Some(path.clone()),
                    error,
                }),
            }
        }

        report.used_default_template = true;
        match self.engine.compile(DEFAULT_TEMPLATE) {
            Ok(template) => Some(template),
            Err(err) => {
                report.record(Diagnostic::TemplateUnavailable {
                    path: None,
                    error: err.to_string(),
                });
                None
            }
        }
    }

    async fn upsert_all(
        &self,
        issues: &[CanonicalIssue],
        template: &dyn IssueTemplate,
        report: &mut ReconcileReport,
    ) {
        // Issues sharing a filename target one document; the last one wins.
        let mut targets: BTreeMap<PathBuf, &CanonicalIssue> = BTreeMap::new();
        for issue in issues {
            targets.insert(self.document_path(issue), issue);
        }

        let results = join_all(
            targets
                .iter()
                .map(|(path, issue)| self.upsert(path, issue, template)),
        )
        .await;

        for result in results {
            match result {
                Ok(Upserted::Created) => report.created += 1,
                Ok(Upserted::Updated) => report.updated += 1,
                Err(diagnostic) => report.record(diagnostic),
            }
        }
    }

    async fn upsert(
        &self,
        path: &Path,
        issue: &CanonicalIssue,
        template: &dyn IssueTemplate,
    ) -> Result<Upserted, Diagnostic> {
        let text = template.render(issue).map_err(|err| Diagnostic::DocumentRender {
            path: path.to_path_buf(),
            id: issue.id,
            error: err.to_string(),
        })?;
        let write_failed = |err: StoreError| Diagnostic::DocumentWrite {
            path: path.to_path_buf(),
            error: err.to_string(),
        };

        let entry = self.store.get_entry(path).await.map_err(write_failed)?;
        match entry.map(|entry| entry.kind) {
            Some(EntryKind::File) => {
                self.store.modify(path, &text).await.map_err(write_failed)?;
                tracing::debug!(path = %path.display(), id = issue.id, "updated document");
                Ok(Upserted::Updated)
            }
            Some(EntryKind::Folder) => Err(write_failed(StoreError::NotAFile(path.to_path_buf()))),
            None => {
                self.store.create(path, &text).await.map_err(write_failed)?;
                tracing::debug!(path = %path.display(), id = issue.id, "created document");
                Ok(Upserted::Created)
            }
        }
    }
}
