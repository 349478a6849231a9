//! Run resolution export: which record survived each group and which were retired.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{DuplicateGroup, ProcessRun};

/// Resolution of one group as written to the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportGroup {
    pub group_id: i64,
    pub position: i64,
    pub retained_record_id: Option<String>,
    pub retired_record_ids: Vec<String>,
}

/// Whole-run export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExport {
    pub run_key: String,
    pub display_name: String,
    pub account_id: String,
    pub exported_at: i64,
    pub groups: Vec<ExportGroup>,
}

#[must_use]
pub fn group_to_export_item(group: &DuplicateGroup) -> ExportGroup {
    ExportGroup {
        group_id: group.id,
        position: group.position,
        retained_record_id: group
            .retained_record_id
            .clone()
            .or_else(|| group.members.first().map(|record| record.record_id.clone())),
        retired_record_ids: group.retired_record_ids(),
    }
}

/// Render a run's resolution as pretty-printed JSON.
pub fn render_json_export(
    run: &ProcessRun,
    groups: &[DuplicateGroup],
    exported_at: i64,
) -> serde_json::Result<String> {
    let document = RunExport {
        run_key: run.run_key.clone(),
        display_name: run.display_name.clone(),
        account_id: run.account_id.clone(),
        exported_at,
        groups: groups.iter().map(group_to_export_item).collect(),
    };
    serde_json::to_string_pretty(&document)
}

/// Deterministic export file name; run keys are reduced to filesystem-safe characters.
#[must_use]
pub fn suggested_export_file_name(run_key: &str, timestamp_ms: i64) -> String {
    let safe_key: String = run_key
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("dedup-{safe_key}-{timestamp_ms}.json")
}

/// Destination for rendered exports
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Store `body` under `file_name` and return a reference clients can use to fetch it.
    async fn store(&self, file_name: &str, body: &str) -> Result<String>;
}

/// Writes exports into a local directory; the reference is the file path.
#[derive(Debug, Clone)]
pub struct DirectoryExportSink {
    dir: PathBuf,
}

impl DirectoryExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ExportSink for DirectoryExportSink {
    async fn store(&self, file_name: &str, body: &str) -> Result<String> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);
        std::fs::write(&path, body)?;
        tracing::info!("Wrote export to {}", path.display());
        Ok(path.display().to_string())
    }
}
