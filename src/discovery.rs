// 🔍 Discovery - turn a manifest or configured inboxes into DocumentJobs

use crate::config::SourceConfig;
use crate::extract::DocumentType;
use crate::pipeline::DocumentJob;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
struct ManifestRow {
    path: String,
    source_id: String,
    document_type: String,
}

/// Read a `path,source_id,document_type` CSV. Relative paths resolve against
/// the manifest's own directory.
pub fn load_manifest(manifest: &Path) -> Result<Vec<DocumentJob>> {
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(manifest)
        .with_context(|| format!("Failed to open manifest {}", manifest.display()))?;

    let mut jobs = Vec::new();
    for (line, record) in reader.deserialize::<ManifestRow>().enumerate() {
        // +2: header line, 1-based
        let row = record.with_context(|| format!("Bad manifest row {}", line + 2))?;
        let document_type: DocumentType = row
            .document_type
            .parse()
            .with_context(|| format!("Bad document type on manifest row {}", line + 2))?;

        let path = Path::new(&row.path);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        };
        jobs.push(DocumentJob::new(path, row.source_id, document_type));
    }

    Ok(jobs)
}

/// Files in one configured source directory, sorted by path. The processed
/// directory and hidden files are never picked up.
pub fn scan_source(source: &SourceConfig, processed_dir_name: &str) -> Result<Vec<DocumentJob>> {
    let max_depth = if source.recursive { usize::MAX } else { 1 };
    let mut jobs = Vec::new();

    let walker = WalkDir::new(&source.directory)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name.starts_with('.') || (e.file_type().is_dir() && name == processed_dir_name))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", source.directory.display()))?;
        if !entry.file_type().is_file() || !has_extension(entry.path(), &source.extensions) {
            continue;
        }
        jobs.push(DocumentJob::new(
            entry.path(),
            source.source_id.clone(),
            source.document_type,
        ));
    }

    tracing::debug!(
        directory = %source.directory.display(),
        files = jobs.len(),
        "source scanned"
    );
    Ok(jobs)
}

pub fn scan_sources(sources: &[SourceConfig], processed_dir_name: &str) -> Result<Vec<DocumentJob>> {
    let mut jobs = Vec::new();
    for source in sources {
        jobs.extend(scan_source(source, processed_dir_name)?);
    }
    Ok(jobs)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
