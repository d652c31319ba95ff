//! Startup sweep of a tenant root.
//!
//! Walks the subscribed tenant's subtree and reports every directory and
//! regular file so the worker can record them as local changes. Runs once
//! per tenant when the daemon starts; ongoing changes arrive from the
//! filesystem watcher collaborator instead.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use iroh_metrics::inc;
use tracing::debug;
use walkdir::WalkDir;

use crate::metrics::Metrics;

/// One entry found by the sweep. Parents always precede their children.
#[derive(Debug)]
pub struct SweepEntry {
    pub path: PathBuf,
}

/// Walk `root` and collect every directory and regular file under it.
///
/// The root itself is not reported; it exists by configuration. Symlinks
/// and special files are counted and skipped.
pub fn scan(root: &Path) -> Result<Vec<SweepEntry>> {
    if !root.is_dir() {
        bail!("tenant root {} is not a directory", root.display());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("sweeping {}", root.display()))?;
        if entry.path() == root {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            inc!(Metrics, sweep_folders);
        } else if file_type.is_file() {
            inc!(Metrics, sweep_files);
        } else {
            inc!(Metrics, sweep_ignored);
            debug!(path = %entry.path().display(), "sweep ignoring special file");
            continue;
        }
        entries.push(SweepEntry {
            path: entry.path().to_owned(),
        });
    }
    Ok(entries)
}
