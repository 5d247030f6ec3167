//! Repository discovery: enumerate, filter, and prioritize source files.
//!
//! Filters apply in order: `.gitignore` semantics at every directory level,
//! binary rejection (NUL byte in the first 8 KiB), size ceiling, and
//! language exclusion (unknown language unless the name is in the config
//! table).

use crate::language_detector::{Language, LanguageDetector};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Priority classes; smaller value means processed earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    EntryPoint = 1,
    ExportApi = 2,
    RootFile = 3,
    Regular = 4,
}

impl FilePriority {
    pub fn value(&self) -> u32 {
        *self as u32
    }
}

/// A discovered file ready for the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub language: Language,
    pub priority: FilePriority,
    /// Set when the name matched the config table.
    pub config_type: Option<String>,
}

/// Walks a project root and produces the filtered, prioritized file set.
pub struct FileWalker {
    detector: Arc<LanguageDetector>,
    max_file_bytes: u64,
}

impl FileWalker {
    pub fn new(detector: Arc<LanguageDetector>, max_file_bytes: u64) -> Self {
        Self {
            detector,
            max_file_bytes,
        }
    }

    /// Enumerate the repository under `root`.
    ///
    /// The result is sorted by `(priority, size, path)` so single-worker
    /// runs are fully deterministic.
    pub fn discover(&self, root: &Path) -> Vec<FileDescriptor> {
        let mut files = Vec::new();

        let walk = WalkBuilder::new(root)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .hidden(true)
            .build();

        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let path = entry.path();
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };

            if size > self.max_file_bytes {
                debug!("Skipping oversized file {:?} ({} bytes)", path, size);
                continue;
            }

            let config_type = self.detector.config_type(path);
            let language = self.detector.detect(path);
            if language == Language::Unknown && config_type.is_none() {
                continue;
            }

            if looks_binary(path) {
                debug!("Skipping binary file {:?}", path);
                continue;
            }

            let priority = classify_priority(path, root, language);
            files.push(FileDescriptor {
                path: path.to_path_buf(),
                size,
                language,
                priority,
                config_type: config_type.map(str::to_string),
            });
        }

        files.sort_by(|a, b| {
            (a.priority, a.size, &a.path).cmp(&(b.priority, b.size, &b.path))
        });
        files
    }
}

/// NUL byte within the first 8 KiB marks a file as binary.
fn looks_binary(path: &Path) -> bool {
    let mut head = [0u8; BINARY_SNIFF_BYTES];
    let Ok(mut file) = File::open(path) else {
        return true;
    };
    let Ok(n) = file.read(&mut head) else {
        return true;
    };
    head[..n].contains(&0)
}

/// Classify a file into its priority class.
pub fn classify_priority(path: &Path, root: &Path, language: Language) -> FilePriority {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    if is_entry_point(file_name, stem, path, language) {
        return FilePriority::EntryPoint;
    }
    if is_export_api(file_name) {
        return FilePriority::ExportApi;
    }
    if path.parent() == Some(root) {
        return FilePriority::RootFile;
    }
    FilePriority::Regular
}

fn is_entry_point(file_name: &str, stem: &str, path: &Path, _language: Language) -> bool {
    if matches!(
        file_name,
        "__init__.py" | "index.js" | "index.ts" | "mod.rs"
    ) || stem == "main"
    {
        return true;
    }
    // A file named after its enclosing directory is an idiomatic entry.
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|dir| dir == stem)
        .unwrap_or(false)
}

fn is_export_api(file_name: &str) -> bool {
    if file_name.ends_with(".d.ts") {
        return true;
    }
    let lower = file_name.to_ascii_lowercase();
    if lower.contains("api") {
        return true;
    }
    matches!(
        file_name,
        "export.js" | "export.ts" | "exports.js" | "exports.ts"
    ) || file_name.starts_with("public.")
}
