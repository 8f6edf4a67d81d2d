//! File reader: turns lookup paths into [`SourceDocument`]s.
//!
//! Explicit files are read as given and must have a supported extension.
//! Directories are walked (recursively when asked), skipping VCS and build
//! output plus anything unsupported, so pointing the assistant at a project
//! folder does not fail on the first binary it finds.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::extract;
use crate::models::SourceDocument;

/// Reads lookup paths into raw documents, in a deterministic order.
pub trait FileReader: Send + Sync {
    fn read(&self, paths: &[PathBuf], recursive: bool) -> Result<Vec<SourceDocument>>;
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "csv", "json", "toml", "yaml", "yml", "html", "htm", "xml",
    "log", "rs", "py", "js", "ts", "c", "cpp", "h", "java", "go", "sh",
];

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**", "**/.*"];

/// Filesystem reader for plain text, PDF, and Office documents.
pub struct DirectoryReader {
    excludes: GlobSet,
}

impl DirectoryReader {
    pub fn new() -> Result<Self> {
        Self::with_excludes(&[])
    }

    /// Build a reader that also skips paths matching `extra_excludes`
    /// while walking directories.
    pub fn with_excludes(extra_excludes: &[String]) -> Result<Self> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend_from_slice(extra_excludes);
        Ok(Self {
            excludes: build_globset(&patterns)?,
        })
    }

    fn read_dir(
        &self,
        root: &Path,
        recursive: bool,
        seen: &mut HashSet<PathBuf>,
    ) -> Result<Vec<SourceDocument>> {
        let walker = WalkDir::new(root)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .sort_by_file_name();

        let mut docs = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if self.excludes.is_match(relative) {
                continue;
            }
            if content_type_for(path).is_none() {
                tracing::debug!(path = %path.display(), "skipping unsupported file");
                continue;
            }
            if !seen.insert(canonical(path)) {
                continue;
            }
            docs.push(read_file(path)?);
        }
        Ok(docs)
    }
}

impl FileReader for DirectoryReader {
    fn read(&self, paths: &[PathBuf], recursive: bool) -> Result<Vec<SourceDocument>> {
        let mut docs = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("Lookup path is not readable: {}", path.display()))?;
            if meta.is_dir() {
                docs.extend(self.read_dir(path, recursive, &mut seen)?);
            } else if seen.insert(canonical(path)) {
                docs.push(read_file(path)?);
            }
        }
        Ok(docs)
    }
}

/// Identity of a file on disk, so overlapping lookup paths read it once.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Map a file extension to a content type, or `None` if unsupported.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(extract::MIME_PDF),
        "docx" => Some(extract::MIME_DOCX),
        "pptx" => Some(extract::MIME_PPTX),
        e if TEXT_EXTENSIONS.contains(&e) => Some("text/plain"),
        _ => None,
    }
}

fn read_file(path: &Path) -> Result<SourceDocument> {
    let Some(content_type) = content_type_for(path) else {
        bail!("Unsupported file type: {}", path.display());
    };

    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = if extract::is_extractable(content_type) {
        extract::extract_text(&bytes, content_type)
            .with_context(|| format!("Failed to extract text from {}", path.display()))?
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    let modified_at: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();

    Ok(SourceDocument {
        source_path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        content_type: content_type.to_string(),
        text,
        modified_at,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn reads_explicit_text_file() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "doc1.txt", "Paris is the capital of France.");
        let docs = DirectoryReader::new().unwrap().read(&[path.clone()], true).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_path, path);
        assert_eq!(docs[0].file_name, "doc1.txt");
        assert_eq!(docs[0].text, "Paris is the capital of France.");
    }

    #[test]
    fn explicit_unsupported_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), "blob.bin", "xx");
        let err = DirectoryReader::new().unwrap().read(&[path], true).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn missing_path_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.txt");
        assert!(DirectoryReader::new().unwrap().read(&[missing], true).is_err());
    }

    #[test]
    fn directory_walk_is_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.md", "beta");
        write(tmp.path(), "a.txt", "alpha");
        write(tmp.path(), "image.png", "not text");
        write(tmp.path(), ".hidden.txt", "secret");
        write(tmp.path(), "target/debug/out.txt", "build output");
        write(tmp.path(), "nested/c.txt", "gamma");

        let reader = DirectoryReader::new().unwrap();
        let docs = reader.read(&[tmp.path().to_path_buf()], true).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.md", "c.txt"]);

        let shallow = reader.read(&[tmp.path().to_path_buf()], false).unwrap();
        assert_eq!(shallow.len(), 2);
    }

    #[test]
    fn extra_excludes_apply_to_walks() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "keep.txt", "keep");
        write(tmp.path(), "drafts/skip.txt", "skip");
        let reader = DirectoryReader::with_excludes(&["drafts/**".to_string()]).unwrap();
        let docs = reader.read(&[tmp.path().to_path_buf()], true).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].file_name, "keep.txt");
    }

    #[test]
    fn overlapping_paths_read_each_file_once() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.txt", "alpha");
        write(tmp.path(), "b.txt", "beta");
        let reader = DirectoryReader::new().unwrap();

        let dir_first = reader.read(&[tmp.path().to_path_buf(), a.clone()], true).unwrap();
        let names: Vec<&str> = dir_first.iter().map(|d| d.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let file_first = reader.read(&[a.clone(), tmp.path().to_path_buf(), a], true).unwrap();
        let names: Vec<&str> = file_first.iter().map(|d| d.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
