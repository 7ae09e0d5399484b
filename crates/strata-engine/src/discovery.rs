use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::DiscoveryError;

const DOCUMENT_EXTENSIONS: [&str; 3] = ["yml", "yaml", "json"];

/// Resolve a configuration source into the documents it contains.
///
/// A file is returned as-is. A directory is walked recursively for `*.yml`,
/// `*.yaml` and `*.json` files, returned in sorted order.
///
/// # Errors
///
/// Returns an error if `source` does not exist, directory walking fails, a
/// path cannot be canonicalized, or a directory holds no documents.
pub fn discover_documents(source: &Path) -> std::result::Result<Vec<PathBuf>, DiscoveryError> {
    if !source.exists() {
        return Err(DiscoveryError::SourceDoesNotExist {
            path: source.to_path_buf(),
        });
    }
    if source.is_file() {
        return Ok(vec![canonicalize(source)?]);
    }

    let mut documents = Vec::new();

    for entry in WalkDir::new(source) {
        let entry = match entry {
            Ok(value) => value,
            Err(source) => return Err(DiscoveryError::Walk { source }),
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(extension) = entry.path().extension().and_then(|value| value.to_str()) else {
            continue;
        };

        if !DOCUMENT_EXTENSIONS.contains(&extension) {
            continue;
        }

        documents.push(canonicalize(entry.path())?);
    }

    if documents.is_empty() {
        return Err(DiscoveryError::NoDocuments {
            path: source.to_path_buf(),
        });
    }

    documents.sort();
    Ok(documents)
}

fn canonicalize(path: &Path) -> std::result::Result<PathBuf, DiscoveryError> {
    fs::canonicalize(path).map_err(|source| DiscoveryError::CanonicalizePath {
        path: path.to_path_buf(),
        source,
    })
}
