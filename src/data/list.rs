//! File-list parsing.
//!
//! One sample per line: `image_path [landmark_path] [domain]`. Blank lines and
//! lines starting with `#` are ignored; relative paths resolve against the
//! list file's directory.

use crate::error::DataError;
use std::fs;
use std::path::{Path, PathBuf};

/// Extensions tried, in order, when a line carries no landmark path
const SIDECAR_EXTENSIONS: [&str; 2] = ["pts", "txt"];

#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub image: PathBuf,
    pub landmarks: PathBuf,
    pub domain: u32,
}

/// Find the landmark annotation stored next to an image
pub fn sidecar_landmarks(image: &Path) -> Option<PathBuf> {
    SIDECAR_EXTENSIONS
        .iter()
        .map(|ext| image.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

/// Read and validate a file list
pub fn read_list(path: &Path) -> Result<Vec<ListEntry>, DataError> {
    let text = fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_list(&text, base, path)
}

fn parse_list(text: &str, base: &Path, origin: &Path) -> Result<Vec<ListEntry>, DataError> {
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = |reason: String| DataError::MalformedLine {
            path: origin.to_path_buf(),
            line: idx + 1,
            reason,
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (image, landmarks, domain) = match fields.as_slice() {
            [image] => (*image, None, None),
            // A lone integer after the image is a domain label, anything else a path
            [image, second] => match second.parse::<u32>() {
                Ok(domain) => (*image, None, Some(domain)),
                Err(_) => (*image, Some(*second), None),
            },
            [image, landmarks, domain] => {
                let domain = domain
                    .parse::<u32>()
                    .map_err(|_| malformed(format!("domain '{}' is not an integer", domain)))?;
                (*image, Some(*landmarks), Some(domain))
            }
            _ => return Err(malformed(format!("expected 1 to 3 fields, found {}", fields.len()))),
        };

        let image = base.join(image);
        let landmarks = match landmarks {
            Some(p) => base.join(p),
            None => sidecar_landmarks(&image).ok_or_else(|| DataError::MissingLandmarks(image.clone()))?,
        };

        entries.push(ListEntry {
            image,
            landmarks,
            domain: domain.unwrap_or(0),
        });
    }

    if entries.is_empty() {
        return Err(DataError::EmptyList(origin.to_path_buf()));
    }
    Ok(entries)
}
