//! Sample input file helpers for the virtual-live case.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::HarnessError;

/// Copy `src` into every directory of `dirs` that exists.
///
/// Directories that do not exist are skipped; the server may run from any of
/// them. Returns the paths written.
pub fn copy_to_dest(src: &Path, dirs: &[PathBuf]) -> Result<Vec<PathBuf>, HarnessError> {
    let name = file_name(src)?;
    let mut written = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "skipping missing upload dir");
            continue;
        }
        let dest = dir.join(name);
        std::fs::copy(src, &dest).map_err(|e| {
            HarnessError::io(format!("copy {} to {}", src.display(), dest.display()), e)
        })?;
        info!(src = %src.display(), dest = %dest.display(), "copied sample file");
        written.push(dest);
    }
    Ok(written)
}

/// First directory of `dirs` that holds a file named like `src`.
pub fn existing_file(src: &Path, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = src.file_name()?;
    dirs.iter().map(|d| d.join(name)).find(|p| p.is_file())
}

/// Path the server knows an uploaded file by.
///
/// Absolute uploads under `/data/upload/` are used as-is; anything found in
/// a checkout-relative directory is addressed as `upload/<name>`.
pub fn upload_path(found: &Path) -> String {
    let text = found.display().to_string();
    if text.starts_with("/data/upload/") {
        return text;
    }
    match found.file_name() {
        Some(name) => format!("upload/{}", name.to_string_lossy()),
        None => text,
    }
}

fn file_name(src: &Path) -> Result<&std::ffi::OsStr, HarnessError> {
    src.file_name().ok_or_else(|| {
        HarnessError::io(
            format!("{} has no file name", src.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })
}
