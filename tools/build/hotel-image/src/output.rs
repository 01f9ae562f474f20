// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{ImageError, Result};

/// Write `data` to a temporary file next to `path`, then rename it into
/// place. A failed run never leaves a partial output behind.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| ImageError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| ImageError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ImageError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| ImageError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new contents").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new contents");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("image.bin");
        let err = write_atomic(&path, b"x").unwrap_err();
        assert_eq!(err.exit_code(), 74);
    }
}
