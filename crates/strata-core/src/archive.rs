//! In-memory zip packaging for the archive-import channel.
//!
//! Every archive has a single top-level directory named after the import,
//! which is the layout the remote import expects.

use std::io::{Cursor, Write};
use std::path::Path;

use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use crate::error::{Error, Result};

/// Accumulates named entries into an in-memory zip archive.
pub struct ArchiveBuilder {
    root: String,
    writer: zip::ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
}

impl ArchiveBuilder {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            writer: zip::ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated),
        }
    }

    /// Add a file at `relative` (forward-slash separated) below the root.
    pub fn add_file(&mut self, relative: &str, contents: &[u8]) -> Result<()> {
        let name = format!("{}/{}", self.root, relative.trim_start_matches('/'));
        self.writer.start_file(name, self.options)?;
        self.writer.write_all(contents).map_err(ZipError::from)?;
        Ok(())
    }

    /// Add every file below `dir`, preserving relative paths.
    pub fn add_dir(&mut self, dir: &Path) -> Result<()> {
        self.add_dir_recursive(dir, "")
    }

    fn add_dir_recursive(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .map_err(|e| Error::io(dir, e))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::io(dir, e))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
            if file_type.is_dir() {
                self.add_dir_recursive(&path, &relative)?;
            } else if file_type.is_file() {
                let contents = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
                self.add_file(&relative, &contents)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        Ok(self.writer.finish()?.into_inner())
    }
}

/// Package a fixed set of text documents.
pub fn from_documents(root: &str, documents: &[(&str, String)]) -> Result<Vec<u8>> {
    let mut builder = ArchiveBuilder::new(root);
    for (name, contents) in documents {
        builder.add_file(name, contents.as_bytes())?;
    }
    builder.finish()
}

/// Package a local directory under `root`.
pub fn from_dir(root: &str, dir: &Path) -> Result<Vec<u8>> {
    let mut builder = ArchiveBuilder::new(root);
    builder.add_dir(dir)?;
    builder.finish()
}

/// List entry names of an archive, in archive order.
pub fn entry_names(data: &[u8]) -> std::result::Result<Vec<String>, ZipError> {
    let archive = zip::ZipArchive::new(Cursor::new(data))?;
    Ok(archive.file_names().map(str::to_string).collect())
}
