//! Archive containers
//!
//! An archive is a flat set of named files: the manifest plus the record
//! files it lists. [`DirectoryArchive`] keeps them as plain files;
//! [`TarZstWriter`] packs them into one `.tar.zst` file that only appears
//! under its final name once complete, and [`TarZstReader`] reads it back.

use crate::error::{TransferError, TransferResult};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};

/// Destination of an export
pub trait ArchiveSink {
    fn write_file(&mut self, name: &str, data: &[u8]) -> TransferResult<()>;

    /// Complete the archive; nothing written before is importable until this succeeds
    fn finish(&mut self) -> TransferResult<()>;
}

/// Source of an import
pub trait ArchiveSource {
    /// Open a file for reading; `MissingFile` when absent
    fn open_file(&self, name: &str) -> TransferResult<Box<dyn Read + '_>>;

    fn contains(&self, name: &str) -> bool;

    /// Whole file contents
    fn read_file(&self, name: &str) -> TransferResult<Vec<u8>> {
        let mut data = Vec::new();
        self.open_file(name)?.read_to_end(&mut data)?;
        Ok(data)
    }
}

fn check_file_name(name: &str) -> TransferResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(TransferError::archive(format!("invalid archive file name {:?}", name)));
    }
    Ok(())
}

/// Archive stored as plain files in one directory
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    /// Prepare an empty (or new) directory for writing
    pub fn create(root: &Path) -> TransferResult<Self> {
        if root.exists() {
            if fs::read_dir(root)?.next().is_some() {
                return Err(TransferError::archive(format!(
                    "export directory {:?} is not empty",
                    root
                )));
            }
        } else {
            fs::create_dir_all(root)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing directory for reading
    pub fn open(root: &Path) -> TransferResult<Self> {
        if !root.is_dir() {
            return Err(TransferError::archive(format!("{:?} is not a directory", root)));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArchiveSink for DirectoryArchive {
    fn write_file(&mut self, name: &str, data: &[u8]) -> TransferResult<()> {
        check_file_name(name)?;
        let mut file = BufWriter::new(File::create(self.root.join(name))?);
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> TransferResult<()> {
        Ok(())
    }
}

impl ArchiveSource for DirectoryArchive {
    fn open_file(&self, name: &str) -> TransferResult<Box<dyn Read + '_>> {
        check_file_name(name)?;
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(TransferError::missing_file(name));
        }
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn contains(&self, name: &str) -> bool {
        check_file_name(name).is_ok() && self.root.join(name).is_file()
    }
}

/// Default zstd level for single-file archives
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Writer for single-file `.tar.zst` archives
///
/// Entries stream into `<path>.tmp`; `finish` renames it into place. A writer
/// dropped before `finish` removes its temporary file.
pub struct TarZstWriter {
    path: PathBuf,
    temp_path: PathBuf,
    builder: Option<Builder<zstd::Encoder<'static, BufWriter<File>>>>,
}

impl TarZstWriter {
    pub fn create(path: &Path, compression_level: i32) -> TransferResult<Self> {
        if path.exists() {
            return Err(TransferError::archive(format!("{:?} already exists", path)));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), compression_level)
            .map_err(|e| TransferError::compression(format!("zstd encoder: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            builder: Some(Builder::new(encoder)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveSink for TarZstWriter {
    fn write_file(&mut self, name: &str, data: &[u8]) -> TransferResult<()> {
        check_file_name(name)?;
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| TransferError::archive("archive already finished"))?;

        let mut header = Header::new_gnu();
        header
            .set_path(name)
            .map_err(|e| TransferError::archive(format!("set path '{}': {}", name, e)))?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append(&header, data)
            .map_err(|e| TransferError::archive(format!("append '{}': {}", name, e)))?;
        Ok(())
    }

    fn finish(&mut self) -> TransferResult<()> {
        let builder = self
            .builder
            .take()
            .ok_or_else(|| TransferError::archive("archive already finished"))?;
        let result = seal(builder, &self.temp_path, &self.path);
        if result.is_err() {
            let _ = fs::remove_file(&self.temp_path);
        }
        result
    }
}

// Flush the tar and zstd trailers, then move the archive into place.
fn seal(
    builder: Builder<zstd::Encoder<'static, BufWriter<File>>>,
    temp_path: &Path,
    path: &Path,
) -> TransferResult<()> {
    let encoder = builder
        .into_inner()
        .map_err(|e| TransferError::archive(format!("tar finish: {}", e)))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| TransferError::compression(format!("zstd finish: {}", e)))?;
    writer.flush()?;
    drop(writer);
    fs::rename(temp_path, path)?;
    Ok(())
}

impl Drop for TarZstWriter {
    fn drop(&mut self) {
        if self.builder.is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Reader for single-file `.tar.zst` archives
///
/// Opening only indexes the entry names. Each `open_file` decompresses the
/// stream again up to the requested entry and buffers that entry alone, so
/// memory is bounded by the largest file in the archive.
pub struct TarZstReader {
    path: PathBuf,
    names: BTreeSet<String>,
}

impl TarZstReader {
    pub fn open(path: &Path) -> TransferResult<Self> {
        let mut names = BTreeSet::new();
        let mut archive = open_tar(path)?;
        for entry in archive
            .entries()
            .map_err(|e| TransferError::archive(e.to_string()))?
        {
            let entry = entry.map_err(|e| TransferError::archive(e.to_string()))?;
            names.insert(entry_name(&entry)?);
        }
        Ok(Self {
            path: path.to_path_buf(),
            names,
        })
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

fn open_tar(path: &Path) -> TransferResult<Archive<zstd::Decoder<'static, BufReader<File>>>> {
    let file = File::open(path)?;
    let decoder = zstd::Decoder::new(file)
        .map_err(|e| TransferError::compression(format!("zstd decode: {}", e)))?;
    Ok(Archive::new(decoder))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> TransferResult<String> {
    Ok(entry
        .path()
        .map_err(|e| TransferError::archive(e.to_string()))?
        .to_string_lossy()
        .to_string())
}

impl ArchiveSource for TarZstReader {
    fn open_file(&self, name: &str) -> TransferResult<Box<dyn Read + '_>> {
        if !self.names.contains(name) {
            return Err(TransferError::missing_file(name));
        }
        let mut archive = open_tar(&self.path)?;
        for entry in archive
            .entries()
            .map_err(|e| TransferError::archive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| TransferError::archive(e.to_string()))?;
            if entry_name(&entry)? != name {
                continue;
            }
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| TransferError::archive(format!("read {}: {}", name, e)))?;
            return Ok(Box::new(Cursor::new(data)));
        }
        Err(TransferError::archive(format!(
            "{} vanished from {:?}",
            name, self.path
        )))
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_archive() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("export");
        let mut sink = DirectoryArchive::create(&root).unwrap();
        sink.write_file("a.bin", b"alpha").unwrap();
        sink.finish().unwrap();

        assert!(DirectoryArchive::create(&root).is_err());

        let source = DirectoryArchive::open(&root).unwrap();
        assert_eq!(source.read_file("a.bin").unwrap(), b"alpha");
        assert!(matches!(
            source.read_file("b.bin"),
            Err(TransferError::MissingFile(_))
        ));
        assert!(source.read_file("../escape").is_err());
    }

    #[test]
    fn test_tar_zst_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.tar.zst");
        let mut sink = TarZstWriter::create(&path, DEFAULT_COMPRESSION_LEVEL).unwrap();
        sink.write_file("one.bin", b"1").unwrap();
        sink.write_file("two.bin", &[7u8; 4096]).unwrap();
        assert!(!path.exists());
        sink.finish().unwrap();
        assert!(path.exists());

        let source = TarZstReader::open(&path).unwrap();
        assert!(source.contains("one.bin"));
        assert_eq!(source.read_file("two.bin").unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn test_unfinished_tar_zst_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.tar.zst");
        {
            let mut sink = TarZstWriter::create(&path, DEFAULT_COMPRESSION_LEVEL).unwrap();
            sink.write_file("one.bin", b"1").unwrap();
        }
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_tar_zst_reader_indexes_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.tar.zst");
        let mut sink = TarZstWriter::create(&path, DEFAULT_COMPRESSION_LEVEL).unwrap();
        sink.write_file("b.bin", b"bee").unwrap();
        sink.write_file("a.bin", b"ay").unwrap();
        sink.finish().unwrap();

        let source = TarZstReader::open(&path).unwrap();
        assert_eq!(source.file_names().collect::<Vec<_>>(), vec!["a.bin", "b.bin"]);
        // Every open reads the entry afresh.
        assert_eq!(source.read_file("a.bin").unwrap(), b"ay");
        assert_eq!(source.read_file("a.bin").unwrap(), b"ay");
        assert_eq!(source.read_file("b.bin").unwrap(), b"bee");
        assert!(matches!(
            source.read_file("c.bin"),
            Err(TransferError::MissingFile(_))
        ));
    }

    #[test]
    fn test_failed_finish_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.tar.zst");
        let mut sink = TarZstWriter::create(&path, DEFAULT_COMPRESSION_LEVEL).unwrap();
        sink.write_file("one.bin", b"1").unwrap();

        // A non-empty directory at the destination makes the rename fail.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        assert!(sink.finish().is_err());
        assert!(!path.with_extension("tmp").exists());
        drop(sink);
        assert!(path.join("occupied").exists());
    }
}
