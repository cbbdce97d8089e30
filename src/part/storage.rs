//! Storage seam for part directories.
//!
//! The merge engine only needs a narrow contract out of part storage: create
//! the output directory transactionally, stream files in and out, and rename
//! index artifacts in from source parts. Everything else about the layout is
//! owned by the reader/writer pair.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::Level;

use super::PartError;
use crate::logging::merge_log;

/// Readable, seekable part file stream.
pub trait PartFileRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> PartFileRead for T {}

/// Contract the merge engine requires from a part directory.
pub trait PartStorage: Send + Sync {
    /// Absolute directory of the part.
    fn path(&self) -> &Path;

    fn exists(&self) -> bool;

    /// Creates the directory; pairs with [`PartStorage::precommit`].
    fn begin_transaction(&self) -> Result<(), PartError>;

    /// Makes the written part durable enough to hand to the caller.
    fn precommit(&self) -> Result<(), PartError>;

    fn write_file(&self, name: &str) -> Result<Box<dyn Write + Send>, PartError>;

    fn read_file(&self, name: &str) -> Result<Box<dyn PartFileRead>, PartError>;

    fn file_size(&self, name: &str) -> Result<u64, PartError>;

    fn list_files(&self) -> Result<Vec<String>, PartError>;

    fn remove_file(&self, name: &str) -> Result<(), PartError>;

    /// Moves a file in from another part directory.
    fn adopt_file(&self, src_dir: &Path, src_name: &str, dst_name: &str) -> Result<(), PartError>;

    fn sync_file(&self, name: &str) -> Result<(), PartError>;

    /// Storage handle for a projection sub-part directory.
    fn projection(&self, dir_name: &str) -> Arc<dyn PartStorage>;

    /// Whether several column streams may be finalized concurrently.
    fn supports_parallel_write(&self) -> bool {
        false
    }
}

/// Local-disk part storage over `std::fs`.
#[derive(Debug, Clone)]
pub struct LocalPartStorage {
    dir: PathBuf,
}

impl LocalPartStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PartStorage for LocalPartStorage {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn exists(&self) -> bool {
        self.dir.exists()
    }

    fn begin_transaction(&self) -> Result<(), PartError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn precommit(&self) -> Result<(), PartError> {
        // Directory fsync pins the rename-visible state on local disks.
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        merge_log!(
            Level::Debug,
            "part_precommit",
            "dir={}",
            self.dir.display()
        );
        Ok(())
    }

    fn write_file(&self, name: &str) -> Result<Box<dyn Write + Send>, PartError> {
        let file = File::create(self.dir.join(name))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn read_file(&self, name: &str) -> Result<Box<dyn PartFileRead>, PartError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(PartError::MissingFile(name.to_string()));
        }
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn file_size(&self, name: &str) -> Result<u64, PartError> {
        Ok(fs::metadata(self.dir.join(name))?.len())
    }

    fn list_files(&self) -> Result<Vec<String>, PartError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_file(&self, name: &str) -> Result<(), PartError> {
        fs::remove_file(self.dir.join(name))?;
        Ok(())
    }

    fn adopt_file(&self, src_dir: &Path, src_name: &str, dst_name: &str) -> Result<(), PartError> {
        let src = src_dir.join(src_name);
        let dst = self.dir.join(dst_name);
        if fs::rename(&src, &dst).is_err() {
            // Cross-device fallback.
            fs::copy(&src, &dst)?;
            fs::remove_file(&src)?;
        }
        Ok(())
    }

    fn sync_file(&self, name: &str) -> Result<(), PartError> {
        File::open(self.dir.join(name))?.sync_all()?;
        Ok(())
    }

    fn projection(&self, dir_name: &str) -> Arc<dyn PartStorage> {
        Arc::new(LocalPartStorage::new(self.dir.join(dir_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_list_read() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalPartStorage::new(tmp.path().join("all_1_1_0"));
        assert!(!storage.exists());
        storage.begin_transaction().unwrap();
        assert!(storage.exists());

        {
            let mut writer = storage.write_file("count.txt").unwrap();
            writer.write_all(b"42").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(storage.file_size("count.txt").unwrap(), 2);
        assert_eq!(storage.list_files().unwrap(), vec!["count.txt".to_string()]);

        let mut contents = String::new();
        storage
            .read_file("count.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "42");
        storage.precommit().unwrap();
    }

    #[test]
    fn adopt_file_moves_across_parts() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("all_1_1_0");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("ann-data.vidx"), b"index").unwrap();

        let storage = LocalPartStorage::new(tmp.path().join("all_1_2_1"));
        storage.begin_transaction().unwrap();
        storage
            .adopt_file(&old, "ann-data.vidx", "merged-0-all_1_1_0-ann-data.vidx")
            .unwrap();
        assert!(!old.join("ann-data.vidx").exists());
        assert_eq!(
            storage.file_size("merged-0-all_1_1_0-ann-data.vidx").unwrap(),
            5
        );
    }
}
