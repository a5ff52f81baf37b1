//! The on-disk pending-message queue: a two-level directory tree of files
//! named `<seq>[_<flags>]`, grounded on `landscape/client/broker/store.py`'s
//! `_get_next_message_filename` / `_walk_messages` / `_set_flags` family.

use crate::error::StoreError;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

pub const HELD: char = 'h';
pub const BROKEN: char = 'b';

pub struct Queue {
    root: PathBuf,
    directory_size: usize,
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Queue {
    pub fn new(root: PathBuf, directory_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            directory_size,
        })
    }

    /// Numeric-sorted subdirectory names (`"0"`, `"1"`, …), ignoring
    /// anything that doesn't parse as a non-negative integer.
    fn sorted_dir_names(&self) -> Result<Vec<String>, StoreError> {
        self.sorted_names(&self.root, true)
    }

    /// Numeric-sorted file names within a subdirectory, by the integer
    /// prefix before any `_<flags>` suffix, excluding `.tmp` scratch files.
    fn sorted_file_names(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.sorted_names(&self.root.join(dir), false)
    }

    fn sorted_names(&self, dir: &Path, dirs_only: bool) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let file_type = entry.file_type().map_err(|e| io_err(dir, e))?;
            if dirs_only != file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !dirs_only && name.ends_with(".tmp") {
                continue;
            }
            let prefix = name.split('_').next().unwrap_or("");
            if prefix.parse::<u64>().is_ok() {
                names.push(name);
            }
        }
        names.sort_by_key(|n| n.split('_').next().unwrap().parse::<u64>().unwrap());
        Ok(names)
    }

    /// Picks the path for the next message to be written, creating a new
    /// numbered subdirectory once the current tail one reaches
    /// `directory_size`.
    fn next_message_path(&self) -> Result<PathBuf, StoreError> {
        let dirs = self.sorted_dir_names()?;
        let tail_dir = match dirs.last() {
            Some(d) => d.clone(),
            None => {
                let first = self.root.join("0");
                std::fs::create_dir_all(&first).map_err(|e| io_err(&first, e))?;
                "0".to_string()
            }
        };
        let files = self.sorted_file_names(&tail_dir)?;
        if files.is_empty() {
            return Ok(self.root.join(&tail_dir).join("0"));
        }
        if files.len() < self.directory_size {
            let last_seq: u64 = files
                .last()
                .unwrap()
                .split('_')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            return Ok(self.root.join(&tail_dir).join((last_seq + 1).to_string()));
        }
        let next_dir = (tail_dir.parse::<u64>().unwrap() + 1).to_string();
        let next_dir_path = self.root.join(&next_dir);
        std::fs::create_dir_all(&next_dir_path).map_err(|e| io_err(&next_dir_path, e))?;
        Ok(next_dir_path.join("0"))
    }

    /// Writes `data` to a newly allocated pending-message file via
    /// temp+rename and returns its path.
    pub fn write_new(&self, data: &[u8]) -> Result<PathBuf, StoreError> {
        let target = self.next_message_path()?;
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &target).map_err(|e| io_err(&target, e))?;
        Ok(target)
    }

    /// All message paths in canonical queue order (directory ascending,
    /// then numeric filename ascending), optionally skipping files whose
    /// flag set intersects `exclude`.
    pub fn walk(&self, exclude: &str) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = Vec::new();
        for dir in self.sorted_dir_names()? {
            for file in self.sorted_file_names(&dir)? {
                let flags = flags_of(&file);
                if exclude.chars().any(|c| flags.contains(c)) {
                    continue;
                }
                paths.push(self.root.join(&dir).join(&file));
            }
        }
        Ok(paths)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        std::fs::read(path).map_err(|e| io_err(path, e))
    }

    pub fn inode(&self, path: &Path) -> Result<u64, StoreError> {
        std::fs::metadata(path)
            .map(|m| m.ino())
            .map_err(|e| io_err(path, e))
    }

    /// Renames `path` to carry exactly `flags` (sorted, deduplicated),
    /// returning the new path.
    pub fn set_flags(&self, path: &Path, flags: &str) -> Result<PathBuf, StoreError> {
        let dir = path.parent().unwrap_or(Path::new(""));
        let base = path.file_name().unwrap().to_string_lossy();
        let seq = base.split('_').next().unwrap();
        let mut chars: Vec<char> = flags.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        let new_name = if chars.is_empty() {
            seq.to_string()
        } else {
            format!("{}_{}", seq, chars.iter().collect::<String>())
        };
        let new_path = dir.join(new_name);
        if new_path != path {
            std::fs::rename(path, &new_path).map_err(|e| io_err(path, e))?;
        }
        Ok(new_path)
    }

    pub fn add_flag(&self, path: &Path, flag: char) -> Result<PathBuf, StoreError> {
        let mut flags = flags_of_path(path);
        flags.push(flag);
        self.set_flags(path, &flags)
    }

    pub fn unlink(&self, path: &Path) -> Result<(), StoreError> {
        std::fs::remove_file(path).map_err(|e| io_err(path, e))?;
        if let Some(dir) = path.parent() {
            if std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(dir);
            }
        }
        Ok(())
    }

    pub fn unlink_all(&self) -> Result<(), StoreError> {
        for path in self.walk("")? {
            self.unlink(&path)?;
        }
        Ok(())
    }
}

fn flags_of(filename: &str) -> String {
    filename
        .split_once('_')
        .map(|(_, flags)| flags.to_string())
        .unwrap_or_default()
}

fn flags_of_path(path: &Path) -> String {
    path.file_name()
        .map(|n| flags_of(&n.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_allocate_increasing_sequence_within_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::new(dir.path().to_path_buf(), 1000).unwrap();
        let a = queue.write_new(b"A").unwrap();
        let b = queue.write_new(b"B").unwrap();
        assert_eq!(a.file_name().unwrap(), "0");
        assert_eq!(b.file_name().unwrap(), "1");
    }

    #[test]
    fn rolls_over_to_a_new_directory_once_full() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::new(dir.path().to_path_buf(), 2).unwrap();
        queue.write_new(b"A").unwrap();
        queue.write_new(b"B").unwrap();
        let third = queue.write_new(b"C").unwrap();
        assert_eq!(third.parent().unwrap().file_name().unwrap(), "1");
        assert_eq!(third.file_name().unwrap(), "0");
    }

    #[test]
    fn walk_respects_canonical_order_and_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::new(dir.path().to_path_buf(), 1000).unwrap();
        let a = queue.write_new(b"A").unwrap();
        let b = queue.write_new(b"B").unwrap();
        queue.set_flags(&a, "h").unwrap();
        let held_path = dir.path().join("0").join("0_h");
        assert!(held_path.exists());

        let visible = queue.walk("h").unwrap();
        assert_eq!(visible, vec![b]);
    }

    #[test]
    fn unlink_removes_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::new(dir.path().to_path_buf(), 1000).unwrap();
        let a = queue.write_new(b"A").unwrap();
        let subdir = a.parent().unwrap().to_path_buf();
        queue.unlink(&a).unwrap();
        assert!(!subdir.exists());
    }
}
