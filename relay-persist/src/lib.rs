//! A single logical mapping persisted as one file, written atomically
//! (write-to-temp, rename, keep one prior generation as `.old`), with dotted-
//! path access for nested reads and writes (§4.C).

mod error;
mod path;

pub use error::PersistError;
use path::Segment;
use relay_wire::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// In-memory mirror of the persisted mapping. Mutations are staged here and
/// only become durable on an explicit [`Persist::save`], matching the core's
/// "modifications are staged in the in-memory persist object and become
/// durable only on commit()" contract (§4.E.1).
#[derive(Debug, Clone)]
pub struct Persist {
    root: BTreeMap<String, Value>,
}

impl Default for Persist {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Loads a persist file, falling back to `<path>.old` if the primary is
    /// absent, empty, or unparseable (§4.C, §4.E.5). Returns an error only
    /// when neither file is usable, which the caller (the binary's startup
    /// path) treats as fatal (§7: "a corrupt persist file with no usable
    /// backup" is one of the two fatal conditions).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        if let Some(root) = Self::try_read(path)? {
            return Ok(Self { root });
        }
        let backup = backup_path(path);
        if let Some(root) = Self::try_read(&backup)? {
            tracing::warn!(path = %path.display(), "recovered persist state from .old backup");
            return Ok(Self { root });
        }
        Err(PersistError::NoUsableBackup {
            path: path.to_path_buf(),
        })
    }

    fn try_read(path: &Path) -> Result<Option<BTreeMap<String, Value>>, PersistError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        match relay_wire::decode(&bytes) {
            Ok(Value::Map(map)) => Ok(Some(map)),
            _ => Ok(None),
        }
    }

    /// Atomically persists the current state to `path`: write to `<path>.tmp`,
    /// rename any existing `<path>` to `<path>.old`, then rename the temp
    /// file into place. A crash between the two renames is detected on the
    /// next `load` by the primary being absent/empty, which falls back to
    /// `.old` (§4.E.5).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let path = path.as_ref();
        let encoded = relay_wire::encode(&Value::Map(self.root.clone()));
        let tmp_path = tmp_path(path);
        let io = |source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        {
            let mut tmp = std::fs::File::create(&tmp_path).map_err(io)?;
            tmp.write_all(&encoded).map_err(io)?;
            tmp.sync_all().map_err(io)?;
        }
        if path.exists() {
            std::fs::rename(path, backup_path(path)).map_err(io)?;
        }
        std::fs::rename(&tmp_path, path).map_err(io)?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments = path::parse(path);
        let (first, rest) = segments.split_first()?;
        let Segment::Key(key) = first else {
            return None;
        };
        let mut current = self.root.get(key)?;
        for segment in rest {
            current = step(current, segment)?;
        }
        Some(current)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sets a value at a dotted path, creating intermediate maps as needed.
    /// Intermediate list indices must already exist (lists are not
    /// auto-extended, matching the narrow use this module actually needs:
    /// writing at an existing list slot or appending via [`Persist::append`]).
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), PersistError> {
        let segments = path::parse(path);
        let (first, rest) = segments
            .split_first()
            .expect("path must have at least one segment");
        let Segment::Key(root_key) = first else {
            return Err(PersistError::NotAMap);
        };
        if rest.is_empty() {
            self.root.insert(root_key.clone(), value);
            return Ok(());
        }
        let entry = self
            .root
            .entry(root_key.clone())
            .or_insert_with(Value::map);
        set_step(entry, rest, value)
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments = path::parse(path);
        if segments.len() == 1 {
            let Segment::Key(key) = &segments[0] else {
                return None;
            };
            return self.root.remove(key);
        }
        let (last, init) = segments.split_last()?;
        let (first, rest) = init.split_first()?;
        let Segment::Key(key) = first else {
            return None;
        };
        let mut current = self.root.get_mut(key)?;
        for segment in rest {
            current = step_mut(current, segment)?;
        }
        match (current, last) {
            (Value::Map(m), Segment::Key(k)) => m.remove(k),
            (Value::List(l), Segment::Index(i)) if *i < l.len() => Some(l.remove(*i)),
            _ => None,
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.root
    }
}

fn step<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (value, segment) {
        (Value::Map(m), Segment::Key(k)) => m.get(k),
        (Value::List(l), Segment::Index(i)) => l.get(*i),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    match (value, segment) {
        (Value::Map(m), Segment::Key(k)) => m.get_mut(k),
        (Value::List(l), Segment::Index(i)) => l.get_mut(*i),
        _ => None,
    }
}

fn set_step(current: &mut Value, rest: &[Segment], value: Value) -> Result<(), PersistError> {
    let (segment, tail) = rest.split_first().expect("non-empty by construction");
    if tail.is_empty() {
        return match (current, segment) {
            (Value::Map(m), Segment::Key(k)) => {
                m.insert(k.clone(), value);
                Ok(())
            }
            (Value::List(l), Segment::Index(i)) => {
                if *i < l.len() {
                    l[*i] = value;
                    Ok(())
                } else if *i == l.len() {
                    l.push(value);
                    Ok(())
                } else {
                    Err(PersistError::IndexOutOfBounds(*i))
                }
            }
            (Value::Map(_), Segment::Index(_)) => Err(PersistError::NotAList),
            (Value::List(_), Segment::Key(_)) => Err(PersistError::NotAMap),
            _ => Err(PersistError::NotAMap),
        };
    }
    match (current, segment) {
        (Value::Map(m), Segment::Key(k)) => {
            let entry = m.entry(k.clone()).or_insert_with(Value::map);
            set_step(entry, tail, value)
        }
        (Value::List(l), Segment::Index(i)) => {
            let entry = l.get_mut(*i).ok_or(PersistError::IndexOutOfBounds(*i))?;
            set_step(entry, tail, value)
        }
        _ => Err(PersistError::NotAMap),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".old");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_and_get_nested_path() {
        let mut p = Persist::new();
        p.set("a.b", Value::Int(1)).unwrap();
        assert_eq!(p.get("a.b"), Some(&Value::Int(1)));
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut p = Persist::new();
        p.set("a.b.c", Value::Text("x".into())).unwrap();
        assert_eq!(p.get("a.b.c"), Some(&Value::Text("x".into())));
        assert!(p.get("a.b").unwrap().as_map().is_some());
    }

    #[test]
    fn list_index_access() {
        let mut p = Persist::new();
        p.set(
            "a",
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )
        .unwrap();
        assert_eq!(p.get("a[1]"), Some(&Value::Int(2)));
        p.set("a[1]", Value::Int(42)).unwrap();
        assert_eq!(p.get("a[1]"), Some(&Value::Int(42)));
    }

    #[test]
    fn remove_drops_key() {
        let mut p = Persist::new();
        p.set("a.b", Value::Int(1)).unwrap();
        assert!(p.remove("a.b").is_some());
        assert_eq!(p.get("a.b"), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let mut p = Persist::new();
        p.set("server.sequence", Value::Int(7)).unwrap();
        p.save(&path).unwrap();

        let loaded = Persist::load(&path).unwrap();
        assert_eq!(loaded.get("server.sequence"), Some(&Value::Int(7)));
    }

    #[test]
    fn save_keeps_previous_generation_as_old() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let mut p = Persist::new();
        p.set("x", Value::Int(1)).unwrap();
        p.save(&path).unwrap();
        p.set("x", Value::Int(2)).unwrap();
        p.save(&path).unwrap();

        assert!(backup_path(&path).exists());
        let backup = Persist::load(&backup_path(&path)).unwrap();
        assert_eq!(backup.get("x"), Some(&Value::Int(1)));
        let current = Persist::load(&path).unwrap();
        assert_eq!(current.get("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn load_falls_back_to_old_when_primary_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let mut p = Persist::new();
        p.set("x", Value::Int(9)).unwrap();
        p.save(&path).unwrap();
        // A second save rotates the good copy into .old; corrupt the primary
        // in place to simulate a crash mid-write.
        p.set("x", Value::Int(10)).unwrap();
        p.save(&path).unwrap();
        std::fs::write(&path, b"").unwrap();

        let loaded = Persist::load(&path).unwrap();
        assert_eq!(loaded.get("x"), Some(&Value::Int(9)));
    }

    #[test]
    fn load_errors_when_nothing_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(Persist::load(&path).is_err());
    }
}
