//! Ordered, generational, filtered outbound message queue plus the server
//! cursor bookkeeping needed to recover from dropped responses (§4.E).
//!
//! Grounded on `landscape/client/broker/store.py`'s `MessageStore`: the file
//! layout, flag scheme, sequencing algorithm, and session-id bookkeeping are
//! carried over one-for-one; only the storage types (a `relay_wire::Value`
//! tree instead of Python dicts, a `relay_persist::Persist` instead of
//! `bpickle`-backed `Persist`) are idiomatic-Rust realizations.

mod error;
mod queue;
mod schema;
mod sequencing;
mod version;

pub use error::StoreError;
pub use schema::{Coercer, Message};
pub use version::{compare as compare_api_versions, is_at_most as api_is_at_most};

use queue::Queue;
use relay_persist::Persist;
use relay_wire::Value;
use schema::SchemaRegistry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_SERVER_API: &str = "3.2";
const PERSIST_PREFIX: &str = "message-store";
const SEVEN_DAYS_SECONDS: i64 = 60 * 60 * 24 * 7;

pub struct MessageStore {
    persist: Persist,
    persist_path: PathBuf,
    queue: Queue,
    schemas: SchemaRegistry,
}

impl MessageStore {
    /// Opens (or initializes) a message store rooted at `directory`, loading
    /// cursor state from `persist_path` (falling back to a fresh, empty
    /// persist if the file doesn't exist yet).
    pub fn open(
        directory: impl Into<PathBuf>,
        persist_path: impl Into<PathBuf>,
        directory_size: usize,
    ) -> Result<Self, StoreError> {
        let persist_path = persist_path.into();
        let persist = match Persist::load(&persist_path) {
            Ok(p) => p,
            Err(relay_persist::PersistError::NoUsableBackup { .. }) => Persist::new(),
            Err(e) => return Err(e.into()),
        };
        let queue = Queue::new(directory.into(), directory_size)?;
        let mut schemas = SchemaRegistry::new();
        schemas.register("resynchronize", DEFAULT_SERVER_API, |m: Message| Ok(m));
        Ok(Self {
            persist,
            persist_path,
            queue,
            schemas,
        })
    }

    pub fn add_schema(&mut self, type_: &str, api_version: &str, coercer: impl Coercer + 'static) {
        self.schemas.register(type_, api_version, coercer);
    }

    /// Persists cursor/metadata state to disk. Filesystem mutations to the
    /// pending-message queue itself (writes, flag renames, unlinks) are
    /// immediate and don't wait on `commit`.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.persist.save(&self.persist_path)?;
        Ok(())
    }

    fn key(name: &str) -> String {
        format!("{PERSIST_PREFIX}.{name}")
    }

    // --- accepted types -------------------------------------------------

    pub fn get_accepted_types(&self) -> Vec<String> {
        self.persist
            .get(&Self::key("accepted-types"))
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_text().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn accepts(&self, type_: &str) -> bool {
        self.get_accepted_types().iter().any(|t| t == type_)
    }

    /// Replaces the accepted-type set and re-walks the queue, unholding
    /// newly-accepted messages (moved to the tail) and holding
    /// newly-unaccepted ones beyond `pending_offset` (§4.E.1).
    pub fn set_accepted_types(&mut self, types: impl IntoIterator<Item = String>) -> Result<(), StoreError> {
        let mut sorted: Vec<String> = types.into_iter().collect();
        sorted.sort();
        sorted.dedup();
        let value = Value::List(sorted.iter().cloned().map(Value::Text).collect());
        self.persist.set(&Self::key("accepted-types"), value)?;
        self.reprocess_holding()?;
        Ok(())
    }

    fn reprocess_holding(&mut self) -> Result<(), StoreError> {
        let pending_offset = self.get_pending_offset();
        let accepted: std::collections::HashSet<String> =
            self.get_accepted_types().into_iter().collect();
        let mut offset = 0i64;
        for path in self.queue.walk("")? {
            let flags = path_flags(&path);
            let held = flags.contains(queue::HELD);
            let data = self.queue.read(&path)?;
            let message = match relay_wire::decode(&data) {
                Ok(Value::Map(m)) => m,
                _ => {
                    if !held {
                        offset += 1;
                    }
                    continue;
                }
            };
            let Some(type_) = message.get("type").and_then(Value::as_text) else {
                if !held {
                    offset += 1;
                }
                continue;
            };
            let is_accepted = accepted.contains(type_);
            if held {
                if is_accepted {
                    let new_path = self.queue.write_new(&data)?;
                    let remaining: String = flags.chars().filter(|&c| c != queue::HELD).collect();
                    self.queue.set_flags(&new_path, &remaining)?;
                    self.queue.unlink(&path)?;
                }
            } else {
                if !is_accepted && offset >= pending_offset {
                    self.queue.add_flag(&path, queue::HELD)?;
                }
                offset += 1;
            }
        }
        Ok(())
    }

    // --- scalar cursors ---------------------------------------------------

    pub fn get_sequence(&self) -> i64 {
        self.persist.get(&Self::key("sequence")).and_then(Value::as_int).unwrap_or(0)
    }

    pub fn set_sequence(&mut self, number: i64) -> Result<(), StoreError> {
        self.persist.set(&Self::key("sequence"), Value::Int(number))?;
        Ok(())
    }

    pub fn get_server_sequence(&self) -> i64 {
        self.persist
            .get(&Self::key("server_sequence"))
            .and_then(Value::as_int)
            .unwrap_or(0)
    }

    pub fn set_server_sequence(&mut self, number: i64) -> Result<(), StoreError> {
        self.persist.set(&Self::key("server_sequence"), Value::Int(number))?;
        Ok(())
    }

    pub fn get_server_uuid(&self) -> Option<String> {
        self.persist
            .get(&Self::key("server_uuid"))
            .cloned()
            .and_then(Value::into_text_lossy)
    }

    pub fn set_server_uuid(&mut self, uuid: &str) -> Result<(), StoreError> {
        self.persist.set(&Self::key("server_uuid"), Value::Text(uuid.to_string()))?;
        Ok(())
    }

    pub fn get_server_api(&self) -> String {
        self.persist
            .get(&Self::key("server_api"))
            .and_then(Value::as_text)
            .map(str::to_owned)
            .unwrap_or_else(|| DEFAULT_SERVER_API.to_string())
    }

    pub fn set_server_api(&mut self, server_api: &str) -> Result<(), StoreError> {
        self.persist.set(&Self::key("server_api"), Value::Text(server_api.to_string()))?;
        Ok(())
    }

    pub fn get_exchange_token(&self) -> Option<Vec<u8>> {
        match self.persist.get(&Self::key("exchange_token")) {
            Some(Value::Bytes(b)) => Some(b.clone()),
            Some(Value::Text(s)) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    pub fn set_exchange_token(&mut self, token: Option<&[u8]>) -> Result<(), StoreError> {
        let value = match token {
            Some(bytes) => Value::Bytes(bytes.to_vec()),
            None => Value::Null,
        };
        self.persist.set(&Self::key("exchange_token"), value)?;
        Ok(())
    }

    pub fn get_pending_offset(&self) -> i64 {
        self.persist
            .get(&Self::key("pending_offset"))
            .and_then(Value::as_int)
            .unwrap_or(0)
    }

    pub fn set_pending_offset(&mut self, val: i64) -> Result<(), StoreError> {
        self.persist.set(&Self::key("pending_offset"), Value::Int(val))?;
        Ok(())
    }

    pub fn add_pending_offset(&mut self, val: i64) -> Result<(), StoreError> {
        let current = self.get_pending_offset();
        self.set_pending_offset(current + val)
    }

    // --- queue read path ----------------------------------------------

    pub fn count_pending_messages(&self) -> Result<i64, StoreError> {
        let pending_offset = self.get_pending_offset() as usize;
        let all = self.queue.walk(&format!("{}{}", queue::HELD, queue::BROKEN))?;
        Ok(all.len().saturating_sub(pending_offset) as i64)
    }

    /// Returns up to `max` messages from the queue head, at or beyond
    /// `pending_offset`, skipping held/broken files, truncated to the
    /// first API-homogeneous prefix (I4). Files that fail to decode are
    /// flagged broken and skipped.
    pub fn get_pending_messages(&mut self, max: Option<usize>) -> Result<Vec<Message>, StoreError> {
        let pending_offset = self.get_pending_offset() as usize;
        let candidates = self.queue.walk(&format!("{}{}", queue::HELD, queue::BROKEN))?;
        let mut messages = Vec::new();
        let mut homogeneous_api: Option<String> = None;
        for path in candidates.into_iter().skip(pending_offset) {
            if let Some(max) = max {
                if messages.len() >= max {
                    break;
                }
            }
            let data = self.queue.read(&path)?;
            match relay_wire::decode(&data) {
                Ok(Value::Map(message)) => {
                    let api = message.get("api").and_then(Value::as_text).unwrap_or(DEFAULT_SERVER_API);
                    match &homogeneous_api {
                        None => homogeneous_api = Some(api.to_string()),
                        Some(expected) if expected != api => break,
                        _ => {}
                    }
                    messages.push(message);
                }
                _ => {
                    self.queue.add_flag(&path, queue::BROKEN)?;
                }
            }
        }
        Ok(messages)
    }

    pub fn delete_old_messages(&mut self) -> Result<(), StoreError> {
        let pending_offset = self.get_pending_offset() as usize;
        let unflagged = self.queue.walk(&format!("{}{}", queue::HELD, queue::BROKEN))?;
        for path in unflagged.into_iter().take(pending_offset) {
            self.queue.unlink(&path)?;
        }
        Ok(())
    }

    pub fn delete_all_messages(&mut self) -> Result<(), StoreError> {
        self.set_pending_offset(0)?;
        self.queue.unlink_all()
    }

    pub fn is_pending(&self, msg_id: u64) -> Result<bool, StoreError> {
        let pending_offset = self.get_pending_offset();
        let mut i: i64 = 0;
        for path in self.queue.walk(&queue::BROKEN.to_string())? {
            let flags = path_flags(&path);
            let held = flags.contains(queue::HELD);
            if (held || i >= pending_offset) && self.queue.inode(&path)? == msg_id {
                return Ok(true);
            }
            if !held {
                i += 1;
            }
        }
        Ok(false)
    }

    // --- write path -------------------------------------------------------

    /// Queues a message for delivery, per the public contract in §4.E.1.
    pub fn add(&mut self, mut message: Message, now: i64) -> Result<Option<u64>, StoreError> {
        let type_ = message
            .get("type")
            .and_then(Value::as_text)
            .map(str::to_owned)
            .ok_or(StoreError::MissingType)?;

        if self.is_blackholed() {
            tracing::debug!(type_, "dropped message, awaiting resync");
            return Ok(None);
        }

        let server_api = self.get_server_api();
        message
            .entry("api".to_string())
            .or_insert_with(|| Value::Text(server_api.clone()));
        message
            .entry("timestamp".to_string())
            .or_insert(Value::Int(now));

        let message = self.schemas.coerce(&type_, &server_api, message)?;
        let data = relay_wire::encode(&Value::Map(message));
        let mut path = self.queue.write_new(&data)?;

        if !self.accepts(&type_) {
            path = self.queue.set_flags(&path, &queue::HELD.to_string())?;
        }

        Ok(Some(self.queue.inode(&path)?))
    }

    // --- sequencing ---------------------------------------------------

    /// Reconciles the server's reported `next_expected_sequence` against
    /// the current cursor (§4.E.2), performing any filesystem deletion the
    /// chosen case calls for and staging the new cursor values. Returns
    /// `true` if the caller should emit `RESYNC`.
    pub fn apply_next_expected_sequence(
        &mut self,
        next_expected_sequence: i64,
    ) -> Result<bool, StoreError> {
        let sequence = self.get_sequence();
        let pending_offset = self.get_pending_offset();
        let count_pending = self.count_pending_messages()?;
        let outcome = sequencing::reconcile(next_expected_sequence, sequence, pending_offset, count_pending);

        if outcome.delete_old_messages {
            self.delete_old_messages()?;
        }
        self.set_pending_offset(outcome.new_pending_offset)?;
        self.set_sequence(outcome.new_sequence)?;
        Ok(outcome.resync)
    }

    // --- failure/blackhole tracking ------------------------------------

    fn is_blackholed(&self) -> bool {
        matches!(
            self.persist.get(&Self::key("blackhole-messages")),
            Some(Value::Bool(true))
        )
    }

    pub fn record_success(&mut self) -> Result<(), StoreError> {
        self.persist.remove(&Self::key("first-failure-time"));
        self.persist.remove(&Self::key("blackhole-messages"));
        Ok(())
    }

    /// Records a failed exchange. After seven real-time days of continuous
    /// failure, sets the blackhole latch and enqueues a synthetic
    /// `resynchronize` message (§4.E.4).
    pub fn record_failure(&mut self, now: i64) -> Result<(), StoreError> {
        let key = Self::key("first-failure-time");
        if self.persist.get(&key).is_none() {
            self.persist.set(&key, Value::Int(now))?;
        }
        let first_failure = self.persist.get(&key).and_then(Value::as_int).unwrap_or(now);
        if self.is_blackholed() {
            return Ok(());
        }
        if now - first_failure > SEVEN_DAYS_SECONDS {
            let message: Message = relay_wire::map!("type" => "resynchronize")
                .as_map()
                .unwrap()
                .clone();
            self.add(message, now)?;
            self.persist.set(&Self::key("blackhole-messages"), Value::Bool(true))?;
            tracing::warn!("unable to communicate with the server for more than a week, waiting for resync");
        }
        Ok(())
    }

    // --- session ids -----------------------------------------------------

    pub fn get_session_id(&mut self, scope: Option<&str>) -> Result<String, StoreError> {
        let key = Self::key("session-ids");
        let ids = self.session_ids();
        for (id, stored_scope) in &ids {
            if stored_scope.as_deref() == scope {
                return Ok(id.clone());
            }
        }
        let new_id = uuid::Uuid::new_v4().to_string();
        let mut map: BTreeMap<String, Value> = ids
            .into_iter()
            .map(|(id, s)| (id, s.map(Value::Text).unwrap_or(Value::Null)))
            .collect();
        map.insert(new_id.clone(), scope.map(Value::from).unwrap_or(Value::Null));
        self.persist.set(&key, Value::Map(map))?;
        Ok(new_id)
    }

    pub fn is_valid_session_id(&self, session_id: &str) -> bool {
        self.session_ids().iter().any(|(id, _)| id == session_id)
    }

    pub fn drop_session_ids(&mut self, scopes: Option<&[String]>) -> Result<(), StoreError> {
        let key = Self::key("session-ids");
        let remaining: BTreeMap<String, Value> = match scopes {
            None => BTreeMap::new(),
            Some(scopes) => self
                .session_ids()
                .into_iter()
                .filter(|(_, scope)| match scope {
                    Some(s) => !scopes.iter().any(|x| x == s),
                    None => true,
                })
                .map(|(id, s)| (id, s.map(Value::Text).unwrap_or(Value::Null)))
                .collect(),
        };
        self.persist.set(&key, Value::Map(remaining))?;
        Ok(())
    }

    fn session_ids(&self) -> Vec<(String, Option<String>)> {
        self.persist
            .get(&Self::key("session-ids"))
            .and_then(Value::as_map)
            .map(|m| {
                m.iter()
                    .map(|(id, v)| (id.clone(), v.as_text().map(str::to_owned)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn path_flags(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split_once('_'))
        .map(|(_, flags)| flags.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::map;

    fn new_store(dir: &std::path::Path) -> MessageStore {
        MessageStore::open(dir.join("queue"), dir.join("persist.bin"), 1000).unwrap()
    }

    #[test]
    fn add_returns_an_id_and_stamps_api_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("status", "3.2", |m: Message| Ok(m));
        store.set_accepted_types(["status".to_string()]).unwrap();

        let msg: Message = map!("type" => "status").as_map().unwrap().clone();
        let id = store.add(msg, 1_000).unwrap();
        assert!(id.is_some());

        let pending = store.get_pending_messages(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].get("api").and_then(Value::as_text), Some("3.2"));
        assert_eq!(pending[0].get("timestamp").and_then(Value::as_int), Some(1_000));
    }

    #[test]
    fn unaccepted_type_is_held_and_excluded_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("secret", "3.2", |m: Message| Ok(m));
        // no accepted types registered

        let msg: Message = map!("type" => "secret").as_map().unwrap().clone();
        store.add(msg, 0).unwrap();
        assert_eq!(store.get_pending_messages(None).unwrap().len(), 0);
        assert_eq!(store.count_pending_messages().unwrap(), 0);
    }

    #[test]
    fn set_accepted_types_unholds_previously_held_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("holdme", "3.2", |m: Message| Ok(m));

        let msg: Message = map!("type" => "holdme").as_map().unwrap().clone();
        store.add(msg, 0).unwrap();
        assert_eq!(store.get_pending_messages(None).unwrap().len(), 0);

        store.set_accepted_types(["holdme".to_string()]).unwrap();
        assert_eq!(store.get_pending_messages(None).unwrap().len(), 1);
    }

    #[test]
    fn blackhole_latch_drops_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("status", "3.2", |m: Message| Ok(m));
        store.set_accepted_types(["status".to_string(), "resynchronize".to_string()]).unwrap();

        store.record_failure(0).unwrap();
        store.record_failure(SEVEN_DAYS_SECONDS + 1).unwrap();
        assert!(store.is_blackholed());

        let msg: Message = map!("type" => "status").as_map().unwrap().clone();
        assert_eq!(store.add(msg, SEVEN_DAYS_SECONDS + 2).unwrap(), None);
    }

    #[test]
    fn record_success_clears_blackhole() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("status", "3.2", |m: Message| Ok(m));
        store.record_failure(0).unwrap();
        store.record_failure(SEVEN_DAYS_SECONDS + 1).unwrap();
        assert!(store.is_blackholed());
        store.record_success().unwrap();
        assert!(!store.is_blackholed());
    }

    #[test]
    fn session_ids_are_stable_per_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let a = store.get_session_id(Some("pkg")).unwrap();
        let b = store.get_session_id(Some("pkg")).unwrap();
        assert_eq!(a, b);
        assert!(store.is_valid_session_id(&a));

        store.drop_session_ids(Some(&["pkg".to_string()])).unwrap();
        assert!(!store.is_valid_session_id(&a));
    }

    #[test]
    fn apply_next_expected_sequence_deletes_acknowledged_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store.add_schema("status", "3.2", |m: Message| Ok(m));
        store.set_accepted_types(["status".to_string()]).unwrap();
        for _ in 0..3 {
            let msg: Message = map!("type" => "status").as_map().unwrap().clone();
            store.add(msg, 0).unwrap();
        }
        let resync = store.apply_next_expected_sequence(3).unwrap();
        assert!(!resync);
        assert_eq!(store.get_sequence(), 3);
        assert_eq!(store.count_pending_messages().unwrap(), 0);
    }
}
