//! Client identity: the server-issued secure/insecure ids, persisted, plus
//! the read-only account configuration the registration message is built
//! from (§4.I). Grounded on `landscape/client/broker/registration.py`'s
//! `Identity`, whose `secure_id`/`insecure_id` are `persist_property`s and
//! whose remaining fields are `config_property`s projected straight through
//! from the broker configuration.

use relay_wire::Value;
use std::path::PathBuf;

/// The account-level configuration `Identity` projects through unchanged;
/// owned by the binary's settings, handed in at construction.
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub computer_title: Option<String>,
    pub account_name: Option<String>,
    pub registration_key: Option<String>,
    pub tags: Option<Vec<String>>,
    pub access_group: Option<String>,
}

pub struct Identity {
    config: IdentityConfig,
    persist: relay_persist::Persist,
    persist_path: PathBuf,
}

impl Identity {
    pub fn open(
        config: IdentityConfig,
        persist_path: impl Into<PathBuf>,
    ) -> Result<Self, relay_persist::PersistError> {
        let persist_path = persist_path.into();
        let persist = match relay_persist::Persist::load(&persist_path) {
            Ok(persist) => persist,
            Err(relay_persist::PersistError::NoUsableBackup { .. }) => relay_persist::Persist::new(),
            Err(other) => return Err(other),
        };
        Ok(Self {
            config,
            persist,
            persist_path,
        })
    }

    pub fn secure_id(&self) -> Option<String> {
        self.persist.get("secure-id").cloned().and_then(Value::into_text_lossy)
    }

    pub fn set_secure_id(&mut self, id: Option<&str>) -> Result<(), relay_persist::PersistError> {
        match id {
            Some(id) => self.persist.set("secure-id", Value::Text(id.to_string())),
            None => {
                self.persist.remove("secure-id");
                Ok(())
            }
        }
    }

    pub fn insecure_id(&self) -> Option<String> {
        self.persist
            .get("insecure-id")
            .cloned()
            .and_then(Value::into_text_lossy)
    }

    pub fn set_insecure_id(&mut self, id: Option<&str>) -> Result<(), relay_persist::PersistError> {
        match id {
            Some(id) => self.persist.set("insecure-id", Value::Text(id.to_string())),
            None => {
                self.persist.remove("insecure-id");
                Ok(())
            }
        }
    }

    pub fn commit(&self) -> Result<(), relay_persist::PersistError> {
        self.persist.save(&self.persist_path)
    }

    pub fn computer_title(&self) -> Option<&str> {
        self.config.computer_title.as_deref()
    }

    pub fn account_name(&self) -> Option<&str> {
        self.config.account_name.as_deref()
    }

    pub fn registration_key(&self) -> Option<&str> {
        self.config.registration_key.as_deref()
    }

    pub fn tags(&self) -> Option<&[String]> {
        self.config.tags.as_deref()
    }

    pub fn access_group(&self) -> Option<&str> {
        self.config.access_group.as_deref()
    }

    /// Appends "(clone)"/"(clone of X)" to the computer title, as the server
    /// directs when it tells us we're a clone of another registered
    /// computer. Not persisted: a fresh registration request follows
    /// immediately.
    pub fn mark_as_clone(&mut self, clone_of: Option<&str>) {
        let title = self.config.computer_title.clone().unwrap_or_default();
        self.config.computer_title = Some(match clone_of {
            Some(clone) => format!("{title} (clone of {clone})"),
            None => format!("{title} (clone)"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_id_round_trips_through_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = Identity::open(IdentityConfig::default(), dir.path().join("identity.bin")).unwrap();
        assert_eq!(identity.secure_id(), None);
        identity.set_secure_id(Some("abc")).unwrap();
        assert_eq!(identity.secure_id(), Some("abc".to_string()));
        identity.commit().unwrap();

        let reloaded = Identity::open(IdentityConfig::default(), dir.path().join("identity.bin")).unwrap();
        assert_eq!(reloaded.secure_id(), Some("abc".to_string()));
    }

    #[test]
    fn clearing_secure_id_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = Identity::open(IdentityConfig::default(), dir.path().join("identity.bin")).unwrap();
        identity.set_secure_id(Some("abc")).unwrap();
        identity.set_secure_id(None).unwrap();
        assert_eq!(identity.secure_id(), None);
    }
}
