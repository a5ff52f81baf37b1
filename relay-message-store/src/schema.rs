use crate::error::StoreError;
use crate::version;
use std::collections::BTreeMap;
use std::collections::HashMap;

pub type Message = BTreeMap<String, relay_wire::Value>;

/// A coercer normalizes/validates the fields of a message of one type at one
/// API version, the Rust realization of a `landscape.message_schemas.message.
/// Message` instance's `coerce` method (§4.E.3).
pub trait Coercer: Send + Sync {
    fn coerce(&self, message: Message) -> Result<Message, String>;
}

impl<F> Coercer for F
where
    F: Fn(Message) -> Result<Message, String> + Send + Sync,
{
    fn coerce(&self, message: Message) -> Result<Message, String> {
        self(message)
    }
}

/// Per-type table of coercers keyed by the API version they were registered
/// for. `add` selects the entry with the highest `api_version` not exceeding
/// the store's current `server_api`.
#[derive(Default)]
pub struct SchemaRegistry {
    by_type: HashMap<String, Vec<(String, Box<dyn Coercer>)>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    pub fn register(&mut self, type_: &str, api_version: &str, coercer: impl Coercer + 'static) {
        self.by_type
            .entry(type_.to_string())
            .or_default()
            .push((api_version.to_string(), Box::new(coercer)));
    }

    pub fn coerce(
        &self,
        type_: &str,
        server_api: &str,
        message: Message,
    ) -> Result<Message, StoreError> {
        let candidates = self
            .by_type
            .get(type_)
            .ok_or_else(|| StoreError::NoSchema(type_.to_string()))?;
        let best = candidates
            .iter()
            .filter(|(api, _)| version::is_at_most(api, server_api))
            .max_by(|(a, _), (b, _)| version::compare(a, b))
            .or_else(|| candidates.iter().min_by(|(a, _), (b, _)| version::compare(a, b)))
            .ok_or_else(|| StoreError::NoSchema(type_.to_string()))?;
        best.1.coerce(message).map_err(|reason| StoreError::Coercion {
            type_: type_.to_string(),
            reason,
        })
    }

    pub fn has(&self, type_: &str) -> bool {
        self.by_type.contains_key(type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::{map, Value};

    #[test]
    fn selects_highest_api_not_exceeding_server_api() {
        let mut registry = SchemaRegistry::new();
        registry.register("status", "3.1", |m: Message| Ok(m));
        registry.register("status", "3.3", |mut m: Message| {
            m.insert("v3_3_field".into(), Value::Bool(true));
            Ok(m)
        });
        let msg: Message = map!("type" => "status").as_map().unwrap().clone();
        let coerced = registry.coerce("status", "3.2", msg).unwrap();
        assert!(!coerced.contains_key("v3_3_field"));
    }

    #[test]
    fn missing_schema_is_an_error() {
        let registry = SchemaRegistry::new();
        let msg: Message = map!("type" => "unknown").as_map().unwrap().clone();
        assert!(registry.coerce("unknown", "3.2", msg).is_err());
    }
}
