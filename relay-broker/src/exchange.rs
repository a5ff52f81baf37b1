//! The message exchange protocol engine (§4.G): payload assembly, the
//! scheduling/urgency state machine, and the eight-step result-processing
//! pipeline. Grounded one-for-one on
//! `landscape/client/broker/exchange.py`'s `MessageExchange`.
//!
//! The original's single conceptual owner thread is realized here as one
//! `std::sync::Mutex<ExchangeData>` per [`Exchange`]: every method takes the
//! lock for the span of its synchronous work and releases it before any
//! `.await`, so the mutex is never held across a suspension point. The only
//! operation that suspends is the transport POST itself, matching §5's "the
//! only suspending operation the core uses is the transport POST" — realized
//! here as a plain `.await` on `reqwest`'s own async I/O rather than a
//! worker-thread hop, since unlike the original's blocking `pycurl` client,
//! `reqwest` never blocks the calling task.

use relay_message_store::{Message, MessageStore};
use relay_persist::Persist;
use relay_reactor::{CallId, Reactor};
use relay_transport::{Transport, TransportError};
use relay_wire::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::BrokerError;
use crate::identity::Identity;

const DEFAULT_SERVER_API: &str = "3.2";

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub server_url: String,
    pub exchange_interval: Duration,
    pub urgent_exchange_interval: Duration,
    pub max_messages: usize,
    /// The highest message API this build speaks (§4.G.5's "our_max").
    pub client_api: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            exchange_interval: Duration::from_secs(900),
            urgent_exchange_interval: Duration::from_secs(60),
            max_messages: 100,
            client_api: "3.3".to_string(),
        }
    }
}

type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

struct ExchangeData {
    store: MessageStore,
    exchange_store: relay_exchange_store::ExchangeStore,
    exchange_interval: Duration,
    urgent_exchange_interval: Duration,
    exchanging: bool,
    urgent: bool,
    stopped: bool,
    exchange_call_id: Option<CallId>,
    notification_call_id: Option<CallId>,
    client_accepted_types: BTreeSet<String>,
    client_accepted_types_hash: Option<Vec<u8>>,
    handlers: HashMap<String, Vec<MessageHandler>>,
    config_persist: Persist,
    config_persist_path: PathBuf,
}

struct ExchangeShared {
    reactor: Arc<Reactor>,
    transport: Transport,
    identity: Arc<Mutex<Identity>>,
    server_url: String,
    max_messages: usize,
    client_api: String,
    data: Mutex<ExchangeData>,
}

/// Cheaply `Clone`-able handle onto the shared exchange state; every
/// instance refers to the same underlying engine.
#[derive(Clone)]
pub struct Exchange(Arc<ExchangeShared>);

struct Payload {
    value: Value,
    messages_len: usize,
}

impl Exchange {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reactor: Arc<Reactor>,
        transport: Transport,
        identity: Arc<Mutex<Identity>>,
        store: MessageStore,
        exchange_store: relay_exchange_store::ExchangeStore,
        config: ExchangeConfig,
        config_persist_path: impl Into<PathBuf>,
    ) -> Result<Self, BrokerError> {
        let config_persist_path = config_persist_path.into();
        let config_persist = match Persist::load(&config_persist_path) {
            Ok(persist) => persist,
            Err(relay_persist::PersistError::NoUsableBackup { .. }) => Persist::new(),
            Err(other) => return Err(other.into()),
        };

        let (exchange_interval, urgent_exchange_interval) = config_persist
            .get("intervals")
            .and_then(Value::as_map)
            .map(|saved| {
                let exchange = saved
                    .get("exchange")
                    .and_then(Value::as_int)
                    .map(|secs| Duration::from_secs(secs.max(0) as u64))
                    .unwrap_or(config.exchange_interval);
                let urgent = saved
                    .get("urgent-exchange")
                    .and_then(Value::as_int)
                    .map(|secs| Duration::from_secs(secs.max(0) as u64))
                    .unwrap_or(config.urgent_exchange_interval);
                (exchange, urgent)
            })
            .unwrap_or((config.exchange_interval, config.urgent_exchange_interval));

        let data = Mutex::new(ExchangeData {
            store,
            exchange_store,
            exchange_interval,
            urgent_exchange_interval,
            exchanging: false,
            urgent: false,
            stopped: false,
            exchange_call_id: None,
            notification_call_id: None,
            // The built-in handlers below are registered inline rather than
            // through `register_message`, so their types are seeded here to
            // match what `register_message("accepted-types", ...)` would
            // have added to this set in the original.
            client_accepted_types: BTreeSet::from([
                "accepted-types".to_string(),
                "resynchronize".to_string(),
                "set-intervals".to_string(),
            ]),
            client_accepted_types_hash: None,
            handlers: HashMap::new(),
            config_persist,
            config_persist_path,
        });

        let shared = Arc::new(ExchangeShared {
            reactor,
            transport,
            identity,
            server_url: config.server_url,
            max_messages: config.max_messages,
            client_api: config.client_api,
            data,
        });
        let exchange = Exchange(shared);

        // Registering this here (rather than as an external
        // `register_message`-style closure) captures an `Exchange` clone
        // inside its own reactor-owned handler table, a bounded,
        // one-time-at-startup reference cycle; it lives for the process
        // lifetime anyway, so it's never worth a `Weak` indirection.
        let resync = exchange.clone();
        exchange.0.reactor.call_on("resynchronize-clients", move |args| {
            let scopes = args.first().and_then(value_to_string_list);
            resync.resynchronize_clients(scopes);
            Ok(Value::Null)
        });

        Ok(exchange)
    }

    pub fn start(&self) {
        self.schedule(true, false);
    }

    pub fn stop(&self) {
        let mut data = self.0.data.lock().unwrap();
        if let Some(id) = data.exchange_call_id.take() {
            self.0.reactor.cancel_call(id);
        }
        if let Some(id) = data.notification_call_id.take() {
            self.0.reactor.cancel_call(id);
        }
        data.stopped = true;
    }

    pub fn is_urgent(&self) -> bool {
        self.0.data.lock().unwrap().urgent
    }

    pub fn accepts(&self, type_: &str) -> bool {
        self.0.data.lock().unwrap().store.accepts(type_)
    }

    pub fn server_api(&self) -> String {
        self.0.data.lock().unwrap().store.get_server_api()
    }

    /// Registers the schema an outbound message type must pass through
    /// before it can be queued via [`Exchange::send`] (§4.E.3). Plugins own
    /// the message types they originate, the way `Registration` owns
    /// `register`'s schema.
    pub fn add_schema(&self, type_: &str, api_version: &str, coercer: impl relay_message_store::Coercer + 'static) {
        self.0.data.lock().unwrap().store.add_schema(type_, api_version, coercer);
    }

    pub fn delete_all_messages(&self) -> Result<(), BrokerError> {
        self.0.data.lock().unwrap().store.delete_all_messages()?;
        Ok(())
    }

    pub fn pending_message_count(&self) -> Result<i64, BrokerError> {
        Ok(self.0.data.lock().unwrap().store.count_pending_messages()?)
    }

    /// §4.G.2.
    pub fn schedule(&self, urgent: bool, force: bool) {
        let mut data = self.0.data.lock().unwrap();
        if data.stopped {
            return;
        }
        let should_schedule = !data.exchanging
            && (force || data.exchange_call_id.is_none() || (urgent && !data.urgent));
        if !should_schedule {
            return;
        }
        if urgent {
            data.urgent = true;
        }
        if let Some(id) = data.exchange_call_id.take() {
            self.0.reactor.cancel_call(id);
        }
        let interval = if data.urgent {
            data.urgent_exchange_interval
        } else {
            data.exchange_interval
        };
        if let Some(id) = data.notification_call_id.take() {
            self.0.reactor.cancel_call(id);
        }

        let notification_interval = interval.saturating_sub(Duration::from_secs(10));
        let reactor_for_notify = self.0.reactor.clone();
        data.notification_call_id = Some(self.0.reactor.call_later(notification_interval, move || {
            reactor_for_notify.fire("impending-exchange", &[]);
        }));

        let exchange = self.clone();
        data.exchange_call_id = Some(self.0.reactor.call_later(interval, move || {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange.exchange().await;
            });
        }));
    }

    /// §4.G.6.
    pub fn send(&self, message: Message, urgent: bool) -> Result<Option<u64>, BrokerError> {
        let mut data = self.0.data.lock().unwrap();
        if let Some(operation_id) = message.get("operation-id").and_then(Value::as_int) {
            match data.exchange_store.get(operation_id)? {
                Some(context) => {
                    data.exchange_store.remove(operation_id)?;
                    let current_secure_id = self.0.identity.lock().unwrap().secure_id();
                    if current_secure_id.as_deref() != Some(context.secure_id.as_str()) {
                        tracing::info!(
                            operation_id,
                            "dropping response message: secure id changed since receipt"
                        );
                        return Ok(None);
                    }
                }
                None => {
                    tracing::warn!(operation_id, "no message context for operation id");
                }
            }
        }
        let now = self.0.reactor.time() as i64;
        let id = data.store.add(message, now)?;
        drop(data);
        if urgent {
            self.schedule(true, false);
        }
        Ok(id)
    }

    /// §4.G.8.
    pub fn register_message<F>(&self, type_: &str, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut data = self.0.data.lock().unwrap();
        data.handlers
            .entry(type_.to_string())
            .or_default()
            .push(Arc::new(handler));
        data.client_accepted_types.insert(type_.to_string());
    }

    pub fn register_client_accepted_message_type(&self, type_: &str) {
        self.0
            .data
            .lock()
            .unwrap()
            .client_accepted_types
            .insert(type_.to_string());
    }

    /// §4.G.7.
    pub fn handle_message(&self, message: &Message) {
        let type_ = message
            .get("type")
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string();

        if let Some(operation_id) = message.get("operation-id").and_then(Value::as_int) {
            let secure_id = self.0.identity.lock().unwrap().secure_id().unwrap_or_default();
            let timestamp = self.0.reactor.time();
            let mut data = self.0.data.lock().unwrap();
            if let Err(err) = data.exchange_store.add(operation_id, &secure_id, &type_, timestamp) {
                if !err.is_duplicate() {
                    tracing::error!(%err, "failed to record message context");
                }
            }
        }

        self.0.reactor.fire("message", &[Value::Map(message.clone())]);

        match type_.as_str() {
            "accepted-types" => self.handle_accepted_types(message),
            "resynchronize" => self.handle_resynchronize(message),
            "set-intervals" => self.handle_set_intervals(message),
            _ => {}
        }

        let handlers: Vec<MessageHandler> = {
            let data = self.0.data.lock().unwrap();
            data.handlers.get(&type_).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(message);
        }
    }

    fn handle_accepted_types(&self, message: &Message) {
        let Some(new_types) = message.get("types").and_then(value_to_string_list) else {
            return;
        };
        let new_types: BTreeSet<String> = new_types.into_iter().collect();

        let old_types: BTreeSet<String> = {
            let data = self.0.data.lock().unwrap();
            data.store.get_accepted_types().into_iter().collect()
        };

        {
            let mut data = self.0.data.lock().unwrap();
            if let Err(err) = data.store.set_accepted_types(new_types.clone()) {
                tracing::error!(%err, "failed to persist accepted types");
                return;
            }
        }
        tracing::info!(
            added = ?new_types.difference(&old_types).collect::<Vec<_>>(),
            removed = ?old_types.difference(&new_types).collect::<Vec<_>>(),
            "accepted types changed"
        );

        let has_pending = {
            let mut data = self.0.data.lock().unwrap();
            !data.store.get_pending_messages(Some(1)).unwrap_or_default().is_empty()
        };
        if has_pending {
            self.schedule(true, false);
        }

        for removed in old_types.difference(&new_types) {
            self.0.reactor.fire(
                "message-type-acceptance-changed",
                &[Value::Text(removed.clone()), Value::Bool(false)],
            );
        }
        for added in new_types.difference(&old_types) {
            self.0.reactor.fire(
                "message-type-acceptance-changed",
                &[Value::Text(added.clone()), Value::Bool(true)],
            );
        }
    }

    fn handle_resynchronize(&self, message: &Message) {
        let mut response: Message = BTreeMap::new();
        response.insert("type".to_string(), Value::from("resynchronize"));
        if let Some(operation_id) = message.get("operation-id").cloned() {
            response.insert("operation-id".to_string(), operation_id);
        }
        if let Err(err) = self.send(response, false) {
            tracing::error!(%err, "failed to queue resynchronize response");
        }
        let scopes = message.get("scopes").and_then(value_to_string_list);
        self.0.reactor.fire(
            "resynchronize-clients",
            &[scopes.map(Value::from).unwrap_or(Value::Null)],
        );
    }

    fn handle_set_intervals(&self, message: &Message) {
        let mut data = self.0.data.lock().unwrap();
        if let Some(seconds) = message.get("exchange").and_then(Value::as_int) {
            data.exchange_interval = Duration::from_secs(seconds.max(0) as u64);
            tracing::info!(seconds, "exchange interval set");
        }
        if let Some(seconds) = message.get("urgent-exchange").and_then(Value::as_int) {
            data.urgent_exchange_interval = Duration::from_secs(seconds.max(0) as u64);
            tracing::info!(seconds, "urgent exchange interval set");
        }
        let intervals = relay_wire::map!(
            "exchange" => data.exchange_interval.as_secs() as i64,
            "urgent-exchange" => data.urgent_exchange_interval.as_secs() as i64
        );
        if let Err(err) = data.config_persist.set("intervals", intervals) {
            tracing::error!(%err, "failed to stage updated exchange intervals");
            return;
        }
        let path = data.config_persist_path.clone();
        if let Err(err) = data.config_persist.save(&path) {
            tracing::error!(%err, "failed to persist updated exchange intervals");
        }
    }

    fn resynchronize_clients(&self, scopes: Option<Vec<String>>) {
        {
            let mut data = self.0.data.lock().unwrap();
            if let Err(err) = data.store.drop_session_ids(scopes.as_deref()) {
                tracing::error!(%err, "failed to drop session ids");
            }
        }
        self.schedule(true, false);
    }

    fn make_payload(&self) -> Payload {
        let mut data = self.0.data.lock().unwrap();
        let accepted_types_digest = hash_types(&data.store.get_accepted_types());
        let messages = data
            .store
            .get_pending_messages(Some(self.0.max_messages))
            .unwrap_or_default();
        let total_messages = data.store.count_pending_messages().unwrap_or(0);

        let server_api = messages
            .first()
            .and_then(|m| m.get("api"))
            .and_then(Value::as_text)
            .map(str::to_string)
            .unwrap_or_else(|| data.store.get_server_api());

        let messages_len = messages.len();
        let sequence = data.store.get_sequence();
        let next_expected_sequence = data.store.get_server_sequence();

        let mut map = BTreeMap::new();
        map.insert("server-api".to_string(), Value::Text(server_api));
        map.insert("client-api".to_string(), Value::Text(self.0.client_api.clone()));
        map.insert("sequence".to_string(), Value::Int(sequence));
        map.insert("accepted-types".to_string(), Value::Bytes(accepted_types_digest));
        map.insert(
            "messages".to_string(),
            Value::List(messages.into_iter().map(Value::Map).collect()),
        );
        map.insert("total-messages".to_string(), Value::Int(total_messages));
        map.insert(
            "next-expected-sequence".to_string(),
            Value::Int(next_expected_sequence),
        );

        let client_accepted_types: Vec<String> = data.client_accepted_types.iter().cloned().collect();
        let client_hash = hash_types(&client_accepted_types);
        if Some(&client_hash) != data.client_accepted_types_hash.as_ref() {
            map.insert(
                "client-accepted-types".to_string(),
                Value::List(client_accepted_types.into_iter().map(Value::Text).collect()),
            );
        }

        Payload {
            value: Value::Map(map),
            messages_len,
        }
    }

    /// §4.G.3. Boxed so the 404-downgrade retry can recurse.
    pub fn exchange<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut data = self.0.data.lock().unwrap();
                if data.exchanging {
                    return;
                }
                data.exchanging = true;
            }

            self.0.reactor.fire("pre-exchange", &[]);

            let payload = self.make_payload();
            let encoded = relay_wire::encode(&payload.value);
            let server_api = payload
                .value
                .as_map()
                .and_then(|m| m.get("server-api"))
                .and_then(Value::as_text)
                .unwrap_or(DEFAULT_SERVER_API)
                .to_string();

            let (exchange_token, secure_id) = {
                let mut data = self.0.data.lock().unwrap();
                let token = data.store.get_exchange_token();
                let _ = data.store.set_exchange_token(None);
                let _ = data.store.commit();
                let secure_id = self.0.identity.lock().unwrap().secure_id();
                (token, secure_id)
            };

            let was_urgent = self.0.data.lock().unwrap().urgent;
            tracing::info!(url = %self.0.server_url, urgent = was_urgent, "starting message exchange");

            let token_header = exchange_token.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            let outcome = self
                .0
                .transport
                .exchange(
                    &self.0.server_url,
                    encoded,
                    secure_id.as_deref(),
                    token_header.as_deref(),
                    &server_api,
                )
                .await;

            match outcome {
                Ok(body) => {
                    let decoded = relay_wire::decode(&body);
                    {
                        let mut data = self.0.data.lock().unwrap();
                        data.exchanging = false;
                        if data.urgent {
                            tracing::info!("switching to normal exchange mode");
                            data.urgent = false;
                        }
                    }
                    match decoded {
                        Ok(Value::Map(response)) => {
                            if let Err(err) = self.handle_result(&payload, response) {
                                tracing::error!(%err, "failed to process exchange result");
                            }
                            self.0.data.lock().unwrap().store.record_success().ok();
                        }
                        _ => {
                            tracing::warn!("exchange response was not a decodable map");
                            self.fail_exchange(false);
                        }
                    }
                    self.exchange_completed();
                }
                Err(TransportError::Http { code: 404, .. }) => {
                    self.0.data.lock().unwrap().exchanging = false;
                    let downgraded = {
                        let mut data = self.0.data.lock().unwrap();
                        if data.store.get_server_api() != DEFAULT_SERVER_API {
                            let _ = data.store.set_server_api(DEFAULT_SERVER_API);
                            let _ = data.store.commit();
                            true
                        } else {
                            false
                        }
                    };
                    if downgraded {
                        self.exchange().await;
                        return;
                    }
                    self.fail_exchange(false);
                    self.exchange_completed();
                }
                Err(err) => {
                    let ssl_error = err.is_tls_verification_failure();
                    self.0.data.lock().unwrap().exchanging = false;
                    tracing::info!(%err, "message exchange failed");
                    self.fail_exchange(ssl_error);
                    self.exchange_completed();
                }
            }
        })
    }

    fn fail_exchange(&self, ssl_error: bool) {
        self.0.reactor.fire("exchange-failed", &[Value::Bool(ssl_error)]);
        let now = self.0.reactor.time() as i64;
        self.0.data.lock().unwrap().store.record_failure(now).ok();
    }

    fn exchange_completed(&self) {
        self.schedule(false, true);
        self.0.reactor.fire("exchange-done", &[]);
    }

    /// §4.G.5, the eight-step result-processing pipeline.
    fn handle_result(&self, payload: &Payload, response: BTreeMap<String, Value>) -> Result<(), BrokerError> {
        // 1.
        let client_hash = match response.get("client-accepted-types-hash") {
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        };
        self.0.data.lock().unwrap().client_accepted_types_hash = client_hash;

        // 2.
        let old_sequence = self.0.data.lock().unwrap().store.get_sequence();
        let next_expected = response
            .get("next-expected-sequence")
            .and_then(Value::as_int)
            .unwrap_or(old_sequence + payload.messages_len as i64);
        let resync = self
            .0
            .data
            .lock()
            .unwrap()
            .store
            .apply_next_expected_sequence(next_expected)?;
        if resync {
            tracing::info!("server asked for ancient data, resynchronizing all state");
            let mut message: Message = BTreeMap::new();
            message.insert("type".to_string(), Value::from("resynchronize"));
            self.send(message, false)?;
            self.0.reactor.fire("resynchronize-clients", &[Value::Null]);
        }

        // 3.
        {
            let token = response.get("next-exchange-token").and_then(|v| match v {
                Value::Bytes(b) => Some(b.clone()),
                Value::Text(s) => Some(s.as_bytes().to_vec()),
                _ => None,
            });
            self.0.data.lock().unwrap().store.set_exchange_token(token.as_deref())?;
        }

        // 4.
        let old_uuid = self.0.data.lock().unwrap().store.get_server_uuid();
        let new_uuid = response.get("server-uuid").cloned().and_then(Value::into_text_lossy);
        if new_uuid != old_uuid {
            tracing::info!(old = ?old_uuid, new = ?new_uuid, "server uuid changed");
            self.0.reactor.fire(
                "server-uuid-changed",
                &[
                    old_uuid.clone().map(Value::Text).unwrap_or(Value::Null),
                    new_uuid.clone().map(Value::Text).unwrap_or(Value::Null),
                ],
            );
            if let Some(uuid) = &new_uuid {
                self.0.data.lock().unwrap().store.set_server_uuid(uuid)?;
            }
        }

        // 5.
        let server_api = response
            .get("server-api")
            .cloned()
            .and_then(Value::into_text_lossy)
            .unwrap_or_else(|| DEFAULT_SERVER_API.to_string());
        {
            let mut data = self.0.data.lock().unwrap();
            let current = data.store.get_server_api();
            if relay_message_store::compare_api_versions(&server_api, &current) == std::cmp::Ordering::Greater {
                let capped = if relay_message_store::compare_api_versions(&server_api, &self.0.client_api)
                    == std::cmp::Ordering::Greater
                {
                    self.0.client_api.clone()
                } else {
                    server_api.clone()
                };
                data.store.set_server_api(&capped)?;
            }
            // 6.
            data.store.commit()?;
        }

        // 7.
        let messages = response
            .get("messages")
            .and_then(Value::as_list)
            .map(|items| items.to_vec())
            .unwrap_or_default();
        for message in messages {
            let Value::Map(message) = message else { continue };
            self.handle_message(&message);
            let mut data = self.0.data.lock().unwrap();
            let next_sequence = data.store.get_server_sequence() + 1;
            data.store.set_server_sequence(next_sequence)?;
            data.store.commit()?;
        }

        // 8.
        let still_pending = !self
            .0
            .data
            .lock()
            .unwrap()
            .store
            .get_pending_messages(Some(1))?
            .is_empty();
        if still_pending && next_expected != old_sequence {
            tracing::info!("pending messages remain after the last exchange");
            self.schedule(true, false);
        }

        Ok(())
    }
}

fn hash_types(types: &[String]) -> Vec<u8> {
    md5::compute(types.join(";").as_bytes()).0.to_vec()
}

fn value_to_string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_list()
        .map(|items| items.iter().filter_map(|v| v.as_text().map(str::to_owned)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_exchange_store::ExchangeStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn new_exchange(dir: &std::path::Path, server_url: String) -> Exchange {
        let store = MessageStore::open(dir.join("queue"), dir.join("store.bin"), 1000).unwrap();
        let exchange_store = ExchangeStore::open(dir.join("context.db")).unwrap();
        let identity = Arc::new(Mutex::new(
            Identity::open(crate::identity::IdentityConfig::default(), dir.join("identity.bin")).unwrap(),
        ));
        let transport = Transport::new(relay_transport::TransportSettings::default()).unwrap();
        let reactor = Arc::new(Reactor::new());
        let config = ExchangeConfig {
            server_url,
            ..ExchangeConfig::default()
        };
        Exchange::new(
            reactor,
            transport,
            identity,
            store,
            exchange_store,
            config,
            dir.join("broker.bin"),
        )
        .unwrap()
    }

    #[test]
    fn send_without_urgent_does_not_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = new_exchange(dir.path(), "http://example.invalid".to_string());
        exchange.0.data.lock().unwrap().store.set_accepted_types(["status".to_string()]).unwrap();
        let mut message: Message = BTreeMap::new();
        message.insert("type".to_string(), Value::from("status"));
        let id = exchange.send(message, false).unwrap();
        assert!(id.is_some());
    }

    #[test]
    fn accepted_types_handler_unholds_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = new_exchange(dir.path(), "http://example.invalid".to_string());
        let mut held: Message = BTreeMap::new();
        held.insert("type".to_string(), Value::from("status"));
        exchange.send(held, false).unwrap();

        let mut accepted_types: Message = BTreeMap::new();
        accepted_types.insert("type".to_string(), Value::from("accepted-types"));
        accepted_types.insert(
            "types".to_string(),
            Value::List(vec![Value::from("status")]),
        );
        exchange.handle_message(&accepted_types);

        assert!(exchange.accepts("status"));
    }

    #[tokio::test]
    async fn exchange_round_trip_processes_messages_and_advances_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let exchange = new_exchange(dir.path(), server.uri());

        let mut response = BTreeMap::new();
        response.insert("next-expected-sequence".to_string(), Value::Int(0));
        response.insert("messages".to_string(), Value::List(vec![]));
        let body = relay_wire::encode(&Value::Map(response));

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        exchange.exchange().await;
        assert!(!exchange.0.data.lock().unwrap().exchanging);
    }

    #[tokio::test]
    async fn a_404_response_downgrades_the_server_api_and_gives_up_after_one_retry() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let exchange = new_exchange(dir.path(), server.uri());
        exchange.0.data.lock().unwrap().store.set_server_api("9.9").unwrap();

        // Every attempt 404s, including the retry after the downgrade; the
        // second failure must not recurse again (the downgrade guard only
        // fires once per exchange).
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        exchange.exchange().await;
        assert_eq!(exchange.server_api(), DEFAULT_SERVER_API);
        assert!(!exchange.0.data.lock().unwrap().exchanging);
    }
}
