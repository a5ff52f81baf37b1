//! Registering this computer with the server and handling the server's
//! reply (§4.I). Grounded on `landscape/client/broker/registration.py`'s
//! `RegistrationHandler`.

use relay_reactor::Reactor;
use relay_wire::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::exchange::Exchange;
use crate::identity::Identity;
use crate::sysinfo;

const JUJU_INFO_MIN_API: &str = "3.3";

#[derive(Debug, Clone, Default)]
pub struct RegistrationConfig {
    /// Opaque juju deployment metadata, included in the registration
    /// message only once the server has told us it speaks API >= 3.3.
    pub juju_info: Option<Value>,
}

type PendingSender = Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>>;

struct RegistrationShared {
    reactor: Arc<Reactor>,
    exchange: Exchange,
    identity: Arc<Mutex<Identity>>,
    juju_info: Option<Value>,
    pending: Mutex<Option<PendingSender>>,
    /// Set while `register()` is awaiting an outcome; gates
    /// `handle_exchange_done`'s "schedule another exchange" retry so it
    /// doesn't spin once nobody is actually waiting to register.
    registering: Mutex<bool>,
}

/// Cheaply `Clone`-able handle onto the shared registration state.
#[derive(Clone)]
pub struct Registration(Arc<RegistrationShared>);

impl Registration {
    pub fn new(
        reactor: Arc<Reactor>,
        exchange: Exchange,
        identity: Arc<Mutex<Identity>>,
        config: RegistrationConfig,
    ) -> Self {
        let shared = Arc::new(RegistrationShared {
            reactor,
            exchange,
            identity,
            juju_info: config.juju_info,
            pending: Mutex::new(None),
            registering: Mutex::new(false),
        });
        let registration = Registration(shared);
        registration.0.exchange.add_schema("register", "3.2", |m| Ok(m));

        // `Registration` holding an `Exchange` clone inside closures that
        // `Exchange` itself owns (via `register_message`) is a deliberate,
        // bounded reference cycle: both are constructed once at process
        // startup and live for the process lifetime, so nothing ever leaks
        // beyond this single pair.
        let pre_exchange = registration.clone();
        registration.0.reactor.call_on("pre-exchange", move |_| {
            pre_exchange.handle_pre_exchange();
            Ok(Value::Null)
        });

        let exchange_done = registration.clone();
        registration.0.reactor.call_on("exchange-done", move |_| {
            exchange_done.handle_exchange_done();
            Ok(Value::Null)
        });

        let set_id = registration.clone();
        registration.0.exchange.register_message("set-id", move |message| {
            set_id.handle_set_id(message);
        });

        let unknown_id = registration.clone();
        registration.0.exchange.register_message("unknown-id", move |message| {
            unknown_id.handle_unknown_id(message);
        });

        let registration_result = registration.clone();
        registration
            .0
            .exchange
            .register_message("registration", move |message| {
                registration_result.handle_registration(message);
            });

        registration
    }

    /// Mirrors the original's `_should_register`: a secure id is still
    /// missing, an account name and computer title have been configured,
    /// and the server has told us it accepts `register` (learned from a
    /// prior exchange's `accepted-types`/response). Without the last
    /// conjunct this fires before the server can possibly accept the
    /// message, which is why registration is a two-exchange handshake.
    pub fn should_register(&self) -> bool {
        let identity = self.0.identity.lock().unwrap();
        identity.secure_id().is_none()
            && identity.computer_title().is_some()
            && identity.account_name().is_some()
            && self.0.exchange.accepts("register")
    }

    /// Clears any stale id, enqueues a fresh `register` message, and
    /// resolves once the server answers with `set-id` or `registration`
    /// (unknown-account/max-pending-computers).
    pub async fn register(&self) -> Result<(), String> {
        {
            let mut identity = self.0.identity.lock().unwrap();
            identity.set_secure_id(None).map_err(|e| e.to_string())?;
            identity.set_insecure_id(None).map_err(|e| e.to_string())?;
            identity.commit().map_err(|e| e.to_string())?;
        }

        let (tx, rx) = oneshot::channel();
        let sender: PendingSender = Arc::new(Mutex::new(Some(tx)));
        *self.0.pending.lock().unwrap() = Some(sender);
        *self.0.registering.lock().unwrap() = true;

        self.0.exchange.schedule(true, true);

        let outcome = rx.await.unwrap_or_else(|_| Err("registration was cancelled".to_string()));
        *self.0.registering.lock().unwrap() = false;
        outcome
    }

    fn resolve(&self, outcome: Result<(), String>) {
        let sender = self.0.pending.lock().unwrap().take();
        if let Some(sender) = sender {
            if let Some(tx) = sender.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
        }
    }

    fn handle_pre_exchange(&self) {
        if !self.should_register() {
            return;
        }
        let identity = self.0.identity.lock().unwrap();
        let mut message = BTreeMap::new();
        message.insert("type".to_string(), Value::from("register"));
        message.insert("hostname".to_string(), Value::from(sysinfo::hostname()));
        if let Some(account) = identity.account_name() {
            message.insert("account_name".to_string(), Value::from(account));
        }
        if let Some(title) = identity.computer_title() {
            message.insert("computer_title".to_string(), Value::from(title));
        }
        if let Some(key) = identity.registration_key() {
            message.insert("registration_password".to_string(), Value::from(key));
        }
        if let Some(tags) = identity.tags() {
            message.insert(
                "tags".to_string(),
                Value::List(tags.iter().map(|t| Value::from(t.as_str())).collect()),
            );
        }
        if let Some(access_group) = identity.access_group() {
            message.insert("access_group".to_string(), Value::from(access_group));
        }
        if let Some(container) = sysinfo::container_info() {
            message.insert("container-info".to_string(), Value::from(container));
        }
        if let Some(vm) = sysinfo::vm_info() {
            message.insert("vm-info".to_string(), Value::from(vm));
        }

        let server_api = self.0.exchange.server_api();
        if relay_message_store::compare_api_versions(&server_api, JUJU_INFO_MIN_API) != Ordering::Less {
            if let Some(juju_info) = &self.0.juju_info {
                message.insert("juju-info".to_string(), juju_info.clone());
            }
        }
        drop(identity);

        if let Err(err) = self.0.exchange.delete_all_messages() {
            tracing::error!(%err, "failed to clear pending messages before registering");
        }
        if let Err(err) = self.0.exchange.send(message, true) {
            tracing::error!(%err, "failed to queue registration message");
        }
    }

    /// If we're still waiting to register, schedule another exchange: the
    /// first exchange only learns the server's accepted types (which is
    /// what makes `register` acceptable in the first place); the register
    /// message itself goes out on the exchange after that. Gated on
    /// `registering` so this doesn't keep scheduling once nothing is
    /// actually waiting on a `register()` call.
    fn handle_exchange_done(&self) {
        if *self.0.registering.lock().unwrap() && self.should_register() {
            self.0.exchange.schedule(true, false);
        }
    }

    fn handle_set_id(&self, message: &relay_message_store::Message) {
        let secure_id = message.get("id").and_then(Value::as_text).map(str::to_string);
        let insecure_id = message
            .get("insecure-id")
            .and_then(Value::as_text)
            .map(str::to_string);
        {
            let mut identity = self.0.identity.lock().unwrap();
            if let Err(err) = identity.set_secure_id(secure_id.as_deref()) {
                tracing::error!(%err, "failed to persist secure id");
            }
            if let Err(err) = identity.set_insecure_id(insecure_id.as_deref()) {
                tracing::error!(%err, "failed to persist insecure id");
            }
            if let Err(err) = identity.commit() {
                tracing::error!(%err, "failed to commit identity");
            }
        }
        tracing::info!("registration accepted, server confirmed new secure id");
        self.0.reactor.fire("registration-done", &[]);
        self.0.reactor.fire("resynchronize-clients", &[Value::Null]);
        self.resolve(Ok(()));
    }

    fn handle_registration(&self, message: &relay_message_store::Message) {
        let info = message.get("info").and_then(Value::as_text).unwrap_or_default();
        if info == "unknown-account" || info == "max-pending-computers" {
            tracing::warn!(reason = info, "server refused registration");
            self.0.reactor.fire("registration-failed", &[Value::from(info)]);
            self.resolve(Err(info.to_string()));
        }
    }

    fn handle_unknown_id(&self, _message: &relay_message_store::Message) {
        let clone_of = {
            let mut identity = self.0.identity.lock().unwrap();
            let clone_of = identity.insecure_id();
            if let Err(err) = identity.set_secure_id(None) {
                tracing::error!(%err, "failed to clear secure id");
            }
            if let Err(err) = identity.set_insecure_id(None) {
                tracing::error!(%err, "failed to clear insecure id");
            }
            identity.mark_as_clone(clone_of.as_deref());
            clone_of
        };
        tracing::warn!(clone_of = ?clone_of, "server reports this computer is a clone, re-registering");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeConfig;
    use crate::identity::IdentityConfig;
    use relay_exchange_store::ExchangeStore;
    use relay_message_store::MessageStore;
    use relay_transport::{Transport, TransportSettings};

    fn new_registration(dir: &std::path::Path) -> (Registration, Arc<Mutex<Identity>>, Exchange) {
        let reactor = Arc::new(Reactor::new());
        let transport = Transport::new(TransportSettings::default()).unwrap();
        let identity = Arc::new(Mutex::new(
            Identity::open(
                IdentityConfig {
                    computer_title: Some("test-host".to_string()),
                    account_name: Some("acme".to_string()),
                    ..Default::default()
                },
                dir.join("identity.bin"),
            )
            .unwrap(),
        ));
        let store = MessageStore::open(dir.join("queue"), dir.join("store.bin"), 1000).unwrap();
        let exchange_store = ExchangeStore::open(dir.join("context.db")).unwrap();
        let exchange = Exchange::new(
            reactor.clone(),
            transport,
            identity.clone(),
            store,
            exchange_store,
            ExchangeConfig::default(),
            dir.join("broker.bin"),
        )
        .unwrap();
        let registration = Registration::new(reactor, exchange.clone(), identity.clone(), RegistrationConfig::default());
        (registration, identity, exchange)
    }

    /// Simulates the first exchange's response having told us `register`
    /// is now an acceptable outbound type.
    fn accept_register(exchange: &Exchange) {
        let mut accepted_types: relay_message_store::Message = BTreeMap::new();
        accepted_types.insert("type".to_string(), Value::from("accepted-types"));
        accepted_types.insert("types".to_string(), Value::List(vec![Value::from("register")]));
        exchange.handle_message(&accepted_types);
    }

    #[test]
    fn should_register_requires_an_accepted_register_type_and_a_configured_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, identity, exchange) = new_registration(dir.path());
        // The server hasn't told us it accepts `register` yet.
        assert!(!registration.should_register());

        accept_register(&exchange);
        assert!(registration.should_register());

        identity.lock().unwrap().set_secure_id(Some("abc")).unwrap();
        assert!(!registration.should_register());
    }

    #[test]
    fn pre_exchange_queues_a_register_message() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, _identity, exchange) = new_registration(dir.path());
        accept_register(&exchange);
        assert_eq!(exchange.pending_message_count().unwrap(), 0);
        registration.handle_pre_exchange();
        assert_eq!(exchange.pending_message_count().unwrap(), 1);
    }

    #[test]
    fn pre_exchange_discards_previously_queued_messages_before_registering() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, _identity, exchange) = new_registration(dir.path());
        accept_register(&exchange);
        exchange.add_schema("status", "3.2", |m| Ok(m));
        exchange.send(BTreeMap::from([("type".to_string(), Value::from("status"))]), false).unwrap();
        assert_eq!(exchange.pending_message_count().unwrap(), 1);

        registration.handle_pre_exchange();

        // The stale "status" message is gone; only the fresh "register" remains.
        assert_eq!(exchange.pending_message_count().unwrap(), 1);
    }

    #[test]
    fn exchange_done_schedules_another_exchange_while_registration_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, _identity, exchange) = new_registration(dir.path());
        accept_register(&exchange);
        *registration.0.registering.lock().unwrap() = true;

        assert!(!exchange.is_urgent());
        registration.handle_exchange_done();
        assert!(exchange.is_urgent());
    }

    #[test]
    fn set_id_resolves_should_register_to_false() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, identity, exchange) = new_registration(dir.path());
        accept_register(&exchange);
        let mut message: relay_message_store::Message = BTreeMap::new();
        message.insert("id".to_string(), Value::from("secure-1"));
        message.insert("insecure-id".to_string(), Value::from("7"));
        registration.handle_set_id(&message);
        assert_eq!(identity.lock().unwrap().secure_id(), Some("secure-1".to_string()));
        assert_eq!(identity.lock().unwrap().insecure_id(), Some("7".to_string()));
        assert!(!registration.should_register());
    }

    #[test]
    fn unknown_id_clears_ids_and_marks_the_identity_as_a_clone() {
        let dir = tempfile::tempdir().unwrap();
        let (registration, identity, _exchange) = new_registration(dir.path());
        identity.lock().unwrap().set_secure_id(Some("abc")).unwrap();
        identity.lock().unwrap().set_insecure_id(Some("7")).unwrap();
        let message: relay_message_store::Message = BTreeMap::new();
        registration.handle_unknown_id(&message);
        assert_eq!(identity.lock().unwrap().secure_id(), None);
        assert_eq!(identity.lock().unwrap().computer_title(), Some("test-host (clone of 7)"));
    }
}
