//! The lightweight exchange-triggering ping (§4.H): a small periodic HTTP
//! probe asking "are there messages waiting for me?", cheaper than a full
//! exchange. Grounded on `landscape/broker/ping.py`'s `PingClient`/`Pinger`.

use relay_reactor::{CallId, Reactor};
use relay_transport::Transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::exchange::Exchange;
use crate::identity::Identity;

#[derive(Debug, Clone)]
pub struct PingerConfig {
    pub url: String,
    pub interval: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            interval: Duration::from_secs(30),
        }
    }
}

struct PingerState {
    url: String,
    interval: Duration,
    call_id: Option<CallId>,
}

struct PingerShared {
    reactor: Arc<Reactor>,
    transport: Transport,
    identity: Arc<Mutex<Identity>>,
    exchange: Exchange,
    state: Mutex<PingerState>,
}

/// Cheaply `Clone`-able handle onto the shared pinger state.
#[derive(Clone)]
pub struct Pinger(Arc<PingerShared>);

impl Pinger {
    pub fn new(
        reactor: Arc<Reactor>,
        transport: Transport,
        identity: Arc<Mutex<Identity>>,
        exchange: Exchange,
        config: PingerConfig,
    ) -> Self {
        let shared = Arc::new(PingerShared {
            reactor,
            transport,
            identity,
            exchange,
            state: Mutex::new(PingerState {
                url: config.url,
                interval: config.interval,
                call_id: None,
            }),
        });
        let pinger = Pinger(shared);

        // Another bounded, startup-only reference cycle (Pinger holds its
        // own clone inside the reactor's handler table), same trade-off
        // taken for Exchange's "resynchronize-clients" handler.
        let handler = pinger.clone();
        pinger.0.reactor.call_on("message", move |args| {
            handler.handle_set_intervals(args);
            Ok(relay_wire::Value::Null)
        });

        pinger
    }

    pub fn url(&self) -> String {
        self.0.state.lock().unwrap().url.clone()
    }

    pub fn set_url(&self, url: &str) {
        self.0.state.lock().unwrap().url = url.to_string();
    }

    pub fn interval(&self) -> Duration {
        self.0.state.lock().unwrap().interval
    }

    pub fn start(&self) {
        self.schedule(self.0.state.lock().unwrap().interval);
    }

    fn schedule(&self, interval: Duration) {
        let mut state = self.0.state.lock().unwrap();
        if let Some(id) = state.call_id.take() {
            self.0.reactor.cancel_call(id);
        }
        let pinger = self.clone();
        state.call_id = Some(self.0.reactor.call_every(interval, move || {
            let pinger = pinger.clone();
            tokio::spawn(async move {
                pinger.ping().await;
            });
        }));
    }

    /// Asks the ping URL whether messages are waiting, and if so schedules
    /// an urgent exchange. Absent an insecure id (not yet registered) this
    /// is a no-op, matching `PingClient.ping`'s `defer.succeed(False)` path.
    pub async fn ping(&self) {
        let insecure_id = self.0.identity.lock().unwrap().insecure_id();
        let Some(insecure_id) = insecure_id else {
            return;
        };
        let url = self.url();
        match self.0.transport.ping(&url, &insecure_id).await {
            Ok(body) => {
                let has_messages = match relay_wire::decode(&body) {
                    Ok(relay_wire::Value::Map(map)) => {
                        matches!(map.get("messages"), Some(relay_wire::Value::Bool(true)))
                    }
                    _ => false,
                };
                if has_messages {
                    tracing::info!("ping indicates message available, scheduling an urgent exchange");
                    self.0.exchange.schedule(true, false);
                }
            }
            Err(err) => {
                tracing::error!(%err, url = %url, "error contacting ping server");
            }
        }
    }

    fn handle_set_intervals(&self, args: &[relay_wire::Value]) {
        let Some(relay_wire::Value::Map(message)) = args.first() else {
            return;
        };
        if message.get("type").and_then(relay_wire::Value::as_text) != Some("set-intervals") {
            return;
        }
        let Some(seconds) = message.get("ping").and_then(relay_wire::Value::as_int) else {
            return;
        };
        let interval = Duration::from_secs(seconds.max(0) as u64);
        self.0.state.lock().unwrap().interval = interval;
        tracing::info!(seconds, "ping interval set");
        self.schedule(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityConfig;
    use relay_exchange_store::ExchangeStore;
    use relay_message_store::MessageStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn new_pinger(dir: &std::path::Path, url: String) -> (Pinger, Arc<Mutex<Identity>>) {
        let reactor = Arc::new(Reactor::new());
        let transport = Transport::new(relay_transport::TransportSettings::default()).unwrap();
        let identity = Arc::new(Mutex::new(
            Identity::open(IdentityConfig::default(), dir.join("identity.bin")).unwrap(),
        ));
        let store = MessageStore::open(dir.join("queue"), dir.join("store.bin"), 1000).unwrap();
        let exchange_store = ExchangeStore::open(dir.join("context.db")).unwrap();
        let exchange = Exchange::new(
            reactor.clone(),
            transport.clone(),
            identity.clone(),
            store,
            exchange_store,
            crate::exchange::ExchangeConfig::default(),
            dir.join("broker.bin"),
        )
        .unwrap();
        let pinger = Pinger::new(
            reactor,
            transport,
            identity.clone(),
            exchange,
            PingerConfig {
                url,
                interval: Duration::from_secs(30),
            },
        );
        (pinger, identity)
    }

    #[tokio::test]
    async fn ping_without_an_insecure_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let (pinger, _identity) = new_pinger(dir.path(), server.uri());
        // No mock mounted: a request here would fail the test via wiremock's
        // unexpected-request panic, proving ping() returned before sending.
        pinger.ping().await;
    }

    #[tokio::test]
    async fn ping_schedules_an_urgent_exchange_when_messages_are_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let (pinger, identity) = new_pinger(dir.path(), server.uri());
        identity.lock().unwrap().set_insecure_id(Some("7")).unwrap();

        let body = relay_wire::encode(&relay_wire::map!("messages" => true));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        pinger.ping().await;
        assert!(pinger.0.exchange.is_urgent());
    }
}
