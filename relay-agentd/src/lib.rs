//! Wires `relay-wire`/`relay-transport`/`relay-persist`/`relay-message-store`/
//! `relay-exchange-store`/`relay-reactor`/`relay-broker` into a running
//! process: the ambient stack (`main.rs`/`settings.rs`/`cli.rs`) the core
//! crates don't own themselves, following `basic-cache-server`'s split
//! between a thin `main.rs` and a library `run(settings)` entrypoint.

pub mod cli;
pub mod settings;

pub use cli::Args;
pub use settings::Settings;

use relay_broker::{Exchange, ExchangeConfig, Identity, IdentityConfig, Pinger, PingerConfig, Registration, RegistrationConfig};
use relay_exchange_store::ExchangeStore;
use relay_message_store::MessageStore;
use relay_reactor::Reactor;
use relay_transport::{Transport, TransportSettings};
use std::sync::{Arc, Mutex};

const SERVICE_NAME: &str = "relay-agentd";
const DIRECTORY_SIZE: usize = 1000;

pub async fn run(settings: Settings, once: bool) -> anyhow::Result<()> {
    tracing::info!(data_dir = %settings.data_dir.display(), server_url = %settings.server_url, "starting message exchange agent");

    std::fs::create_dir_all(&settings.data_dir)?;

    let reactor = Arc::new(Reactor::new());
    let transport = Transport::new(TransportSettings {
        product: settings.product.clone(),
        ..TransportSettings::default()
    })?;

    let identity = Arc::new(Mutex::new(Identity::open(
        IdentityConfig {
            computer_title: settings.computer_title.clone(),
            account_name: settings.account_name.clone(),
            registration_key: settings.registration_key.clone(),
            tags: settings.tags.clone(),
            access_group: settings.access_group.clone(),
        },
        settings.data_dir.join("identity.bin"),
    )?));

    let store = MessageStore::open(
        settings.data_dir.join("messages"),
        settings.data_dir.join("store.bin"),
        DIRECTORY_SIZE,
    )?;
    let exchange_store = ExchangeStore::open(settings.data_dir.join("context.db"))?;

    let exchange = Exchange::new(
        reactor.clone(),
        transport.clone(),
        identity.clone(),
        store,
        exchange_store,
        ExchangeConfig {
            server_url: settings.server_url.clone(),
            exchange_interval: settings.exchange_interval,
            urgent_exchange_interval: settings.urgent_exchange_interval,
            max_messages: settings.max_messages_per_exchange,
            client_api: settings.client_api.clone(),
        },
        settings.data_dir.join("broker.bin"),
    )?;

    let pinger = Pinger::new(
        reactor.clone(),
        transport,
        identity.clone(),
        exchange.clone(),
        PingerConfig {
            url: settings.ping_url.clone(),
            interval: settings.ping_interval,
        },
    );

    let registration = Registration::new(
        reactor,
        exchange.clone(),
        identity,
        RegistrationConfig::default(),
    );

    if once {
        tracing::info!("running a single exchange (--once)");
        exchange.exchange().await;
        return Ok(());
    }

    if registration.should_register() {
        tracing::info!("not yet registered, requesting registration");
        match registration.register().await {
            Ok(()) => tracing::info!("registration accepted"),
            Err(reason) => tracing::warn!(%reason, "registration did not complete immediately, exchanges will keep retrying"),
        }
    }

    exchange.start();
    pinger.start();

    tracing::info!(service = SERVICE_NAME, "agent running, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping");
    exchange.stop();

    Ok(())
}

/// Initializes `tracing-subscriber` at a verbosity derived from `-v`/`-q`
/// flag counts, following the teacher's `tracing::init_logs` convention
/// (env-filter layered subscriber, defaulting to `info`).
pub fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{SERVICE_NAME}={level},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
