//! Boot-time configuration: where to find the data directory, which URLs to
//! talk to, how often to exchange. Grounded on
//! `da-indexer-logic/src/settings.rs`'s `serde_with::DurationSeconds`
//! pattern and `proxy-verifier-server/src/config.rs`'s layered
//! `config::Config::builder()` (file, then environment, then CLI flags).
//!
//! The *business* configuration surface (account registration prompts,
//! rewriting an on-disk `.conf` file, systemd unit management) is out of
//! scope; this is only "how does the process learn where to run".

use crate::cli::Args;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub server_url: String,
    pub ping_url: String,

    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub exchange_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub urgent_exchange_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub ping_interval: Duration,

    pub max_messages_per_exchange: usize,
    pub client_api: String,
    pub product: String,

    pub account_name: Option<String>,
    pub computer_title: Option<String>,
    pub registration_key: Option<String>,
    pub tags: Option<Vec<String>>,
    pub access_group: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/relay-agent"),
            server_url: "https://localhost/message-system".to_string(),
            ping_url: "https://localhost/ping".to_string(),
            exchange_interval: Duration::from_secs(900),
            urgent_exchange_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            max_messages_per_exchange: 100,
            client_api: "3.3".to_string(),
            product: concat!("relay-agent/", env!("CARGO_PKG_VERSION")).to_string(),
            account_name: None,
            computer_title: None,
            registration_key: None,
            tags: None,
            access_group: None,
        }
    }
}

const ENV_PREFIX: &str = "RELAY_AGENT";

impl Settings {
    /// Layers, lowest priority first: built-in defaults, an optional config
    /// file, `RELAY_AGENT__*` environment variables, then CLI flags.
    pub fn build(args: &Args) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);
        if let Some(path) = &args.config_path {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Some(data_dir) = &args.data_dir {
            settings.data_dir = data_dir.clone();
        }
        if let Some(server_url) = &args.server_url {
            settings.server_url = server_url.clone();
        }
        if let Some(ping_url) = &args.ping_url {
            settings.ping_url = ping_url.clone();
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            config_path: None,
            data_dir: None,
            server_url: None,
            ping_url: None,
            once: false,
            verbose: 0,
            quiet: false,
        }
    }

    #[test]
    fn build_without_overrides_falls_back_to_defaults() {
        let settings = Settings::build(&args()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn cli_flags_override_the_config_file() {
        let mut a = args();
        a.server_url = Some("https://example.test/message-system".to_string());
        let settings = Settings::build(&a).unwrap();
        assert_eq!(settings.server_url, "https://example.test/message-system");
    }
}
