//! The message exchange protocol engine, pinger and registration (§4.G-4.I):
//! the pieces that turn a `relay-message-store` queue plus a
//! `relay-transport` client into the actual running protocol, wired together
//! on a `relay-reactor`.

mod error;
mod exchange;
mod identity;
mod pinger;
mod registration;
mod sysinfo;

pub use error::BrokerError;
pub use exchange::{Exchange, ExchangeConfig};
pub use identity::{Identity, IdentityConfig};
pub use pinger::{Pinger, PingerConfig};
pub use registration::{Registration, RegistrationConfig};
