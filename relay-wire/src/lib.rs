//! Payload codec for the message-exchange wire format.
//!
//! See the core specification, §4.A and §6.1, for the protocol calibration
//! this module implements.

mod codec;
mod error;
mod value;

pub use codec::{decode, encode};
pub use error::DecodeError;
pub use value::Value;
