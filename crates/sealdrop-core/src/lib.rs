//! Sealdrop core library.
//!
//! Everything the server, balancer and client binaries share:
//! the hybrid encryption envelope, command authentication codes,
//! the message record model, the replicated store, wire framing,
//! configuration types, the user registry and key provisioning.

pub mod authcode;
pub mod config;
pub mod envelope;
pub mod keys;
pub mod record;
pub mod registry;
pub mod store;
pub mod wire;

pub use authcode::{AuthCodeError, AuthCodeKey};
pub use envelope::{EnvelopeError, EnvelopeParts};
pub use record::MessageRecord;
