//! kith-core: identities, crypto primitives, wire messages, and config.
//! The dialer and the daemon both depend on this crate.

pub mod backoff;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod uptime;
pub mod wire;

pub use config::{DialerSettings, FriendConfig, KithConfig};
pub use identity::{AcceptKey, DialKey, LinkKey, LocalAuth, PeerId, RemoteAuth};
