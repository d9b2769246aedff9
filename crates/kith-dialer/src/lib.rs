//! kith-dialer: authenticated, multiplexed links between friends.
//!
//! A [`Dialer`] keeps a pool of encrypted TCP connections to every friend
//! and opens named byte channels over them. Each physical [`Connection`]
//! carries one channel ([`Handoff`]) at a time; a cheap orientation
//! exchange decides which end opens when both try at once.

pub mod conn;
pub mod dialer;
pub mod fdlimit;
pub mod handoff;
pub mod handshake;
pub mod orient;
pub mod snapshot;
pub mod stream;
pub mod telephone;
pub mod tube;

pub use conn::{ConnError, Connection, Incoming, Regime, Tags};
pub use dialer::{Dialer, DialerError};
pub use fdlimit::{FdError, FdLimiter};
pub use handoff::{Handoff, HandoffStats};
pub use handshake::{HandshakeError, Side};
pub use snapshot::{DialerSnapshot, Presence, StatusUpdate, TelephoneSnapshot};
pub use stream::PeerStream;
pub use tube::{Tube, TubeError};
