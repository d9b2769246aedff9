//! Orientation tie-break for opening a logical channel.
//!
//! Either end of a link may try to open a channel at any moment. The side
//! that wants to dial sends an [`Orient`] and reads one back. What comes back
//! is either the peer's echo (same session, order + 1) or the peer's own
//! concurrent request. [`resolve`] turns that pair into a role both sides
//! agree on without another round trip.

use rand::Rng;

use kith_core::wire::{Orient, ORIENT_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// We name the subject and start the channel.
    Opener,
    /// The peer's request prevails; we read its subject.
    Acceptor,
    /// Both requests are identical. Neither side opens.
    Collision,
}

/// Decide our role given the orient we sent and the one we read back.
///
/// An echo of our own request makes us the opener. For two concurrent
/// requests the lower `(order, session)` pair wins.
pub fn resolve(ours: &Orient, theirs: &Orient) -> Orientation {
    if *theirs == ours.echo() {
        return Orientation::Opener;
    }
    match (ours.order(), ours.session()).cmp(&(theirs.order(), theirs.session())) {
        std::cmp::Ordering::Less => Orientation::Opener,
        std::cmp::Ordering::Greater => Orientation::Acceptor,
        std::cmp::Ordering::Equal => Orientation::Collision,
    }
}

/// Where a connection draws its orientation orders from.
#[derive(Debug, Clone, Copy, Default)]
pub enum OrderSource {
    #[default]
    Random,
    /// Always the same order; sessions stay random.
    Fixed(u32),
}

impl OrderSource {
    pub fn next_orient(&self) -> Orient {
        let mut rng = rand::thread_rng();
        let order = match self {
            OrderSource::Random => rng.gen_range(0..ORIENT_MAX),
            OrderSource::Fixed(order) => *order,
        };
        Orient::new(order, rng.gen())
    }
}
