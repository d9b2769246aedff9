//! Exponentially-decaying uptime rating.
//!
//! The rating starts at 1.0. Time spent up multiplies it by `2^(t/halflife)`,
//! time spent down by `2^(-t/halflife)`. Each transition charges the elapsed
//! interval to the state being left. The result is clamped to
//! `[1/bound, bound]`.

use std::time::{Duration, Instant};

pub const INITIAL_RATING: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Uptime {
    halflife: Duration,
    bound: f64,
    rating: f64,
    up: bool,
    last_up: Option<Instant>,
    last_down: Option<Instant>,
    last_change: Instant,
}

impl Uptime {
    /// A fresh tracker, considered down as of now.
    pub fn new(halflife: Duration, bound: f64) -> Self {
        Self::starting_at(halflife, bound, Instant::now())
    }

    pub fn starting_at(halflife: Duration, bound: f64, now: Instant) -> Self {
        Self {
            halflife,
            bound,
            rating: INITIAL_RATING,
            up: false,
            last_up: None,
            last_down: None,
            last_change: now,
        }
    }

    pub fn up(&mut self) -> f64 {
        self.up_at(Instant::now())
    }

    pub fn down(&mut self) -> f64 {
        self.down_at(Instant::now())
    }

    pub fn up_at(&mut self, now: Instant) -> f64 {
        self.charge(now);
        self.up = true;
        self.last_up = Some(now);
        self.rating
    }

    pub fn down_at(&mut self, now: Instant) -> f64 {
        self.charge(now);
        self.up = false;
        self.last_down = Some(now);
        self.rating
    }

    fn charge(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_change).as_secs_f64();
        let halflife = self.halflife.as_secs_f64().max(f64::MIN_POSITIVE);
        let exponent = if self.up { elapsed / halflife } else { -elapsed / halflife };
        self.rating = (self.rating * exponent.exp2()).clamp(1.0 / self.bound, self.bound);
        self.last_change = now;
    }

    pub fn rating(&self) -> f64 {
        self.rating
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Time since the last up transition, if currently up.
    pub fn uptime(&self) -> Duration {
        match (self.up, self.last_up) {
            (true, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Time since the last down transition, if currently down.
    pub fn downtime(&self) -> Duration {
        match (self.up, self.last_down) {
            (false, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        }
    }
}
