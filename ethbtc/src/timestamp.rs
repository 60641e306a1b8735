use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Any timestamp at or above this value is interpreted as Unix time by
/// `OP_CHECKLOCKTIMEVERIFY`; anything below is a block height.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// An exact time and date used to represent absolute timelocks
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    // This will work until 2106
    #[allow(clippy::cast_possible_truncation)]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();

        Timestamp(secs as u32)
    }

    pub fn plus(self, seconds: u32) -> Self {
        Self(self.0.saturating_add(seconds))
    }

    pub fn minus(self, seconds: u32) -> Self {
        Self(self.0.saturating_sub(seconds))
    }

    pub fn is_unix_time(self) -> bool {
        self.0 >= LOCKTIME_THRESHOLD
    }

    /// Seconds from `self` until `other`, zero if `other` is not later.
    pub fn seconds_until(self, other: Timestamp) -> u32 {
        other.0.saturating_sub(self.0)
    }
}

/// The u32 input is the number of seconds since epoch
impl From<u32> for Timestamp {
    fn from(item: u32) -> Self {
        Self(item)
    }
}

/// The u32 returned is the number of seconds since epoch
impl From<Timestamp> for u32 {
    fn from(item: Timestamp) -> Self {
        item.0
    }
}

/// The i64 returned is the number of seconds since epoch
impl From<Timestamp> for i64 {
    fn from(item: Timestamp) -> Self {
        i64::from(item.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source of the current time for timelock decisions.
///
/// The services never call [`Timestamp::now`] directly so that expiry can be
/// simulated.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
