use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

/// How the server answers a completed message.
///
/// The `_delay` variants behave as their base mode and additionally force a
/// reply delay: when no delay is configured for the listener and none is
/// supplied per message, one is drawn uniformly from 1..=60 seconds.
/// `Offline` drops the accepted connection without writing any bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Accept,
    Bounce,
    Random,
    AcceptDelay,
    BounceDelay,
    RandomDelay,
    Offline,
}

impl ResponseMode {
    #[must_use]
    pub const fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }

    /// Whether this mode insists on delaying the final reply even when the
    /// listener carries no delay of its own.
    #[must_use]
    pub const fn forces_delay(self) -> bool {
        matches!(
            self,
            Self::AcceptDelay | Self::BounceDelay | Self::RandomDelay
        )
    }

    /// The underlying accept/bounce/random disposition, with the delay
    /// aspect stripped.
    #[must_use]
    pub const fn base(self) -> Self {
        match self {
            Self::Accept | Self::AcceptDelay => Self::Accept,
            Self::Bounce | Self::BounceDelay => Self::Bounce,
            Self::Random | Self::RandomDelay => Self::Random,
            Self::Offline => Self::Offline,
        }
    }
}

impl Default for ResponseMode {
    fn default() -> Self {
        Self::Accept
    }
}

impl FromStr for ResponseMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "bounce" => Ok(Self::Bounce),
            "random" => Ok(Self::Random),
            "accept_delay" => Ok(Self::AcceptDelay),
            "bounce_delay" => Ok(Self::BounceDelay),
            "random_delay" => Ok(Self::RandomDelay),
            "offline" => Ok(Self::Offline),
            _ => Err(()),
        }
    }
}

impl Display for ResponseMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Accept => "accept",
            Self::Bounce => "bounce",
            Self::Random => "random",
            Self::AcceptDelay => "accept_delay",
            Self::BounceDelay => "bounce_delay",
            Self::RandomDelay => "random_delay",
            Self::Offline => "offline",
        })
    }
}

/// Seconds to wait between end-of-data and the final reply.
///
/// A range draws one value uniformly per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Fixed(u64),
    Range(u64, u64),
}

impl Delay {
    /// Largest delay value accepted anywhere in the configuration.
    pub const MAX_SECS: u64 = 60;

    /// Builds a delay from inclusive bounds, collapsing `lo == hi`.
    #[must_use]
    pub const fn from_bounds(lo: u64, hi: u64) -> Self {
        if lo == hi {
            Self::Fixed(lo)
        } else {
            Self::Range(lo, hi)
        }
    }

    /// One concrete number of seconds for this message.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> u64 {
        match *self {
            Self::Fixed(secs) => secs,
            Self::Range(lo, hi) => rng.gen_range(lo..=hi),
        }
    }

    /// Largest value this delay can produce.
    #[must_use]
    pub const fn max(&self) -> u64 {
        match *self {
            Self::Fixed(secs) => secs,
            Self::Range(_, hi) => hi,
        }
    }
}

impl Display for Delay {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Fixed(secs) => write!(fmt, "{secs}"),
            Self::Range(lo, hi) => write!(fmt, "{lo}-{hi}"),
        }
    }
}
