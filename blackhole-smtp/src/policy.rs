//! The response policy: what the server says once a message is complete.

use core::fmt::{self, Display, Formatter};

use blackhole_common::mode::ResponseMode;
use blackhole_common::status::{Status, BOUNCE_CODES};
use rand::Rng;

/// The final reply for one message.
///
/// Renders as the wire line `<code> <text>`; the status is kept alongside
/// so callers can classify the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    text: String,
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.status, self.text)
    }
}

/// Decides the final reply for a completed message.
///
/// `accept` acknowledges with a queue id, `bounce` refuses with one of the
/// ten fixed codes drawn uniformly, and `random` flips a fair coin between
/// the two. The delay aspect of a mode is handled by the session before
/// this is called.
pub fn final_reply<R: Rng>(mode: ResponseMode, rng: &mut R) -> Reply {
    let mode = match mode.base() {
        ResponseMode::Random => {
            if rng.gen_bool(0.5) {
                ResponseMode::Accept
            } else {
                ResponseMode::Bounce
            }
        }
        other => other,
    };

    match mode {
        ResponseMode::Accept => Reply {
            status: Status::Ok,
            text: format!("OK: queued as {}", message_id(rng)),
        },
        _ => {
            let status = bounce_code(rng);
            Reply {
                status,
                text: status.phrase().to_owned(),
            }
        }
    }
}

/// One of the ten refusal codes, drawn uniformly.
pub fn bounce_code<R: Rng>(rng: &mut R) -> Status {
    BOUNCE_CODES[rng.gen_range(0..BOUNCE_CODES.len())]
}

/// A short random queue token, 64 bits of hex.
///
/// Unique within a session; collisions across the fleet are tolerated.
pub fn message_id<R: Rng>(rng: &mut R) -> String {
    format!("{:016x}", rng.gen::<u64>())
}
