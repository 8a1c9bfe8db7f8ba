//! Per-message overrides signalled through message headers.
//!
//! When the dynamic switch is enabled, `X-Blackhole-Mode` and
//! `X-Blackhole-Delay` in the header block steer the response for that one
//! message. Listener defaults are never mutated, and unrecognised or
//! malformed values are silently ignored.

use std::str::FromStr;

use blackhole_common::mode::{Delay, ResponseMode};
use mailparse::MailHeaderMap;

const MODE_HEADER: &str = "X-Blackhole-Mode";
const DELAY_HEADER: &str = "X-Blackhole-Delay";

/// Overrides extracted from one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Overrides {
    pub mode: Option<ResponseMode>,
    pub delay: Option<Delay>,
}

/// Scans the header block of `message` for signalling headers.
///
/// `timeout` is the session's idle timeout in seconds; delays must stay
/// strictly below it when it is nonzero, and never exceed the global delay
/// ceiling. `offline` cannot be honoured once a session is underway and is
/// ignored.
#[must_use]
pub fn scan(message: &[u8], timeout: u64) -> Overrides {
    let Ok((headers, _)) = mailparse::parse_headers(message) else {
        return Overrides::default();
    };

    let mode = headers
        .get_first_value(MODE_HEADER)
        .and_then(|value| ResponseMode::from_str(&value).ok())
        .filter(|mode| !mode.is_offline());

    let delay = headers
        .get_first_value(DELAY_HEADER)
        .and_then(|value| parse_delay(&value))
        .filter(|delay| delay_permitted(*delay, timeout));

    Overrides { mode, delay }
}

fn parse_delay(value: &str) -> Option<Delay> {
    let value = value.trim();
    if let Some((lo, hi)) = value.split_once('-') {
        let lo: u64 = lo.trim().parse().ok()?;
        let hi: u64 = hi.trim().parse().ok()?;
        if lo > hi {
            return None;
        }
        Some(Delay::from_bounds(lo, hi))
    } else {
        value.parse().ok().map(Delay::Fixed)
    }
}

fn delay_permitted(delay: Delay, timeout: u64) -> bool {
    if delay.max() > Delay::MAX_SECS {
        return false;
    }
    timeout == 0 || delay.max() < timeout
}

#[cfg(test)]
mod test {
    use blackhole_common::mode::{Delay, ResponseMode};

    use super::scan;

    fn message(headers: &str) -> Vec<u8> {
        format!("{headers}\r\n\r\nbody text\r\n").into_bytes()
    }

    #[test]
    fn mode_override() {
        let msg = message("Subject: test\r\nX-Blackhole-Mode: bounce");
        let overrides = scan(&msg, 60);
        assert_eq!(overrides.mode, Some(ResponseMode::Bounce));
        assert_eq!(overrides.delay, None);
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let msg = message("x-blackhole-mode: RANDOM\r\nX-BLACKHOLE-DELAY: 5");
        let overrides = scan(&msg, 60);
        assert_eq!(overrides.mode, Some(ResponseMode::Random));
        assert_eq!(overrides.delay, Some(Delay::Fixed(5)));
    }

    #[test]
    fn unknown_mode_is_ignored() {
        let msg = message("X-Blackhole-Mode: teapot");
        assert_eq!(scan(&msg, 60).mode, None);
    }

    #[test]
    fn offline_cannot_be_requested_per_message() {
        let msg = message("X-Blackhole-Mode: offline");
        assert_eq!(scan(&msg, 60).mode, None);
    }

    #[test]
    fn delay_range() {
        let msg = message("X-Blackhole-Delay: 5-10");
        assert_eq!(scan(&msg, 60).delay, Some(Delay::Range(5, 10)));
    }

    #[test]
    fn malformed_delays_are_ignored() {
        for value in ["abc", "-3", "10-5", "5-", "5--10"] {
            let msg = message(&format!("X-Blackhole-Delay: {value}"));
            assert_eq!(scan(&msg, 60).delay, None, "value {value:?}");
        }
    }

    #[test]
    fn delay_above_ceiling_is_ignored() {
        let msg = message("X-Blackhole-Delay: 61");
        assert_eq!(scan(&msg, 0).delay, None);
    }

    #[test]
    fn delay_must_stay_below_timeout() {
        let msg = message("X-Blackhole-Delay: 30");
        assert_eq!(scan(&msg, 30).delay, None);
        assert_eq!(scan(&msg, 31).delay, Some(Delay::Fixed(30)));
        assert_eq!(scan(&msg, 0).delay, Some(Delay::Fixed(30)));
    }

    #[test]
    fn headers_in_the_body_are_inert() {
        let msg = b"Subject: test\r\n\r\nX-Blackhole-Mode: bounce\r\n".to_vec();
        assert_eq!(scan(&msg, 60).mode, None);
    }

    #[test]
    fn delay_zero_is_honoured() {
        let msg = message("X-Blackhole-Delay: 0");
        assert_eq!(scan(&msg, 60).delay, Some(Delay::Fixed(0)));
    }
}
