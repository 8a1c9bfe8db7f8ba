use core::fmt::{self, Display, Formatter};

/// One parsed client command line.
///
/// The sink records envelope addresses verbatim with their angle brackets
/// stripped; it deliberately performs no mailbox syntax validation.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// An empty string is the null reverse-path `<>`.
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Expn,
    Help,
    Quit,
    StartTls,
    /// A recognised verb with unusable arguments, answered with 501.
    Invalid(&'static str),
    /// Anything else, answered with 500.
    Unknown(String),
}

impl Command {
    /// Parses one command line. Never fails; unusable input maps onto the
    /// `Invalid` and `Unknown` variants.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();

        if let Some(rest) = prefixed(trimmed, "MAIL FROM:") {
            return match address_of(rest) {
                Some(address) => Self::MailFrom(address),
                None => Self::Invalid("expected a reverse-path after MAIL FROM:"),
            };
        }
        if let Some(rest) = prefixed(trimmed, "RCPT TO:") {
            return match address_of(rest) {
                Some(address) if !address.is_empty() => Self::RcptTo(address),
                _ => Self::Invalid("expected a forward-path after RCPT TO:"),
            };
        }
        if let Some(rest) = prefixed(trimmed, "HELO") {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return helo_argument(rest).map_or(
                    Self::Invalid("expected a hostname after HELO"),
                    Self::Helo,
                );
            }
        }
        if let Some(rest) = prefixed(trimmed, "EHLO") {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return helo_argument(rest).map_or(
                    Self::Invalid("expected a hostname after EHLO"),
                    Self::Ehlo,
                );
            }
        }

        let verb = trimmed
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match verb.as_str() {
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "VRFY" => Self::Vrfy,
            "EXPN" => Self::Expn,
            "HELP" => Self::Help,
            "QUIT" => Self::Quit,
            "STARTTLS" => Self::StartTls,
            _ => Self::Unknown(trimmed.to_owned()),
        }
    }
}

/// Case-insensitive prefix match, returning the remainder.
///
/// Compared as bytes so that a multi-byte character straddling the prefix
/// boundary cannot split a `char`.
fn prefixed<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let bytes = line.as_bytes();
    if bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Extracts the address token, stripping angle brackets and trailing ESMTP
/// parameters such as `SIZE=` or `BODY=`, which the sink ignores.
fn address_of(rest: &str) -> Option<String> {
    let rest = rest.trim_start();
    let token = rest.split_whitespace().next()?;
    Some(
        token
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_owned(),
    )
}

fn helo_argument(rest: &str) -> Option<String> {
    let host = rest.trim();
    (!host.is_empty()).then(|| host.to_owned())
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(fmt, "HELO {host}"),
            Self::Ehlo(host) => write!(fmt, "EHLO {host}"),
            Self::MailFrom(sender) => write!(fmt, "MAIL FROM:<{sender}>"),
            Self::RcptTo(recipient) => write!(fmt, "RCPT TO:<{recipient}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Vrfy => fmt.write_str("VRFY"),
            Self::Expn => fmt.write_str("EXPN"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Invalid(reason) => write!(fmt, "invalid: {reason}"),
            Self::Unknown(line) => fmt.write_str(line),
        }
    }
}
