use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the sink, with their canonical phrases.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage,
    ServiceReady,
    GoodBye,
    Ok,
    CannotVrfy,
    StartMailInput,
    Unavailable,
    MailboxBusy,
    LocalError,
    InsufficientStorage,
    UnableToQueue,
    TlsUnavailable,
    UnknownCommand,
    InvalidParameters,
    NotImplemented,
    BadSequence,
    DoesNotAcceptMail,
    MailboxUnavailable,
    UserNotLocal,
    ExceededStorage,
    NameNotAllowed,
    Blocked,
}

/// The ten codes a bounced message is refused with, drawn uniformly.
pub const BOUNCE_CODES: [Status; 10] = [
    Status::MailboxBusy,
    Status::LocalError,
    Status::InsufficientStorage,
    Status::UnableToQueue,
    Status::DoesNotAcceptMail,
    Status::MailboxUnavailable,
    Status::UserNotLocal,
    Status::ExceededStorage,
    Status::NameNotAllowed,
    Status::Blocked,
];

impl Status {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::HelpMessage => 214,
            Self::ServiceReady => 220,
            Self::GoodBye => 221,
            Self::Ok => 250,
            Self::CannotVrfy => 252,
            Self::StartMailInput => 354,
            Self::Unavailable => 421,
            Self::MailboxBusy => 450,
            Self::LocalError => 451,
            Self::InsufficientStorage => 452,
            Self::UnableToQueue => 458,
            Self::TlsUnavailable => 454,
            Self::UnknownCommand => 500,
            Self::InvalidParameters => 501,
            Self::NotImplemented => 502,
            Self::BadSequence => 503,
            Self::DoesNotAcceptMail => 521,
            Self::MailboxUnavailable => 550,
            Self::UserNotLocal => 551,
            Self::ExceededStorage => 552,
            Self::NameNotAllowed => 553,
            Self::Blocked => 571,
        }
    }

    /// The phrase conventionally paired with this code.
    #[must_use]
    pub const fn phrase(self) -> &'static str {
        match self {
            Self::HelpMessage => "2.0.0 Supported commands: DATA EHLO HELO HELP MAIL NOOP QUIT RCPT RSET VRFY",
            Self::ServiceReady => "Service ready",
            Self::GoodBye => "2.0.0 Goodbye",
            Self::Ok => "OK",
            Self::CannotVrfy => "2.1.5 Cannot VRFY user, but will accept message and attempt delivery",
            Self::StartMailInput => "Start mail input; end with <CRLF>.<CRLF>",
            Self::Unavailable => "Service not available, closing transmission channel",
            Self::MailboxBusy => "Requested mail action not taken: mailbox unavailable",
            Self::LocalError => "Requested action aborted: error in processing",
            Self::InsufficientStorage => "Requested action not taken: insufficient system storage",
            Self::UnableToQueue => "Unable to queue messages",
            Self::TlsUnavailable => "TLS not available due to temporary reason",
            Self::UnknownCommand => "Syntax error, command unrecognised",
            Self::InvalidParameters => "Syntax error in parameters or arguments",
            Self::NotImplemented => "Command not implemented",
            Self::BadSequence => "Bad sequence of commands",
            Self::DoesNotAcceptMail => "Machine does not accept mail",
            Self::MailboxUnavailable => "Requested action not taken: mailbox unavailable",
            Self::UserNotLocal => "User not local",
            Self::ExceededStorage => "Requested mail action aborted: exceeded storage allocation",
            Self::NameNotAllowed => "Requested action not taken: mailbox name not allowed",
            Self::Blocked => "Blocked",
        }
    }

    /// Checks if the status is a permanent rejection
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.code() >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        self.code() >= 400 && self.code() < 500
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", self.code())
    }
}
