use core::fmt::{self, Display, Formatter};

use crate::command::Command;

/// Protocol phase of a session.
///
/// The happy path runs `Connected` through `DataBody` in order; `Quit` is
/// terminal. Timeouts and disconnects terminate a session from any phase
/// without passing through a dedicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Banner sent, no greeting received yet.
    Connected,
    /// HELO or EHLO accepted; envelope is empty.
    HeloDone,
    /// MAIL FROM recorded.
    MailDone,
    /// At least one RCPT TO recorded.
    RcptDone,
    /// Between the 354 go-ahead and the terminating dot.
    DataBody,
    /// QUIT acknowledged; the connection is closing.
    Quit,
}

impl State {
    /// Whether `command` is in sequence for this phase.
    ///
    /// Commands that are always answerable (NOOP, HELP, QUIT and friends)
    /// are permitted everywhere; envelope commands follow the RFC 5321
    /// ordering. Nothing is dispatched in `DataBody`, where lines are
    /// message content.
    #[must_use]
    pub fn permits(self, command: &Command) -> bool {
        if self == Self::DataBody {
            return false;
        }

        match command {
            Command::Helo(_) | Command::Ehlo(_) | Command::Rset => true,
            Command::Noop
            | Command::Vrfy
            | Command::Expn
            | Command::Help
            | Command::Quit
            | Command::Invalid(_)
            | Command::Unknown(_) => true,
            Command::StartTls => self == Self::HeloDone,
            Command::MailFrom(_) => self == Self::HeloDone,
            Command::RcptTo(_) => matches!(self, Self::MailDone | Self::RcptDone),
            Command::Data => self == Self::RcptDone,
        }
    }

    /// The phase that follows a permitted `command`.
    #[must_use]
    pub fn after(self, command: &Command) -> Self {
        match command {
            Command::Helo(_) | Command::Ehlo(_) | Command::Rset => Self::HeloDone,
            Command::MailFrom(_) => Self::MailDone,
            Command::RcptTo(_) => Self::RcptDone,
            Command::Data => Self::DataBody,
            Command::Quit => Self::Quit,
            _ => self,
        }
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connected => "connected",
            Self::HeloDone => "helo",
            Self::MailDone => "mail",
            Self::RcptDone => "rcpt",
            Self::DataBody => "data",
            Self::Quit => "quit",
        })
    }
}
