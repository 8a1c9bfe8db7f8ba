use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blackhole_common::error::SessionError;
use blackhole_common::mode::{Delay, ResponseMode};
use blackhole_common::status::Status;
use blackhole_common::Signal;
use blackhole_common::{incoming, internal, outgoing};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::command::Command;
use crate::connection::{Connection, Line};
use crate::state::State;
use crate::{policy, switch, MAX_COMMAND_LINE};

/// Everything a session inherits from its listener.
#[derive(Clone)]
pub struct SessionConfig {
    /// Fully qualified domain name used in the banner and EHLO reply.
    pub banner: Arc<str>,
    pub mode: ResponseMode,
    pub delay: Option<Delay>,
    /// Idle timeout in seconds; 0 disables the timer.
    pub timeout: u64,
    pub max_message_size: usize,
    pub dynamic_switch: bool,
    /// When present, STARTTLS is offered on plaintext connections.
    pub starttls: Option<TlsAcceptor>,
}

#[derive(Debug, Default)]
struct Envelope {
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Envelope {
    fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

/// One client connection being walked through the protocol.
///
/// The session owns its socket, envelope, message buffer, and RNG; nothing
/// is shared with other sessions.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    config: SessionConfig,
    state: State,
    envelope: Envelope,
    message: Vec<u8>,
    oversized: bool,
    rng: StdRng,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn new(connection: Connection<Stream>, peer: SocketAddr, config: SessionConfig) -> Self {
        Self::with_rng(connection, peer, config, StdRng::from_entropy())
    }

    /// Builds a session with a caller supplied RNG, for reproducible tests.
    pub fn with_rng(
        connection: Connection<Stream>,
        peer: SocketAddr,
        config: SessionConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            peer,
            connection,
            config,
            state: State::Connected,
            envelope: Envelope::default(),
            message: Vec::new(),
            oversized: false,
            rng,
        }
    }

    /// Drives the connection until the client quits, disconnects, times
    /// out, or the worker shuts down.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        if self.config.mode.is_offline() {
            internal!(level = DEBUG, "{} dropped, listener is offline", self.peer);
            return Ok(());
        }

        internal!(level = DEBUG, "{} connected", self.peer);
        self.send_line(&format!(
            "{} {} ESMTP Blackhole",
            Status::ServiceReady,
            self.config.banner
        ))
        .await?;

        loop {
            let line = match self.read_line(MAX_COMMAND_LINE).await? {
                Line::Eof => {
                    internal!(level = DEBUG, "{} disconnected", self.peer);
                    return Ok(());
                }
                Line::TooLong => {
                    self.reply(Status::UnknownCommand).await?;
                    continue;
                }
                Line::Complete(bytes) => bytes,
            };

            let text = String::from_utf8_lossy(&line).into_owned();
            let command = Command::parse(&text);
            incoming!("{} {}", self.peer, command);

            if !self.state.permits(&command) {
                self.reply(Status::BadSequence).await?;
                continue;
            }
            self.state = self.state.after(&command);

            match command {
                Command::Helo(_) => {
                    self.envelope.clear();
                    self.send_line(&format!("{} {}", Status::Ok, self.config.banner))
                        .await?;
                }
                Command::Ehlo(_) => {
                    self.envelope.clear();
                    self.send_ehlo().await?;
                }
                Command::MailFrom(sender) => {
                    self.envelope.sender = Some(sender);
                    self.reply(Status::Ok).await?;
                }
                Command::RcptTo(recipient) => {
                    self.envelope.recipients.push(recipient);
                    self.reply(Status::Ok).await?;
                }
                Command::Data => {
                    self.reply(Status::StartMailInput).await?;
                    if !self.receive_message(&mut shutdown).await? {
                        internal!(level = DEBUG, "{} disconnected mid-message", self.peer);
                        return Ok(());
                    }
                }
                Command::Rset => {
                    self.envelope.clear();
                    self.reply(Status::Ok).await?;
                }
                Command::Noop => self.reply(Status::Ok).await?,
                Command::Vrfy => self.reply(Status::CannotVrfy).await?,
                Command::Expn => self.reply(Status::NotImplemented).await?,
                Command::Help => self.reply(Status::HelpMessage).await?,
                Command::Quit => {
                    self.reply(Status::GoodBye).await?;
                    return Ok(());
                }
                Command::StartTls => self.handle_starttls().await?,
                Command::Invalid(_) => self.reply(Status::InvalidParameters).await?,
                Command::Unknown(_) => self.reply(Status::UnknownCommand).await?,
            }
        }
    }

    /// Accumulates message content until the terminating dot, then runs the
    /// end-of-data sequence. Returns `false` if the client disconnected.
    async fn receive_message(
        &mut self,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<bool, SessionError> {
        self.message.clear();
        self.oversized = false;
        let line_limit = self.config.max_message_size.saturating_add(1024);

        loop {
            match self.read_line(line_limit).await? {
                Line::Eof => return Ok(false),
                Line::TooLong => self.oversized = true,
                Line::Complete(line) => {
                    if line == b"." {
                        break;
                    }
                    // Transparency: one leading dot was added by the client.
                    let content = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line[..]
                    };
                    if !self.oversized {
                        if self.message.len() + content.len() + 2 > self.config.max_message_size {
                            self.oversized = true;
                        } else {
                            self.message.extend_from_slice(content);
                            self.message.extend_from_slice(b"\r\n");
                        }
                    }
                }
            }
        }

        self.state = State::HeloDone;
        self.envelope.clear();

        if self.oversized {
            self.message.clear();
            self.reply(Status::ExceededStorage).await?;
            return Ok(true);
        }

        let overrides = if self.config.dynamic_switch {
            switch::scan(&self.message, self.config.timeout)
        } else {
            switch::Overrides::default()
        };
        self.message.clear();

        let mode = overrides.mode.unwrap_or(self.config.mode);
        let delay = overrides.delay.or(self.config.delay);
        self.wait_before_reply(mode, delay, shutdown).await?;

        let reply = policy::final_reply(mode, &mut self.rng);
        if reply.status.is_temporary() || reply.status.is_permanent() {
            internal!(level = DEBUG, "{} message refused with {}", self.peer, reply.status);
        } else {
            internal!(level = DEBUG, "{} message accepted", self.peer);
        }
        self.send_line(&reply.to_string()).await?;
        Ok(true)
    }

    /// Sleeps for the effective delay. The idle timer does not run here,
    /// and worker shutdown interrupts the sleep.
    async fn wait_before_reply(
        &mut self,
        mode: ResponseMode,
        delay: Option<Delay>,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let secs = match delay {
            Some(delay) => delay.draw(&mut self.rng),
            None if mode.forces_delay() => {
                let ceiling = if self.config.timeout > 1 {
                    Delay::MAX_SECS.min(self.config.timeout - 1)
                } else {
                    Delay::MAX_SECS
                };
                self.rng.gen_range(1..=ceiling)
            }
            None => 0,
        };

        if secs == 0 {
            return Ok(());
        }

        internal!(level = DEBUG, "{} delaying reply for {}s", self.peer, secs);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
            _ = shutdown.recv() => {
                let _ = self
                    .send_line(&format!(
                        "{} {}",
                        Status::Unavailable,
                        Status::Unavailable.phrase()
                    ))
                    .await;
                Err(SessionError::Shutdown)
            }
        }
    }

    async fn handle_starttls(&mut self) -> Result<(), SessionError> {
        let acceptor = match (&self.config.starttls, self.connection.is_tls()) {
            (Some(acceptor), false) => acceptor.clone(),
            _ => return self.reply(Status::TlsUnavailable).await,
        };

        self.send_line(&format!("{} 2.0.0 Ready to start TLS", Status::ServiceReady))
            .await?;

        self.connection
            .upgrade(&acceptor)
            .await
            .map_err(|e| SessionError::Tls(e.to_string()))?;

        internal!(level = DEBUG, "{} upgraded to TLS", self.peer);
        self.state = State::Connected;
        self.envelope.clear();
        Ok(())
    }

    async fn send_ehlo(&mut self) -> Result<(), SessionError> {
        self.send_line(&format!("{}-{}", Status::Ok, self.config.banner))
            .await?;
        self.send_line(&format!(
            "{}-SIZE {}",
            Status::Ok,
            self.config.max_message_size
        ))
        .await?;
        if self.config.starttls.is_some() && !self.connection.is_tls() {
            self.send_line(&format!("{}-STARTTLS", Status::Ok)).await?;
        }
        self.send_line(&format!("{} PIPELINING", Status::Ok)).await
    }

    async fn reply(&mut self, status: Status) -> Result<(), SessionError> {
        self.send_line(&format!("{status} {}", status.phrase())).await
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        outgoing!("{} {}", self.peer, line);
        self.connection.send(&line).await?;
        Ok(())
    }

    /// One read, bounded by the idle timeout when one is configured. The
    /// timer restarts with every call.
    async fn read_line(&mut self, limit: usize) -> Result<Line, SessionError> {
        if self.config.timeout == 0 {
            return self.connection.read_line(limit).await.map_err(Into::into);
        }

        let allowed = Duration::from_secs(self.config.timeout);
        match tokio::time::timeout(allowed, self.connection.read_line(limit)).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                let _ = self
                    .connection
                    .send(&format!("{} Timeout", Status::Unavailable))
                    .await;
                internal!(level = DEBUG, "{} timed out", self.peer);
                Err(SessionError::Timeout(self.config.timeout))
            }
        }
    }
}
