//! In-process test harness.
//!
//! Starts one listener of the sink on an ephemeral port inside the test
//! runtime, plus a minimal line-oriented SMTP client to drive it. This
//! exercises the same listener and session code the forked workers run,
//! without forking inside the test process.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use blackhole_common::mode::{Delay, ResponseMode};
use blackhole_common::Signal;
use blackhole_smtp::{Listener, ListenerConfig, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct SinkHarness {
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<()>,
}

impl SinkHarness {
    #[must_use]
    pub fn builder() -> SinkBuilder {
        SinkBuilder::default()
    }

    pub async fn start(mode: ResponseMode) -> Self {
        Self::builder().with_mode(mode).start().await
    }

    /// Stops accepting, drains sessions, and waits for the listener task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

pub struct SinkBuilder {
    mode: ResponseMode,
    delay: Option<Delay>,
    timeout: u64,
    max_message_size: usize,
    dynamic_switch: bool,
    max_sessions: usize,
}

impl Default for SinkBuilder {
    fn default() -> Self {
        Self {
            mode: ResponseMode::Accept,
            delay: None,
            timeout: 10,
            max_message_size: 512_000,
            dynamic_switch: true,
            max_sessions: 64,
        }
    }
}

impl SinkBuilder {
    #[must_use]
    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    #[must_use]
    pub fn with_dynamic_switch(mut self, enabled: bool) -> Self {
        self.dynamic_switch = enabled;
        self
    }

    pub async fn start(self) -> SinkHarness {
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        let config = ListenerConfig {
            tls: None,
            session: SessionConfig {
                banner: Arc::from("sink.test"),
                mode: self.mode,
                delay: self.delay,
                timeout: self.timeout,
                max_message_size: self.max_message_size,
                dynamic_switch: self.dynamic_switch,
                starttls: None,
            },
            max_sessions: self.max_sessions,
        };

        let listener = Listener::from_std(std_listener, config).unwrap();
        let (shutdown, rx) = broadcast::channel(4);
        let handle = tokio::spawn(async move {
            let _ = listener.serve(rx).await;
        });

        SinkHarness {
            addr,
            shutdown,
            handle,
        }
    }
}

/// A minimal blocking-style SMTP client over one connection.
pub struct SmtpClient {
    reader: BufReader<TcpStream>,
}

impl SmtpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.reader
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// One reply line, trimmed.
    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert!(read > 0, "server closed the connection");
        line.trim_end().to_owned()
    }

    /// Reads through a possibly multi-line reply, returning the final line.
    pub async fn recv_reply(&mut self) -> String {
        loop {
            let line = self.recv().await;
            if line.len() < 4 || line.as_bytes()[3] != b' ' {
                continue;
            }
            return line;
        }
    }

    /// Reads a line, expecting the peer to have closed the connection.
    pub async fn expect_close(&mut self) {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert_eq!(read, 0, "expected close, read {line:?}");
    }

    /// Runs a whole transaction and returns the post-data reply.
    pub async fn transact(&mut self, body: &[&str]) -> String {
        self.send("HELO client.test").await;
        self.recv_reply().await;
        self.send("MAIL FROM:<sender@client.test>").await;
        self.recv_reply().await;
        self.send("RCPT TO:<anyone@sink.test>").await;
        self.recv_reply().await;
        self.send("DATA").await;
        let go_ahead = self.recv_reply().await;
        assert!(go_ahead.starts_with("354"), "got {go_ahead}");
        for line in body {
            self.send(line).await;
        }
        self.send(".").await;
        self.recv_reply().await
    }
}
