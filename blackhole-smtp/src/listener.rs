use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use blackhole_common::error::ListenerError;
use blackhole_common::{internal, Signal};
use nix::errno::Errno;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::connection::Connection;
use crate::session::{Session, SessionConfig};

/// Everything one listening socket needs to answer its clients.
#[derive(Clone)]
pub struct ListenerConfig {
    /// TLS-from-the-first-byte acceptor; `None` for plaintext sockets.
    pub tls: Option<TlsAcceptor>,
    /// Template for the sessions this listener spawns, already resolved
    /// to the listener's effective mode and delay.
    pub session: SessionConfig,
    /// Cap on concurrent sessions.
    pub max_sessions: usize,
}

/// One bound socket accepting connections in a loop.
pub struct Listener {
    listener: TcpListener,
    config: ListenerConfig,
}

impl Listener {
    /// Adopts a socket bound elsewhere, typically inherited across `fork`.
    pub fn from_std(std_listener: StdTcpListener, config: ListenerConfig) -> Result<Self, ListenerError> {
        let address = std_listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let init = |source: io::Error| ListenerError::InitFailed {
            address: address.clone(),
            source,
        };

        std_listener.set_nonblocking(true).map_err(init)?;
        let listener = TcpListener::from_std(std_listener).map_err(init)?;
        Ok(Self { listener, config })
    }

    /// Accepts until shutdown, then drains in-flight sessions for up to
    /// the configured timeout before aborting the stragglers.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        internal!(
            level = INFO,
            "Serving {} (mode={}, tls={})",
            local,
            self.config.session.mode,
            self.config.tls.is_some()
        );

        let limiter = Arc::new(Semaphore::new(self.config.max_sessions));
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            while sessions.try_join_next().is_some() {}

            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(level = INFO, "{} received shutdown, finishing sessions", local);
                        break;
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.dispatch(stream, peer, &limiter, &mut sessions, &shutdown);
                        }
                        Err(err) if is_transient(&err) => {
                            internal!(level = WARN, "{} accept failed, retrying: {}", local, err);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(err) => {
                            internal!(level = ERROR, "{} accept failed: {}", local, err);
                            return Err(ListenerError::AcceptFailed(err));
                        }
                    }
                }
            }
        }

        let grace = if self.config.session.timeout > 0 {
            self.config.session.timeout
        } else {
            30
        };
        let drained = tokio::time::timeout(Duration::from_secs(grace), async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            internal!(level = WARN, "{} aborting sessions still running after {}s", local, grace);
            sessions.abort_all();
        }

        Ok(())
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        limiter: &Arc<Semaphore>,
        sessions: &mut JoinSet<()>,
        shutdown: &broadcast::Receiver<Signal>,
    ) {
        if self.config.session.mode.is_offline() {
            internal!(level = DEBUG, "{} dropped, listener is offline", peer);
            return;
        }

        let Ok(permit) = Arc::clone(limiter).try_acquire_owned() else {
            internal!(level = WARN, "{} refused, session cap reached", peer);
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(b"421 Too many concurrent connections\r\n").await;
            });
            return;
        };

        let tls = self.config.tls.clone();
        let session_config = self.config.session.clone();
        let signal = shutdown.resubscribe();

        sessions.spawn(async move {
            let _permit = permit;

            let connection = match tls {
                Some(acceptor) => match handshake(&acceptor, stream, session_config.timeout).await {
                    Ok(stream) => Connection::tls(stream),
                    Err(err) => {
                        internal!(level = DEBUG, "{} TLS handshake failed: {}", peer, err);
                        return;
                    }
                },
                None => Connection::plain(stream),
            };

            let session = Session::new(connection, peer, session_config);
            if let Err(err) = session.run(signal).await {
                if err.is_client_error() {
                    internal!(level = DEBUG, "{} session ended: {}", peer, err);
                } else {
                    internal!(level = ERROR, "{} session error: {}", peer, err);
                }
            }
        });
    }
}

/// The handshake happens before the banner and is bounded by the idle
/// timeout when one is configured.
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: u64,
) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
    if timeout == 0 {
        return acceptor.accept(stream).await;
    }
    tokio::time::timeout(Duration::from_secs(timeout), acceptor.accept(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
}

fn is_transient(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ConnectionAborted {
        return true;
    }
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ECONNABORTED)
    )
}
