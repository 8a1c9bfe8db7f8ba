//! The worker process: a current-thread runtime driving every listener.
//!
//! Workers are forked by the supervisor and share nothing with each other
//! beyond the inherited listening sockets. All scheduling inside a worker
//! is cooperative; a sleeping or slow session never blocks another.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use blackhole_common::config::Config;
use blackhole_common::internal;
use blackhole_common::mode::{Delay, ResponseMode};
use blackhole_common::Signal;
use blackhole_smtp::{Listener, ListenerConfig, SessionConfig};
use futures_util::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_rustls::{rustls::ServerConfig as TlsServerConfig, TlsAcceptor};

/// One inherited socket with its resolved response behaviour.
pub struct WorkerListener {
    pub socket: StdTcpListener,
    pub mode: ResponseMode,
    pub delay: Option<Delay>,
    pub tls: bool,
}

/// Everything a worker inherits from the supervisor.
pub struct Worker {
    pub listeners: Vec<WorkerListener>,
    pub tls_config: Option<Arc<TlsServerConfig>>,
    pub config: Config,
    pub banner: Arc<str>,
}

/// Runs the worker until shutdown. The returned value is the process exit
/// code.
#[tokio::main(flavor = "current_thread")]
pub async fn run(worker: Worker) -> i32 {
    let (tx, _) = broadcast::channel(8);

    if let Err(err) = watch_signals(tx.clone()) {
        internal!(level = ERROR, "cannot install signal handlers: {}", err);
        return 1;
    }

    let mut listeners = Vec::with_capacity(worker.listeners.len());
    for inherited in worker.listeners {
        let tls_acceptor = if inherited.tls {
            worker
                .tls_config
                .as_ref()
                .map(|config| TlsAcceptor::from(Arc::clone(config)))
        } else {
            None
        };
        let starttls = if !inherited.tls && worker.config.starttls {
            worker
                .tls_config
                .as_ref()
                .map(|config| TlsAcceptor::from(Arc::clone(config)))
        } else {
            None
        };

        let session = SessionConfig {
            banner: Arc::clone(&worker.banner),
            mode: inherited.mode,
            delay: inherited.delay,
            timeout: worker.config.timeout,
            max_message_size: worker.config.max_message_size,
            dynamic_switch: worker.config.dynamic_switch,
            starttls,
        };

        match Listener::from_std(
            inherited.socket,
            ListenerConfig {
                tls: tls_acceptor,
                session,
                max_sessions: worker.config.max_sessions,
            },
        ) {
            Ok(listener) => listeners.push(listener),
            Err(err) => {
                internal!(level = ERROR, "{}", err);
                return 1;
            }
        }
    }

    internal!(
        level = INFO,
        "worker {} serving {} listeners",
        std::process::id(),
        listeners.len()
    );

    let results = join_all(
        listeners
            .into_iter()
            .map(|listener| listener.serve(tx.subscribe())),
    )
    .await;

    let mut code = 0;
    for result in results {
        if let Err(err) = result {
            internal!(level = ERROR, "listener failed: {}", err);
            code = 1;
        }
    }

    internal!(level = INFO, "worker {} exiting", std::process::id());
    code
}

/// Feeds process signals into the worker's shutdown broadcast.
///
/// SIGTERM and SIGINT begin a graceful shutdown. SIGHUP does the same:
/// there is no live reload, the supervisor replaces the worker with one
/// built from freshly parsed configuration. SIGUSR1 and SIGUSR2 are
/// reserved and ignored.
fn watch_signals(tx: broadcast::Sender<Signal>) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => break,
                _ = int.recv() => break,
                _ = hup.recv() => break,
                _ = usr1.recv() => {}
                _ = usr2.recv() => {}
            }
        }
        internal!(level = INFO, "worker {} shutting down", std::process::id());
        let _ = tx.send(Signal::Shutdown);
    });

    Ok(())
}
