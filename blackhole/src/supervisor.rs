//! The supervisor process.
//!
//! Runs in order: bind every listening socket (so privileged ports stay
//! held after the privilege drop), load TLS material, drop privileges,
//! write the pidfile, fork workers that inherit the sockets, then monitor
//! the children. SIGTERM and SIGINT propagate to the workers; SIGHUP
//! re-parses the configuration and replaces every worker.

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blackhole_common::config::{Config, Family, ListenerSpec};
use blackhole_common::error::SupervisorError;
use blackhole_common::mode::{Delay, ResponseMode};
use blackhole_common::{internal, mailname};
use blackhole_smtp::tls;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet};
use nix::sys::signal::Signal as UnixSignal;
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn, SockaddrIn6,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;

use crate::privileges;
use crate::worker::{self, Worker, WorkerListener};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

const MONITOR_TICK: Duration = Duration::from_millis(200);

/// One socket bound by the supervisor, with its resolved behaviour.
pub struct BoundListener {
    pub socket: StdTcpListener,
    pub address: SocketAddr,
    pub mode: ResponseMode,
    pub delay: Option<Delay>,
    pub tls: bool,
    /// Host, port, and TLS flag of the entry that produced this socket,
    /// used to re-resolve mode and delay on reload.
    key: (String, u16, bool),
}

struct WorkerSlot {
    pid: Option<Pid>,
    restarts: u32,
    spawned_at: Instant,
    respawn_at: Option<Instant>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            pid: None,
            restarts: 0,
            spawned_at: Instant::now(),
            respawn_at: None,
        }
    }
}

pub struct Supervisor {
    config: Config,
    config_path: Option<PathBuf>,
    bound: Vec<BoundListener>,
    tls_config: Option<Arc<TlsServerConfig>>,
    banner: Arc<str>,
    slots: Vec<WorkerSlot>,
    pidfile_written: bool,
}

impl Supervisor {
    /// Binds all sockets and loads TLS material. Failures here are fatal
    /// to startup and happen before any privileges are dropped.
    pub fn init(config: Config, config_path: Option<PathBuf>) -> Result<Self, SupervisorError> {
        let tls_config = if config.tls_listen.is_empty() && !config.starttls {
            None
        } else {
            let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) else {
                return Err(SupervisorError::Tls(
                    "TLS requires both tls_cert and tls_key".to_owned(),
                ));
            };
            if config.tls_dhparams.is_some() {
                internal!(
                    level = WARN,
                    "tls_dhparams is ignored; the TLS library supplies its own parameters"
                );
            }
            Some(
                tls::load_server_config(cert, key)
                    .map_err(|e| SupervisorError::Tls(e.to_string()))?,
            )
        };

        let bound = bind_all(&config)?;

        Ok(Self {
            config,
            config_path,
            bound,
            tls_config,
            banner: Arc::from(mailname()),
            slots: Vec::new(),
            pidfile_written: false,
        })
    }

    /// Drops privileges, writes the pidfile, forks the workers, and
    /// monitors them until told to stop.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        privileges::drop_privileges(self.config.user.as_deref(), self.config.group.as_deref())?;
        self.write_pidfile()?;
        install_signal_handlers().map_err(|e| SupervisorError::Signals(e.to_string()))?;

        self.slots = (0..self.config.workers).map(|_| WorkerSlot::new()).collect();
        for slot in 0..self.slots.len() {
            if let Err(err) = self.spawn_worker(slot) {
                self.shutdown();
                return Err(err);
            }
        }

        internal!(
            level = INFO,
            "supervisor {} running with {} workers",
            std::process::id(),
            self.slots.len()
        );

        loop {
            if SHUTDOWN.swap(false, Ordering::SeqCst) {
                self.shutdown();
                return Ok(());
            }
            if RELOAD.swap(false, Ordering::SeqCst) {
                self.reload();
            }
            self.reap();
            self.respawn_due();
            std::thread::sleep(MONITOR_TICK);
        }
    }

    fn spawn_worker(&mut self, slot: usize) -> Result<(), SupervisorError> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let state = &mut self.slots[slot];
                state.pid = Some(child);
                state.spawned_at = Instant::now();
                state.respawn_at = None;
                internal!(level = INFO, "worker {} started (pid {})", slot, child);
                Ok(())
            }
            Ok(ForkResult::Child) => {
                reset_signal_dispositions();
                let listeners = std::mem::take(&mut self.bound)
                    .into_iter()
                    .map(|bound| WorkerListener {
                        socket: bound.socket,
                        mode: bound.mode,
                        delay: bound.delay,
                        tls: bound.tls,
                    })
                    .collect();
                let worker = Worker {
                    listeners,
                    tls_config: self.tls_config.clone(),
                    config: self.config.clone(),
                    banner: Arc::clone(&self.banner),
                };
                std::process::exit(worker::run(worker));
            }
            Err(err) => Err(SupervisorError::Fork(err.to_string())),
        }
    }

    fn reap(&mut self) {
        loop {
            match waitpid(Option::<Pid>::None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.child_exited(pid, code),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.child_exited(pid, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    fn child_exited(&mut self, pid: Pid, code: i32) {
        let Some(slot) = self.slots.iter().position(|s| s.pid == Some(pid)) else {
            internal!(level = DEBUG, "reaped unknown child {}", pid);
            return;
        };

        let state = &mut self.slots[slot];
        state.pid = None;

        if code == 0 {
            internal!(level = INFO, "worker {} (pid {}) exited cleanly", slot, pid);
            return;
        }

        if state.spawned_at.elapsed() > Duration::from_secs(60) {
            state.restarts = 0;
        }
        let delay = backoff_delay(state.restarts);
        state.restarts += 1;
        state.respawn_at = Some(Instant::now() + delay);
        internal!(
            level = WARN,
            "worker {} (pid {}) exited with {}, restarting in {:?}",
            slot,
            pid,
            code,
            delay
        );
    }

    fn respawn_due(&mut self) {
        for slot in 0..self.slots.len() {
            let due = self.slots[slot].pid.is_none()
                && self.slots[slot]
                    .respawn_at
                    .is_some_and(|at| Instant::now() >= at);
            if due {
                if let Err(err) = self.spawn_worker(slot) {
                    internal!(level = ERROR, "{}", err);
                    self.slots[slot].respawn_at = Some(Instant::now() + Duration::from_secs(5));
                }
            }
        }
    }

    /// Re-parses the configuration file and replaces every worker.
    ///
    /// Sockets are bound once at startup; a changed listener set cannot
    /// take effect without a full restart and is reported as such.
    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            internal!(level = WARN, "no configuration file to reload");
            return;
        };

        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(err) => {
                internal!(level = ERROR, "reload failed, keeping old configuration: {}", err);
                return;
            }
        };

        let old_keys: BTreeSet<_> = self.bound.iter().map(|b| b.key.clone()).collect();
        let new_keys: BTreeSet<_> = config
            .listen
            .iter()
            .chain(&config.tls_listen)
            .map(spec_key)
            .collect();
        if old_keys != new_keys {
            internal!(
                level = WARN,
                "listener changes require a restart; keeping existing sockets"
            );
        }

        for bound in &mut self.bound {
            let spec = config
                .listen
                .iter()
                .chain(&config.tls_listen)
                .find(|spec| spec_key(spec) == bound.key);
            if let Some(spec) = spec {
                bound.mode = spec.effective_mode(&config);
                bound.delay = spec.effective_delay(&config);
            }
        }

        self.config = config;
        internal!(level = INFO, "configuration reloaded, replacing workers");
        self.restart_workers();
    }

    fn restart_workers(&mut self) {
        self.signal_children(UnixSignal::SIGTERM);
        self.wait_children();
        self.slots = (0..self.config.workers).map(|_| WorkerSlot::new()).collect();
        for slot in 0..self.slots.len() {
            if let Err(err) = self.spawn_worker(slot) {
                internal!(level = ERROR, "{}", err);
            }
        }
    }

    fn shutdown(&mut self) {
        internal!(level = INFO, "supervisor shutting down");
        self.signal_children(UnixSignal::SIGTERM);
        self.wait_children();
        self.remove_pidfile();
    }

    fn signal_children(&self, signal: UnixSignal) {
        for state in &self.slots {
            if let Some(pid) = state.pid {
                let _ = kill(pid, signal);
            }
        }
    }

    fn wait_children(&mut self) {
        for state in &mut self.slots {
            if let Some(pid) = state.pid.take() {
                let _ = waitpid(pid, None);
            }
        }
    }

    fn write_pidfile(&mut self) -> Result<(), SupervisorError> {
        if let Some(path) = &self.config.pidfile {
            std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
                SupervisorError::Pidfile {
                    path: path.display().to_string(),
                    source,
                }
            })?;
            self.pidfile_written = true;
        }
        Ok(())
    }

    fn remove_pidfile(&mut self) {
        if self.pidfile_written {
            if let Some(path) = &self.config.pidfile {
                let _ = std::fs::remove_file(path);
            }
            self.pidfile_written = false;
        }
    }
}

fn spec_key(spec: &ListenerSpec) -> (String, u16, bool) {
    (spec.host.clone(), spec.port, spec.tls)
}

/// Restart delay: 1 s doubling to a 30 s cap.
fn backoff_delay(restarts: u32) -> Duration {
    Duration::from_secs((1u64 << restarts.min(5)).min(30))
}

/// Binds every configured listener, one socket per resolved address.
pub fn bind_all(config: &Config) -> Result<Vec<BoundListener>, SupervisorError> {
    let mut bound = Vec::new();
    for spec in config.listen.iter().chain(&config.tls_listen) {
        for address in resolve(spec)? {
            let socket = bind_socket(address).map_err(|source| SupervisorError::BindFailed {
                address: address.to_string(),
                source,
            })?;
            let address = socket.local_addr().unwrap_or(address);
            bound.push(BoundListener {
                socket,
                address,
                mode: spec.effective_mode(config),
                delay: spec.effective_delay(config),
                tls: spec.tls,
                key: spec_key(spec),
            });
        }
    }
    Ok(bound)
}

/// Resolves a listener entry to concrete socket addresses.
///
/// Literal addresses yield exactly one; host names yield one per address
/// family they resolve to, bound independently.
fn resolve(spec: &ListenerSpec) -> Result<Vec<SocketAddr>, SupervisorError> {
    let host = match (spec.family, spec.host.as_str()) {
        (Family::V4, "") => "0.0.0.0",
        (Family::V6, "") => "::",
        _ => spec.host.as_str(),
    };

    let addresses: Vec<SocketAddr> = (host, spec.port)
        .to_socket_addrs()
        .map_err(|_| SupervisorError::Unresolvable {
            address: format!("{host}:{}", spec.port),
        })?
        .collect();

    let selected: Vec<SocketAddr> = match spec.family {
        Family::V4 => addresses.into_iter().filter(SocketAddr::is_ipv4).take(1).collect(),
        Family::V6 => addresses.into_iter().filter(SocketAddr::is_ipv6).take(1).collect(),
        Family::Either => {
            let v4 = addresses.iter().copied().find(SocketAddr::is_ipv4);
            let v6 = addresses.iter().copied().find(SocketAddr::is_ipv6);
            v4.into_iter().chain(v6).collect()
        }
    };

    if selected.is_empty() {
        return Err(SupervisorError::Unresolvable {
            address: format!("{host}:{}", spec.port),
        });
    }
    Ok(selected)
}

/// Creates, configures, and binds one listening socket.
///
/// `SO_REUSEADDR` is always set, and `IPV6_V6ONLY` on v6 sockets so that a
/// paired `0.0.0.0:P` and `[::]:P` configuration is valid.
fn bind_socket(address: SocketAddr) -> std::io::Result<StdTcpListener> {
    let family = if address.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket(family, SockType::Stream, SockFlag::empty(), None).map_err(errno_io)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(errno_io)?;

    match address {
        SocketAddr::V4(v4) => bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(errno_io)?,
        SocketAddr::V6(v6) => {
            setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(errno_io)?;
            bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(errno_io)?;
        }
    }

    listen(&fd, Backlog::new(511).unwrap_or(Backlog::MAXCONN)).map_err(errno_io)?;
    Ok(StdTcpListener::from(fd))
}

fn errno_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

extern "C" fn flag_signal(signum: nix::libc::c_int) {
    match UnixSignal::try_from(signum) {
        Ok(UnixSignal::SIGTERM | UnixSignal::SIGINT) => SHUTDOWN.store(true, Ordering::SeqCst),
        Ok(UnixSignal::SIGHUP) => RELOAD.store(true, Ordering::SeqCst),
        _ => {}
    }
}

fn install_signal_handlers() -> nix::Result<()> {
    let flag = SigAction::new(
        SigHandler::Handler(flag_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    unsafe {
        sigaction(UnixSignal::SIGTERM, &flag)?;
        sigaction(UnixSignal::SIGINT, &flag)?;
        sigaction(UnixSignal::SIGHUP, &flag)?;
        sigaction(UnixSignal::SIGUSR1, &ignore)?;
        sigaction(UnixSignal::SIGUSR2, &ignore)?;
    }
    Ok(())
}

/// Returns inherited dispositions to their defaults in a freshly forked
/// worker, before tokio installs its own handlers.
fn reset_signal_dispositions() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [
        UnixSignal::SIGTERM,
        UnixSignal::SIGINT,
        UnixSignal::SIGHUP,
        UnixSignal::SIGUSR1,
        UnixSignal::SIGUSR2,
    ] {
        let _ = unsafe { sigaction(signal, &default) };
    }
}
