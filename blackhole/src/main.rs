use std::path::PathBuf;

use blackhole::cli::Args;
use blackhole::supervisor::Supervisor;
use blackhole_common::config::Config;
use blackhole_common::error::SupervisorError;
use blackhole_common::sysexits::{self, Sysexit};
use blackhole_common::{internal, logging};
use clap::Parser;

#[cfg(not(unix))]
compile_error!("blackhole relies on fork and unix signal semantics");

fn main() {
    let args = Args::parse();

    if args.version {
        println!("blackhole {}", env!("CARGO_PKG_VERSION"));
        sysexits::EX_OK.exit();
    }

    if args.list_ciphers {
        for line in blackhole_smtp::tls::supported_parameters() {
            println!("{line}");
        }
        sysexits::EX_OK.exit();
    }

    logging::init();

    if args.test {
        config_test(args.config_file);
    }

    let config = load_config(args.config_file.as_deref());

    // Bind sockets and load TLS material while errors still reach the
    // terminal, then detach.
    let supervisor = match Supervisor::init(config, args.config_file) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            eprintln!("{err}");
            startup_exit(&err).exit();
        }
    };

    if args.daemonise {
        if let Err(err) = daemonize::Daemonize::new()
            .working_directory("/")
            .umask(0o022)
            .start()
        {
            eprintln!("Failed to daemonise: {err}");
            sysexits::EX_OSERR.exit();
        }
    }

    match supervisor.run() {
        Ok(()) => sysexits::EX_OK.exit(),
        Err(err) => {
            internal!(level = ERROR, "{}", err);
            startup_exit(&err).exit();
        }
    }
}

/// `-t`: parse and validate the configuration, report, and exit.
fn config_test(config_file: Option<PathBuf>) -> ! {
    let Some(path) = config_file else {
        eprintln!("No config file provided.");
        sysexits::EX_USAGE.exit();
    };

    match Config::load(&path) {
        Ok(_) => {
            println!("{} syntax is OK", path.display());
            println!("{} test was successful", path.display());
            sysexits::EX_OK.exit();
        }
        Err(err) => {
            eprintln!("{err}");
            sysexits::EX_CONFIG.exit();
        }
    }
}

fn load_config(config_file: Option<&std::path::Path>) -> Config {
    match config_file {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                sysexits::EX_CONFIG.exit();
            }
        },
        None => {
            let config = Config::default();
            if let Err(err) = config.validate() {
                eprintln!("{err}");
                sysexits::EX_CONFIG.exit();
            }
            config
        }
    }
}

fn startup_exit(err: &SupervisorError) -> Sysexit {
    match err {
        SupervisorError::BindFailed { .. } | SupervisorError::PrivilegeDrop { .. } => {
            sysexits::EX_NOPERM
        }
        SupervisorError::Unresolvable { .. } | SupervisorError::Tls(_) => sysexits::EX_CONFIG,
        SupervisorError::Pidfile { .. } => sysexits::EX_CANTCREAT,
        SupervisorError::Fork(_) | SupervisorError::Signals(_) => sysexits::EX_OSERR,
    }
}
