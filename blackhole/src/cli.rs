use std::path::PathBuf;

use clap::Parser;

/// Command line surface of the `blackhole` binary.
#[derive(Debug, Parser)]
#[command(name = "blackhole", about = "An SMTP sink that never delivers")]
pub struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "conf", value_name = "/etc/blackhole.conf")]
    pub config_file: Option<PathBuf>,

    /// Perform a configuration test and exit
    #[arg(short = 't', long = "test")]
    pub test: bool,

    /// Stay attached to the terminal
    #[arg(short = 'b', long = "foreground")]
    pub foreground: bool,

    /// Detach and run in the background
    #[arg(short = 'd', long = "daemonise", conflicts_with = "foreground")]
    pub daemonise: bool,

    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// List supported TLS protocol versions and cipher suites, then exit
    #[arg(short = 'l', long = "list-ciphers")]
    pub list_ciphers: bool,
}
