pub mod config;
pub mod error;
pub mod logging;
pub mod mode;
pub mod status;
pub mod sysexits;

pub use tracing;

use std::io::Read;
use std::path::Path;

/// Control message broadcast to listeners and sessions within a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Fully qualified domain name used in the banner and EHLO response.
///
/// Prefers the content of `/etc/mailname`, falling back to the system host
/// name when the file is missing, unreadable, or empty.
#[must_use]
pub fn mailname() -> String {
    mailname_from(Path::new("/etc/mailname"))
}

fn mailname_from(path: &Path) -> String {
    if let Ok(mut file) = std::fs::File::open(path) {
        let mut content = String::new();
        if file.read_to_string(&mut content).is_ok() {
            if let Some(name) = content.lines().next() {
                let name = name.trim();
                if !name.is_empty() {
                    return name.to_owned();
                }
            }
        }
    }

    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}
