//! Configuration loading and validation.
//!
//! The configuration file is line oriented `key=value` text. Lines starting
//! with `#` are ignored, single and double quotes around values are
//! stripped. Listener directives take comma separated entries of the form
//! `HOST:PORT [mode=MODE] [delay=SECS[,SECS]]`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::mode::{Delay, ResponseMode};

/// Address family a listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    /// A host name, resolved at bind time; both families may result.
    Either,
}

/// One `listen` or `tls_listen` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub host: String,
    pub port: u16,
    pub family: Family,
    pub tls: bool,
    pub mode: Option<ResponseMode>,
    pub delay: Option<Delay>,
}

impl ListenerSpec {
    /// Parses a single listener entry, e.g. `127.0.0.1:25 mode=bounce`.
    pub fn parse(entry: &str, tls: bool) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidListener {
            entry: entry.to_owned(),
            reason: reason.to_owned(),
        };

        let mut tokens = entry.split_whitespace();
        let address = tokens.next().ok_or_else(|| invalid("empty entry"))?;
        let (raw_host, raw_port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected HOST:PORT"))?;
        let port: u16 = raw_port
            .parse()
            .map_err(|_| invalid("not a valid port number"))?;

        let host = raw_host.trim_start_matches('[').trim_end_matches(']');
        let family = if host.is_empty() {
            Family::V4
        } else if host.contains(':') {
            Family::V6
        } else if host.parse::<Ipv4Addr>().is_ok() {
            Family::V4
        } else {
            Family::Either
        };

        let mut spec = Self {
            host: host.to_owned(),
            port,
            family,
            tls,
            mode: None,
            delay: None,
        };

        for token in tokens {
            match token.split_once('=') {
                Some(("mode", value)) => {
                    spec.mode = Some(
                        ResponseMode::from_str(value)
                            .map_err(|()| invalid("unknown mode"))?,
                    );
                }
                Some(("delay", value)) => {
                    spec.delay = Some(parse_delay_flag(value).ok_or_else(|| {
                        invalid("delay must be SECS or SECS,SECS with lo <= hi")
                    })?);
                }
                _ => return Err(invalid("unknown flag")),
            }
        }

        Ok(spec)
    }

    /// The mode this listener answers with, falling back on the global one.
    #[must_use]
    pub fn effective_mode(&self, config: &Config) -> ResponseMode {
        self.mode.unwrap_or(config.mode)
    }

    /// The delay this listener applies, falling back on the global one.
    #[must_use]
    pub fn effective_delay(&self, config: &Config) -> Option<Delay> {
        self.delay.or_else(|| config.global_delay())
    }
}

fn parse_delay_flag(value: &str) -> Option<Delay> {
    if let Some((lo, hi)) = value.split_once(',') {
        let lo: u64 = lo.trim().parse().ok()?;
        let hi: u64 = hi.trim().parse().ok()?;
        if lo > hi {
            return None;
        }
        Some(Delay::from_bounds(lo, hi))
    } else {
        value.trim().parse().ok().map(Delay::Fixed)
    }
}

/// The whole parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<ListenerSpec>,
    pub tls_listen: Vec<ListenerSpec>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_dhparams: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub timeout: u64,
    pub delay: u64,
    pub mode: ResponseMode,
    pub max_message_size: usize,
    pub dynamic_switch: bool,
    pub workers: usize,
    pub starttls: bool,
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec![ListenerSpec {
                host: "127.0.0.1".to_owned(),
                port: 25,
                family: Family::V4,
                tls: false,
                mode: None,
                delay: None,
            }],
            tls_listen: Vec::new(),
            tls_cert: None,
            tls_key: None,
            tls_dhparams: None,
            user: None,
            group: None,
            pidfile: None,
            timeout: 60,
            delay: 0,
            mode: ResponseMode::Accept,
            max_message_size: 512_000,
            dynamic_switch: true,
            workers: 1,
            starttls: false,
            max_sessions: 2048,
        }
    }
}

impl Config {
    /// Loads and parses a configuration file, then validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
                path: path.display().to_string(),
                source,
            })?;

        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration text without touching the file system.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut listen_configured = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().replace(['"', '\''], "");

            match key {
                "listen" => {
                    config.listen = parse_listen_value(&value, false)?;
                    listen_configured = true;
                }
                "tls_listen" => {
                    config.tls_listen = parse_listen_value(&value, true)?;
                }
                "tls_cert" => config.tls_cert = Some(PathBuf::from(value)),
                "tls_key" => config.tls_key = Some(PathBuf::from(value)),
                "tls_dhparams" => config.tls_dhparams = Some(PathBuf::from(value)),
                "user" => config.user = Some(value),
                "group" => config.group = Some(value),
                "pidfile" => config.pidfile = Some(PathBuf::from(value)),
                "timeout" => config.timeout = parse_number("timeout", &value)?,
                "delay" => config.delay = parse_number("delay", &value)?,
                "mode" => {
                    config.mode = ResponseMode::from_str(&value).map_err(|()| {
                        ConfigError::InvalidValue {
                            key: "mode",
                            reason: format!("'{value}' is not a known mode"),
                        }
                    })?;
                }
                "max_message_size" => {
                    config.max_message_size = parse_number("max_message_size", &value)?;
                }
                "dynamic_switch" => {
                    config.dynamic_switch = parse_bool("dynamic_switch", &value)?;
                }
                "workers" => config.workers = parse_number("workers", &value)?,
                "starttls" => config.starttls = parse_bool("starttls", &value)?,
                "max_sessions" => config.max_sessions = parse_number("max_sessions", &value)?,
                _ => {}
            }
        }

        if !listen_configured && config.listen.is_empty() {
            config.listen = Self::default().listen;
        }

        Ok(config)
    }

    /// The global delay, when one is configured.
    #[must_use]
    pub fn global_delay(&self) -> Option<Delay> {
        (self.delay > 0).then_some(Delay::Fixed(self.delay))
    }

    /// Sanity checks the parsed values against their permitted ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_timeout()?;
        self.check_delay()?;
        self.check_listeners()?;
        self.check_workers()?;
        self.check_max_message_size()?;
        self.check_tls()?;
        Ok(())
    }

    fn check_timeout(&self) -> Result<(), ConfigError> {
        if self.timeout > 180 {
            return Err(ConfigError::InvalidValue {
                key: "timeout",
                reason: format!("{} is more than the maximum of 180 seconds", self.timeout),
            });
        }
        Ok(())
    }

    fn check_delay(&self) -> Result<(), ConfigError> {
        check_delay_bounds("delay", Delay::Fixed(self.delay), self.timeout)?;
        for spec in self.listen.iter().chain(&self.tls_listen) {
            if let Some(delay) = spec.delay {
                check_delay_bounds("delay", delay, self.timeout)?;
            }
        }
        Ok(())
    }

    fn check_listeners(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() && self.tls_listen.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "listen",
                reason: "at least one listener must be defined".to_owned(),
            });
        }
        Ok(())
    }

    fn check_workers(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers",
                reason: "at least one worker is required".to_owned(),
            });
        }
        Ok(())
    }

    fn check_max_message_size(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_message_size",
                reason: "must be a positive number of bytes".to_owned(),
            });
        }
        Ok(())
    }

    fn check_tls(&self) -> Result<(), ConfigError> {
        let wants_tls = !self.tls_listen.is_empty() || self.starttls;
        if !wants_tls {
            return Ok(());
        }
        let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) else {
            return Err(ConfigError::IncompleteTls);
        };
        for path in [cert, key] {
            if !path.is_file() {
                return Err(ConfigError::MissingTlsFile {
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

fn check_delay_bounds(
    key: &'static str,
    delay: Delay,
    timeout: u64,
) -> Result<(), ConfigError> {
    if delay.max() > Delay::MAX_SECS {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!(
                "{delay} is more than the maximum of {} seconds",
                Delay::MAX_SECS
            ),
        });
    }
    if timeout > 0 && delay.max() > 0 && delay.max() >= timeout {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("{delay} must be less than the timeout of {timeout} seconds"),
        });
    }
    Ok(())
}

/// Splits a listener directive into entries.
///
/// Entries are comma separated, but a comma also appears inside a
/// `delay=LO,HI` range. A segment without a `:` is therefore treated as the
/// continuation of the previous entry's delay flag.
fn parse_listen_value(value: &str, tls: bool) -> Result<Vec<ListenerSpec>, ConfigError> {
    let mut entries: Vec<String> = Vec::new();
    for segment in value.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if !segment.contains(':') {
            if let Some(last) = entries.last_mut() {
                last.push(',');
                last.push_str(segment);
                continue;
            }
        }
        entries.push(segment.to_owned());
    }

    entries
        .iter()
        .map(|entry| ListenerSpec::parse(entry, tls))
        .collect()
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        reason: format!("'{value}' is not a valid number"),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            reason: format!("'{value}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ConfigError;

    fn parse(lines: &[&str]) -> Result<Config, ConfigError> {
        Config::parse(&lines.join("\n"))
    }

    fn parse_ok(lines: &[&str]) -> Config {
        parse(lines).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.listen[0].host, "127.0.0.1");
        assert_eq!(config.listen[0].port, 25);
        assert_eq!(config.timeout, 60);
        assert_eq!(config.delay, 0);
        assert_eq!(config.mode, ResponseMode::Accept);
        assert_eq!(config.max_message_size, 512_000);
        assert!(config.dynamic_switch);
        assert_eq!(config.workers, 1);
        assert!(!config.starttls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn comments_blanks_and_quotes() {
        let config = parse_ok(&[
            "# a comment",
            "",
            "timeout = \"30\"",
            "mode = 'bounce'",
            "nonsense_key = ignored",
        ]);
        assert_eq!(config.timeout, 30);
        assert_eq!(config.mode, ResponseMode::Bounce);
    }

    #[test]
    fn single_listener() {
        let config = parse_ok(&["listen=10.0.0.1:2525"]);
        assert_eq!(config.listen.len(), 1);
        let spec = &config.listen[0];
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(spec.port, 2525);
        assert_eq!(spec.family, Family::V4);
        assert!(!spec.tls);
    }

    #[test]
    fn listener_families() {
        let config = parse_ok(&["listen=:25, :::25, mail.example.test:587"]);
        assert_eq!(config.listen.len(), 3);
        assert_eq!(config.listen[0].family, Family::V4);
        assert_eq!(config.listen[0].host, "");
        assert_eq!(config.listen[1].family, Family::V6);
        assert_eq!(config.listen[1].host, "::");
        assert_eq!(config.listen[2].family, Family::Either);
    }

    #[test]
    fn bracketed_v6_literal() {
        let config = parse_ok(&["listen=[::1]:2525"]);
        assert_eq!(config.listen[0].host, "::1");
        assert_eq!(config.listen[0].family, Family::V6);
    }

    #[test]
    fn listener_flags() {
        let config = parse_ok(&["listen=:25 mode=bounce delay=10"]);
        let spec = &config.listen[0];
        assert_eq!(spec.mode, Some(ResponseMode::Bounce));
        assert_eq!(spec.delay, Some(Delay::Fixed(10)));
    }

    #[test]
    fn delay_range_survives_entry_splitting() {
        let config = parse_ok(&["listen=:25 mode=random delay=5,10, :26 mode=accept"]);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].delay, Some(Delay::Range(5, 10)));
        assert_eq!(config.listen[1].mode, Some(ResponseMode::Accept));
        assert_eq!(config.listen[1].port, 26);
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        assert!(matches!(
            parse(&["listen=:25 delay=10,5"]),
            Err(ConfigError::InvalidListener { .. })
        ));
    }

    #[test]
    fn unknown_listener_flag_is_rejected() {
        assert!(matches!(
            parse(&["listen=:25 color=red"]),
            Err(ConfigError::InvalidListener { .. })
        ));
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(matches!(
            parse(&["listen=127.0.0.1:notaport"]),
            Err(ConfigError::InvalidListener { .. })
        ));
    }

    #[test]
    fn invalid_mode_is_rejected() {
        assert!(matches!(
            parse(&["mode=kura"]),
            Err(ConfigError::InvalidValue { key: "mode", .. })
        ));
    }

    #[test]
    fn delay_longer_than_timeout() {
        let config = parse_ok(&["timeout=10", "delay=20"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "delay", .. })
        ));
    }

    #[test]
    fn delay_over_sixty() {
        let config = parse_ok(&["timeout=90", "delay=70"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "delay", .. })
        ));
    }

    #[test]
    fn listener_delay_over_sixty() {
        let config = parse_ok(&["timeout=0", "listen=:25 delay=61"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "delay", .. })
        ));
    }

    #[test]
    fn delay_below_timeout_is_fine() {
        let config = parse_ok(&["timeout=30", "delay=5"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.global_delay(), Some(Delay::Fixed(5)));
    }

    #[test]
    fn timeout_over_maximum() {
        let config = parse_ok(&["timeout=190"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "timeout", .. })
        ));
    }

    #[test]
    fn timeout_zero_disables() {
        let config = parse_ok(&["timeout=0", "delay=30"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = parse_ok(&["workers=0"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "workers", .. })
        ));
    }

    #[test]
    fn tls_listener_requires_material() {
        let config = parse_ok(&["tls_listen=:465"]);
        assert!(matches!(config.validate(), Err(ConfigError::IncompleteTls)));
    }

    #[test]
    fn tls_material_must_exist() {
        let config = parse_ok(&[
            "tls_listen=:465",
            "tls_cert=/nonexistent/cert.pem",
            "tls_key=/nonexistent/key.pem",
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTlsFile { .. })
        ));
    }

    #[test]
    fn tls_listener_with_material() {
        let cert = temp_pem("cert");
        let key = temp_pem("key");
        let config = parse_ok(&[
            "tls_listen=:465 mode=bounce",
            &format!("tls_cert={}", cert.display()),
            &format!("tls_key={}", key.display()),
        ]);
        assert!(config.validate().is_ok());
        assert!(config.tls_listen[0].tls);
        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[test]
    fn effective_mode_and_delay_shadow_the_global() {
        let config = parse_ok(&[
            "mode=bounce",
            "timeout=30",
            "delay=5",
            "listen=:25 mode=accept delay=10, :26",
        ]);
        assert_eq!(
            config.listen[0].effective_mode(&config),
            ResponseMode::Accept
        );
        assert_eq!(
            config.listen[0].effective_delay(&config),
            Some(Delay::Fixed(10))
        );
        assert_eq!(
            config.listen[1].effective_mode(&config),
            ResponseMode::Bounce
        );
        assert_eq!(
            config.listen[1].effective_delay(&config),
            Some(Delay::Fixed(5))
        );
    }

    #[test]
    fn dynamic_switch_parsing() {
        assert!(!parse_ok(&["dynamic_switch=false"]).dynamic_switch);
        assert!(parse_ok(&["dynamic_switch=true"]).dynamic_switch);
        assert!(matches!(
            parse(&["dynamic_switch=maybe"]),
            Err(ConfigError::InvalidValue { key: "dynamic_switch", .. })
        ));
    }

    fn temp_pem(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "blackhole-config-test-{tag}-{}.pem",
            std::process::id()
        ));
        std::fs::write(&path, "dummy").unwrap();
        path
    }
}
