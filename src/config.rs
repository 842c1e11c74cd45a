//! Configuration module for the watchdog.
//!
//! Loads the YAML probe list and resolves every entry into an immutable
//! [`ProbeSpec`]. Any problem here is fatal: the process does not start
//! monitoring with a partially valid configuration.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Generic internet reachability check used when a probe has no target.
pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Port used when `server.hostname` carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Upper bound on one remediation attempt when `server.timeout` is unset.
pub const DEFAULT_REMEDIATION_TIMEOUT: Duration = Duration::from_secs(60);

const PING_PREFIX: &str = "ping ";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no probes configured")]
    NoProbes,
    #[error("probe {probe}: invalid {field} {value:?}: {reason}")]
    InvalidDuration {
        probe: String,
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("probe {probe}: invalid down times {value}, must be at least 1")]
    InvalidDownTimes { probe: String, value: i64 },
    #[error("probe {probe}: invalid probe url {value:?}: {reason}")]
    InvalidProbeUrl {
        probe: String,
        value: String,
        reason: String,
    },
    #[error("probe {probe}: invalid server hostname {value:?}")]
    InvalidHostname { probe: String, value: String },
    #[error("probe {probe}: missing {field}")]
    MissingField { probe: String, field: &'static str },
    #[error("probe {probe}: one of server.password or server.key_file is required")]
    MissingCredentials { probe: String },
}

/// How a target is checked. Fixed when the configuration is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// GET the URL; 200 and 204 are healthy.
    Http { url: String },
    /// ICMP echo sequence against the host.
    Icmp { host: String },
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Http { url } => write!(f, "http {}", url),
            ProbeKind::Icmp { host } => write!(f, "ping {}", host),
        }
    }
}

/// The remote host a recovery command is run on.
#[derive(Clone, PartialEq, Eq)]
pub struct RemediationTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub command: String,
    pub timeout: Duration,
}

impl RemediationTarget {
    /// `host:port` form used in log lines.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for RemediationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemediationTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A fully resolved probe. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub name: String,
    pub kind: ProbeKind,
    pub timeout: Duration,
    pub interval: Duration,
    /// Consecutive failures before remediation, always >= 1.
    pub down_times: u32,
    pub server: RemediationTarget,
}

/// The loaded watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub probes: Vec<ProbeSpec>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    probes: Vec<RawProbe>,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(default)]
    name: String,
    #[serde(default)]
    probe_url: String,
    #[serde(default)]
    timeout: String,
    #[serde(default)]
    interval: String,
    #[serde(default)]
    down_times: i64,
    server: RawServer,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    key_file: String,
    #[serde(default)]
    reset_command: String,
    #[serde(default)]
    timeout: Option<String>,
}

impl WatchdogConfig {
    /// Load and resolve configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and resolve configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        if raw.probes.is_empty() {
            return Err(ConfigError::NoProbes);
        }

        let probes = raw
            .probes
            .into_iter()
            .map(RawProbe::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { probes })
    }
}

impl RawProbe {
    fn resolve(self) -> Result<ProbeSpec, ConfigError> {
        let name = if self.name.is_empty() {
            self.server.hostname.clone()
        } else {
            self.name
        };

        let kind = parse_probe_kind(&name, &self.probe_url)?;
        let timeout = parse_duration(&name, "timeout", &self.timeout)?;
        let interval = parse_duration(&name, "interval", &self.interval)?;

        if self.down_times <= 0 {
            return Err(ConfigError::InvalidDownTimes {
                probe: name,
                value: self.down_times,
            });
        }
        let down_times =
            u32::try_from(self.down_times).map_err(|_| ConfigError::InvalidDownTimes {
                probe: name.clone(),
                value: self.down_times,
            })?;

        let server = self.server.resolve(&name)?;

        Ok(ProbeSpec {
            name,
            kind,
            timeout,
            interval,
            down_times,
            server,
        })
    }
}

impl RawServer {
    fn resolve(self, probe: &str) -> Result<RemediationTarget, ConfigError> {
        let (host, port) = split_host_port(&self.hostname).ok_or_else(|| {
            ConfigError::InvalidHostname {
                probe: probe.to_string(),
                value: self.hostname.clone(),
            }
        })?;

        if self.username.is_empty() {
            return Err(ConfigError::MissingField {
                probe: probe.to_string(),
                field: "server.username",
            });
        }
        if self.reset_command.is_empty() {
            return Err(ConfigError::MissingField {
                probe: probe.to_string(),
                field: "server.reset_command",
            });
        }

        let password = Some(self.password).filter(|p| !p.is_empty());
        let key_file = Some(self.key_file)
            .filter(|k| !k.is_empty())
            .map(|k| expand_home(&k));
        if password.is_none() && key_file.is_none() {
            return Err(ConfigError::MissingCredentials {
                probe: probe.to_string(),
            });
        }

        let timeout = match self.timeout.as_deref() {
            Some(value) => parse_duration(probe, "server.timeout", value)?,
            None => DEFAULT_REMEDIATION_TIMEOUT,
        };

        Ok(RemediationTarget {
            host,
            port,
            username: self.username,
            password,
            key_file,
            command: self.reset_command,
            timeout,
        })
    }
}

fn parse_probe_kind(probe: &str, probe_url: &str) -> Result<ProbeKind, ConfigError> {
    let probe_url = probe_url.trim();
    if probe_url.is_empty() {
        return Ok(ProbeKind::Http {
            url: DEFAULT_PROBE_URL.to_string(),
        });
    }

    if let Some(host) = probe_url.strip_prefix(PING_PREFIX) {
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidProbeUrl {
                probe: probe.to_string(),
                value: probe_url.to_string(),
                reason: "missing ping host".to_string(),
            });
        }
        return Ok(ProbeKind::Icmp {
            host: host.to_string(),
        });
    }

    let url = reqwest::Url::parse(probe_url).map_err(|e| ConfigError::InvalidProbeUrl {
        probe: probe.to_string(),
        value: probe_url.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidProbeUrl {
            probe: probe.to_string(),
            value: probe_url.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }

    Ok(ProbeKind::Http {
        url: probe_url.to_string(),
    })
}

fn parse_duration(probe: &str, field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDuration {
        probe: probe.to_string(),
        field,
        value: value.to_string(),
        reason,
    };

    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            probe: probe.to_string(),
            field,
        });
    }

    let duration = humantime::parse_duration(value.trim()).map_err(|e| invalid(e.to_string()))?;
    if duration.is_zero() {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(duration)
}

/// Split `host`, `host:port`, `[v6]:port` or a bare IPv6 literal.
fn split_host_port(hostname: &str) -> Option<(String, u16)> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return None;
    }

    if let Some(rest) = hostname.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match tail {
            "" => DEFAULT_SSH_PORT,
            _ => tail.strip_prefix(':')?.parse().ok()?,
        };
        return Some((host.to_string(), port));
    }

    match hostname.matches(':').count() {
        0 => Some((hostname.to_string(), DEFAULT_SSH_PORT)),
        1 => {
            let (host, port) = hostname.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((hostname.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
probes:
  - name: office
    probe_url: https://example.com/health
    timeout: 3s
    interval: 1m
    down_times: 3
    server:
      hostname: 192.168.1.1:2222
      username: admin
      password: hunter2
      reset_command: /sbin/reboot
      timeout: 90s
  - probe_url: ping 8.8.8.8
    timeout: 5s
    interval: 30s
    down_times: 1
    server:
      hostname: router.lan
      username: root
      key_file: /etc/watchdog/id_ed25519
      reset_command: reboot
"#;

    fn single(probe_url: &str, down_times: i64, server: &str) -> String {
        format!(
            "probes:\n  - probe_url: \"{}\"\n    timeout: 5s\n    interval: 10s\n    down_times: {}\n    server:\n{}",
            probe_url, down_times, server
        )
    }

    const SERVER: &str =
        "      hostname: 10.0.0.1\n      username: root\n      password: pw\n      reset_command: reboot\n";

    #[test]
    fn test_full_config() {
        let cfg = WatchdogConfig::from_yaml(FULL).unwrap();
        assert_eq!(cfg.probes.len(), 2);

        let office = &cfg.probes[0];
        assert_eq!(office.name, "office");
        assert_eq!(
            office.kind,
            ProbeKind::Http {
                url: "https://example.com/health".to_string()
            }
        );
        assert_eq!(office.timeout, Duration::from_secs(3));
        assert_eq!(office.interval, Duration::from_secs(60));
        assert_eq!(office.down_times, 3);
        assert_eq!(office.server.host, "192.168.1.1");
        assert_eq!(office.server.port, 2222);
        assert_eq!(office.server.password.as_deref(), Some("hunter2"));
        assert_eq!(office.server.key_file, None);
        assert_eq!(office.server.timeout, Duration::from_secs(90));

        let router = &cfg.probes[1];
        assert_eq!(router.name, "router.lan");
        assert_eq!(
            router.kind,
            ProbeKind::Icmp {
                host: "8.8.8.8".to_string()
            }
        );
        assert_eq!(router.server.port, DEFAULT_SSH_PORT);
        assert_eq!(router.server.password, None);
        assert_eq!(
            router.server.key_file,
            Some(PathBuf::from("/etc/watchdog/id_ed25519"))
        );
        assert_eq!(router.server.timeout, DEFAULT_REMEDIATION_TIMEOUT);
    }

    #[test]
    fn test_default_probe_url() {
        let cfg = WatchdogConfig::from_yaml(&single("", 2, SERVER)).unwrap();
        assert_eq!(
            cfg.probes[0].kind,
            ProbeKind::Http {
                url: DEFAULT_PROBE_URL.to_string()
            }
        );
        assert_eq!(cfg.probes[0].name, "10.0.0.1");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let cfg = WatchdogConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.probes.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = WatchdogConfig::from_file("/nonexistent/watchdog.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_no_probes() {
        assert!(matches!(
            WatchdogConfig::from_yaml("probes: []").unwrap_err(),
            ConfigError::NoProbes
        ));
        assert!(matches!(
            WatchdogConfig::from_yaml("{}").unwrap_err(),
            ConfigError::NoProbes
        ));
    }

    #[test]
    fn test_invalid_down_times() {
        for value in [0, -1] {
            let err = WatchdogConfig::from_yaml(&single("", value, SERVER)).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDownTimes { .. }), "{}", err);
        }
    }

    #[test]
    fn test_invalid_durations() {
        let yaml = single("", 1, SERVER).replace("timeout: 5s", "timeout: 0s");
        assert!(matches!(
            WatchdogConfig::from_yaml(&yaml).unwrap_err(),
            ConfigError::InvalidDuration { field: "timeout", .. }
        ));

        let yaml = single("", 1, SERVER).replace("interval: 10s", "interval: soon");
        assert!(matches!(
            WatchdogConfig::from_yaml(&yaml).unwrap_err(),
            ConfigError::InvalidDuration { field: "interval", .. }
        ));

        let yaml = single("", 1, SERVER).replace("    interval: 10s\n", "");
        assert!(matches!(
            WatchdogConfig::from_yaml(&yaml).unwrap_err(),
            ConfigError::MissingField { field: "interval", .. }
        ));
    }

    #[test]
    fn test_missing_credentials() {
        let server = "      hostname: 10.0.0.1\n      username: root\n      reset_command: reboot\n";
        let err = WatchdogConfig::from_yaml(&single("", 1, server)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentials { .. }));
    }

    #[test]
    fn test_both_credentials_accepted() {
        let server = "      hostname: 10.0.0.1\n      username: root\n      password: pw\n      key_file: /k\n      reset_command: reboot\n";
        let cfg = WatchdogConfig::from_yaml(&single("", 1, server)).unwrap();
        assert!(cfg.probes[0].server.password.is_some());
        assert!(cfg.probes[0].server.key_file.is_some());
    }

    #[test]
    fn test_missing_reset_command() {
        let server = "      hostname: 10.0.0.1\n      username: root\n      password: pw\n";
        let err = WatchdogConfig::from_yaml(&single("", 1, server)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "server.reset_command",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_probe_urls() {
        for url in ["ping ", "ftp://example.com", "not a url"] {
            let err = WatchdogConfig::from_yaml(&single(url, 1, SERVER)).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidProbeUrl { .. }), "{}", url);
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("router"), Some(("router".to_string(), 22)));
        assert_eq!(split_host_port("router:2200"), Some(("router".to_string(), 2200)));
        assert_eq!(split_host_port("[fe80::1]:23"), Some(("fe80::1".to_string(), 23)));
        assert_eq!(split_host_port("[fe80::1]"), Some(("fe80::1".to_string(), 22)));
        assert_eq!(split_host_port("fe80::1"), Some(("fe80::1".to_string(), 22)));
        assert_eq!(split_host_port(""), None);
        assert_eq!(split_host_port(":22"), None);
        assert_eq!(split_host_port("router:ssh"), None);
    }

    #[test]
    fn test_password_redacted() {
        let cfg = WatchdogConfig::from_yaml(FULL).unwrap();
        let debug = format!("{:?}", cfg.probes[0].server);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_address_display() {
        let cfg = WatchdogConfig::from_yaml(FULL).unwrap();
        assert_eq!(cfg.probes[0].server.address(), "192.168.1.1:2222");
    }
}
