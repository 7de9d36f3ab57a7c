use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::MAX_TALKGROUP;

/// Default UDP port of the MMDVM master protocol.
pub const DEFAULT_PORT: u16 = 62031;

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dmrelay.toml";

/// At most this many bytes of the password take part in the digest.
pub const MAX_PASSWORD_BYTES: usize = 120;

/// Server configuration.
///
/// Loaded once at startup from a TOML file. Every key has a default, a
/// missing file yields the default configuration, and unknown keys are
/// ignored, so a minimal deployment needs no file at all.
///
/// # Examples
///
/// ```
/// use dmrelay::Config;
///
/// let config = Config::default()
///     .with_port(62031)
///     .with_password("passw0rd")
///     .with_talkgroups(vec![3100]);
/// assert_eq!(config.general.udp_port, 62031);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub security: SecurityConfig,
    pub debug: DebugConfig,
}

/// `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// UDP port the server listens on.
    pub udp_port: u16,
    /// Minutes between housekeeping sweeps.
    pub housekeeping_minutes: u64,
    /// Talkgroups to open at startup in addition to the scanner and the
    /// TAC groups. Radio traffic never creates a talkgroup on its own.
    pub talkgroups: Vec<u32>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_PORT,
            housekeeping_minutes: 1,
            talkgroups: Vec::new(),
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared password for the RPTK challenge.
    pub password: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            password: "passw0rd".to_string(),
        }
    }
}

/// `[debug]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Non-zero enables verbose packet tracing, same as `-d`.
    pub level: u32,
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// A missing file is not an error: the defaults apply. A file that
    /// exists but fails to parse or validate is.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = match fs::read_to_string(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for &tg in &self.general.talkgroups {
            if !(1..MAX_TALKGROUP).contains(&tg) {
                return Err(Error::Config(format!("talkgroup {} out of range", tg)));
            }
        }
        Ok(())
    }

    /// Password bytes used in the digest, clamped to 120 bytes.
    pub fn password_bytes(&self) -> &[u8] {
        let bytes = self.security.password.as_bytes();
        &bytes[..bytes.len().min(MAX_PASSWORD_BYTES)]
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.general.udp_port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.security.password = password.into();
        self
    }

    pub fn with_housekeeping_minutes(mut self, minutes: u64) -> Self {
        self.general.housekeeping_minutes = minutes;
        self
    }

    pub fn with_talkgroups(mut self, talkgroups: Vec<u32>) -> Self {
        self.general.talkgroups = talkgroups;
        self
    }

    pub fn with_debug_level(mut self, level: u32) -> Self {
        self.debug.level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.udp_port, DEFAULT_PORT);
        assert_eq!(config.general.housekeeping_minutes, 1);
        assert!(config.general.talkgroups.is_empty());
        assert_eq!(config.security.password, "passw0rd");
        assert_eq!(config.debug.level, 0);
    }

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
            [general]
            udp_port = 55555
            housekeeping_minutes = 5
            talkgroups = [3100, 91]

            [security]
            password = "hunter2"

            [debug]
            level = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.general.udp_port, 55555);
        assert_eq!(config.general.housekeeping_minutes, 5);
        assert_eq!(config.general.talkgroups, vec![3100, 91]);
        assert_eq!(config.security.password, "hunter2");
        assert_eq!(config.debug.level, 1);
    }

    #[test]
    fn test_absent_keys_keep_defaults() {
        let config: Config = toml::from_str(
            r#"
            [security]
            password = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.udp_port, DEFAULT_PORT);
        assert_eq!(config.general.housekeeping_minutes, 1);
        assert_eq!(config.security.password, "hunter2");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/dmrelay.toml").unwrap();
        assert_eq!(config.general.udp_port, DEFAULT_PORT);
    }

    #[test]
    fn test_out_of_range_talkgroup_rejected() {
        let config = Config::default().with_talkgroups(vec![0]);
        assert!(config.validate().is_err());
        let config = Config::default().with_talkgroups(vec![10_000]);
        assert!(config.validate().is_err());
        let config = Config::default().with_talkgroups(vec![9_999]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_password_clamped() {
        let config = Config::default().with_password("x".repeat(200));
        assert_eq!(config.password_bytes().len(), MAX_PASSWORD_BYTES);
        let config = Config::default().with_password("short");
        assert_eq!(config.password_bytes(), b"short");
    }
}
