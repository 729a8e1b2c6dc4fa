//! [AMBIENT] A1 — configuration loader. JSON over a file path or stdin.

use std::io::Read;

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};

use crate::error::EngineError;

/// One configured IMAP server (spec §3 "Server descriptor").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub uri: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "useTls", default = "default_use_tls")]
    pub use_tls: bool,
}

fn default_use_tls() -> bool {
    true
}

/// Top-level configuration (spec §3/§6). Unknown fields are ignored, matching
/// the §6 contract; none of the `#[serde]` attributes set
/// `deny_unknown_fields`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub maildir: String,
    #[serde(rename = "commonInbox", default)]
    pub common_inbox: bool,
    #[serde(rename = "dbUri", default)]
    pub db_uri: Option<String>,
    #[serde(default)]
    pub verbose: u8,
    #[serde(default)]
    pub profiler: Option<String>,
}

impl Config {
    /// Loads configuration from `path`. `path == "-"` reads from standard
    /// input instead of opening a file, per §6.
    pub fn load(path: &str) -> Result<Config, EngineError> {
        let content = if path == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read configuration from stdin")
                .map_err(EngineError::Other)?;
            buf
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read configuration file {path:?}"))
                .map_err(EngineError::Other)?
        };

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| EngineError::ConfigInvalid(format!("malformed JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The default config path `$HOME/.goimapsyncrc`, matching §6.
    pub fn default_path() -> Result<String, EngineError> {
        let home = std::env::var("HOME")
            .map_err(|_| EngineError::ConfigInvalid("HOME is not set".to_owned()))?;
        Ok(format!("{}/.goimapsyncrc", home))
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.maildir.trim().is_empty() {
            return Err(EngineError::ConfigInvalid(
                "maildir must not be empty".to_owned(),
            ));
        }
        if self.servers.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "at least one server must be configured".to_owned(),
            ));
        }
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(EngineError::ConfigInvalid(
                    "every server must have a non-empty name".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// The resolved index path: `dbUri` if set, defaulting to
    /// `sqlite3://<maildir>/.goimapsync.db` per §6. A leading `sqlite3://`
    /// scheme is stripped, since `rusqlite::Connection::open` wants a plain
    /// filesystem path, not a URI.
    pub fn index_path(&self) -> String {
        let uri = self
            .db_uri
            .clone()
            .unwrap_or_else(|| format!("sqlite3://{}/.goimapsync.db", self.maildir));
        uri.strip_prefix("sqlite3://")
            .map(|s| s.to_owned())
            .unwrap_or(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "servers": [
                {"name": "s1", "uri": "imap.example.com:993", "username": "u", "password": "p"}
            ],
            "maildir": "/tmp/mail",
            "commonInbox": true,
            "extraUnknownField": 42
        }"#
    }

    #[test]
    fn parses_minimal_config_and_ignores_unknown_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(sample_json().as_bytes()).unwrap();
        let config = Config::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "s1");
        assert!(config.servers[0].use_tls);
        assert!(config.common_inbox);
    }

    #[test]
    fn rejects_missing_maildir() {
        let bad = r#"{"servers": [{"name":"s1","uri":"x","username":"u","password":"p"}], "maildir": ""}"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bad.as_bytes()).unwrap();
        let err = Config::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not json").unwrap();
        let err = Config::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn index_path_defaults_and_strips_scheme() {
        let mut config = serde_json::from_str::<Config>(sample_json()).unwrap();
        assert_eq!(config.index_path(), "/tmp/mail/.goimapsync.db");
        config.db_uri = Some("sqlite3://custom/path.db".to_owned());
        assert_eq!(config.index_path(), "custom/path.db");
    }
}
