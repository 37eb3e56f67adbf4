// src/config.rs
//
// server.conf loading. The file is TOML; every key has a default so a
// missing file or section falls back to a usable plain-HTTP setup.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds an idle keep-alive connection is held.
    pub keepalive_timeout: u64,
    /// Seconds a client has to finish its request headers.
    pub headers_timeout: u64,
    /// Expose the built-in `GET /server_status` plugin.
    pub server_status: bool,
    /// Plain HTTP listen port; negative disables the listener.
    pub http_port: i32,
    /// listen(2) backlog.
    pub queued_connections: u32,
    /// Per-peer connection cap.
    pub max_connections_per_ip: u32,
    /// Sort ready sessions by their order before dispatch.
    pub workload_balancing: bool,
    /// TLS accept handshake deadline, seconds.
    pub accept_timeout: u64,
    /// TLS orderly shutdown deadline, seconds.
    pub shutdown_timeout: u64,
    pub https: Https,
    pub privileges: Privileges,
    /// Forwarded to the logger setup.
    pub logging: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_timeout: 10,
            headers_timeout: 5,
            server_status: false,
            http_port: 8080,
            queued_connections: 20_000,
            max_connections_per_ip: 500,
            workload_balancing: true,
            accept_timeout: 5,
            shutdown_timeout: 2,
            https: Https::default(),
            privileges: Privileges::default(),
            logging: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Https {
    pub enabled: bool,
    pub port: i32,
    pub ssl: Ssl,
}

impl Default for Https {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8443,
            ssl: Ssl::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ssl {
    /// `TLS` is the only supported context method.
    pub ctx_method: String,
    /// Key/value settings for the TLS context; `Certificate` and
    /// `PrivateKey` name the PEM files, unrecognized keys are logged and
    /// ignored.
    pub cxt_settings: BTreeMap<String, String>,
}

impl Default for Ssl {
    fn default() -> Self {
        Self {
            ctx_method: "TLS".into(),
            cxt_settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Privileges {
    pub drop: bool,
    pub user: String,
    pub group: String,
}

impl Config {
    /// Reads `server.conf` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("server.conf");
        let text = std::fs::read_to_string(&path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Unknown(format!("{}: {e}", path.display())))
    }
}

/// Builds the rustls server context from the `[https.ssl]` section.
/// Relative certificate paths resolve against the configuration
/// directory.
pub fn build_tls_config(ssl: &Ssl, conf_dir: &Path) -> Result<Arc<rustls::ServerConfig>> {
    if !ssl.ctx_method.eq_ignore_ascii_case("TLS") {
        return Err(Error::Unknown(format!(
            "unsupported ssl ctx_method {:?}",
            ssl.ctx_method
        )));
    }

    let mut cert_path = None;
    let mut key_path = None;
    for (key, value) in &ssl.cxt_settings {
        match key.as_str() {
            "Certificate" => cert_path = Some(value),
            "PrivateKey" => key_path = Some(value),
            other => log::debug!("ignoring ssl ctx setting {other:?}"),
        }
    }
    let cert_path = cert_path.ok_or_else(|| Error::Unknown("missing ssl Certificate".into()))?;
    let key_path = key_path.ok_or_else(|| Error::Unknown("missing ssl PrivateKey".into()))?;

    let mut cert_reader = BufReader::new(File::open(conf_dir.join(cert_path))?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Unknown(format!("no certificates in {cert_path}")));
    }

    let mut key_reader = BufReader::new(File::open(conf_dir.join(key_path))?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Unknown(format!("no private key in {key_path}")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Unknown(format!("tls context: {e}")))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.keepalive_timeout, 10);
        assert_eq!(config.headers_timeout, 5);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.max_connections_per_ip, 500);
        assert!(!config.https.enabled);
    }

    #[test]
    fn parses_nested_sections() {
        let config: Config = toml::from_str(
            r#"
            keepalive_timeout = 30
            http_port = -1
            server_status = true

            [https]
            enabled = true
            port = 9443

            [https.ssl]
            ctx_method = "TLS"

            [https.ssl.cxt_settings]
            Certificate = "cert.pem"
            PrivateKey = "key.pem"

            [privileges]
            drop = true
            user = "www"
            "#,
        )
        .unwrap();
        assert_eq!(config.keepalive_timeout, 30);
        assert_eq!(config.http_port, -1);
        assert!(config.server_status);
        assert!(config.https.enabled);
        assert_eq!(config.https.port, 9443);
        assert_eq!(
            config.https.ssl.cxt_settings.get("Certificate").unwrap(),
            "cert.pem"
        );
        assert!(config.privileges.drop);
        assert_eq!(config.privileges.user, "www");
    }
}
