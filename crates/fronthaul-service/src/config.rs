//! Server configuration
//!
//! Loaded from a JSON file whose field names match the original deployment
//! knobs. Everything has a workable default except the meek key material,
//! which must be provisioned.

use std::{fs, io, net::SocketAddr, path::Path, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use thiserror::Error;

use fronthaul::cookie::COOKIE_KEY_LENGTH;

/// Default idle lifetime of a UDP port forward
pub const DEFAULT_IDLE_UDP_PORT_FORWARD_TIMEOUT_MILLISECONDS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the meek listener binds to
    #[serde(rename = "ListenAddress")]
    pub listen_address: String,

    /// Serve HTTPS with the meek TLS profile instead of plain HTTP
    #[serde(rename = "UseTLS")]
    pub use_tls: bool,

    /// Shared keyword for the cookie obfuscation handshake
    #[serde(rename = "MeekObfuscatedKey")]
    pub meek_obfuscated_key: String,

    /// Base64 X25519 private key that opens meek cookie payloads
    #[serde(rename = "MeekCookieEncryptionPrivateKey")]
    pub meek_cookie_encryption_private_key: String,

    /// Common name for the self-signed HTTPS certificate
    #[serde(rename = "MeekCertificateCommonName")]
    pub meek_certificate_common_name: Option<String>,

    /// Header names whose presence rejects a meek request
    #[serde(rename = "MeekProhibitedHeaders")]
    pub meek_prohibited_headers: Vec<String>,

    /// Headers consulted, in order, for the proxied client address
    #[serde(rename = "MeekProxyForwardedForHeaders")]
    pub meek_proxy_forwarded_for_headers: Vec<String>,

    /// Replacement resolver address for transparently forwarded DNS
    #[serde(rename = "UDPForwardDNSServerAddress")]
    pub udp_forward_dns_server_address: Option<String>,

    /// Idle lifetime of a UDP port forward; 0 disables the timeout
    #[serde(rename = "IdleUDPPortForwardTimeoutMilliseconds")]
    pub idle_udp_port_forward_timeout_milliseconds: u64,

    /// Per-client cap on concurrent UDP port forwards; 0 means no cap
    #[serde(rename = "MaxUDPPortForwardCount")]
    pub max_udp_port_forward_count: i64,

    /// When non-empty, the only permitted UDP remote ports
    #[serde(rename = "AllowUDPPorts")]
    pub allow_udp_ports: Vec<u16>,

    /// UDP remote ports always refused
    #[serde(rename = "DenyUDPPorts")]
    pub deny_udp_ports: Vec<u16>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_address: "127.0.0.1:8080".to_owned(),
            use_tls: false,
            meek_obfuscated_key: String::new(),
            meek_cookie_encryption_private_key: String::new(),
            meek_certificate_common_name: None,
            meek_prohibited_headers: Vec::new(),
            meek_proxy_forwarded_for_headers: Vec::new(),
            udp_forward_dns_server_address: None,
            idle_udp_port_forward_timeout_milliseconds:
                DEFAULT_IDLE_UDP_PORT_FORWARD_TIMEOUT_MILLISECONDS,
            max_udp_port_forward_count: 0,
            allow_udp_ports: Vec::new(),
            deny_udp_ports: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Config::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "ListenAddress: {}",
                self.listen_address
            )));
        }

        if self.meek_obfuscated_key.is_empty() {
            return Err(ConfigError::Invalid("MeekObfuscatedKey is required".to_owned()));
        }

        match BASE64.decode(&self.meek_cookie_encryption_private_key) {
            Ok(key) if key.len() == COOKIE_KEY_LENGTH => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "MeekCookieEncryptionPrivateKey is not a valid key".to_owned(),
                ));
            }
        }

        if let Some(ref address) = self.udp_forward_dns_server_address {
            if address.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "UDPForwardDNSServerAddress: {address}"
                )));
            }
        }

        Ok(())
    }

    /// The idle timeout for UDP port forwards, if one is configured
    pub fn idle_udp_port_forward_timeout(&self) -> Option<Duration> {
        if self.idle_udp_port_forward_timeout_milliseconds == 0 {
            None
        } else {
            Some(Duration::from_millis(
                self.idle_udp_port_forward_timeout_milliseconds,
            ))
        }
    }

    /// The validated transparent DNS forwarding address, if configured
    pub fn udp_forward_dns_address(&self) -> Option<SocketAddr> {
        self.udp_forward_dns_server_address
            .as_ref()
            .and_then(|address| address.parse().ok())
    }
}
