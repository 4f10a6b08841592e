//! Fronthaul Service
//!
//! Server implementation of the fronthaul circumvention tunnel: a meek
//! HTTP(S) front that disguises each client's byte stream as ordinary web
//! traffic, multiplexing the client's UDP port forwards over that stream
//! with the udpgw protocol.
//!
//! Write the deployment parameters to a JSON configuration file:
//!
//! ```json
//! {
//!     "ListenAddress": "0.0.0.0:443",
//!     "UseTLS": true,
//!     "MeekObfuscatedKey": "example-obfuscation-keyword",
//!     "MeekCookieEncryptionPrivateKey": "base64-x25519-private-key",
//!     "MeekCertificateCommonName": "www.example.org",
//!     "MeekProxyForwardedForHeaders": ["X-Forwarded-For"],
//!     "MaxUDPPortForwardCount": 32
//! }
//! ```
//!
//! and run the server with
//!
//! ```bash
//! cargo run --bin fronthauld -- -c fronthaul.json
//! ```

pub use self::{
    config::{Config, ConfigError},
    server::run,
};

pub mod config;
pub mod server;
