//! TLS configuration for a meek HTTPS listener
//!
//! The configuration is optimized for fronted meek, where the TLS peer is an
//! uncensored CDN: non-ephemeral key exchange suites are preferred since
//! they greatly reduce server load, and the meek layer provides obfuscation
//! rather than privacy or integrity (those come from the tunneled protocol),
//! so forward secrecy buys nothing here.

use openssl::{
    pkey::PKey,
    ssl::{AlpnError, SslAcceptor, SslAcceptorBuilder, SslMethod, SslOptions, SslVersion},
    x509::X509,
};
use rcgen::{CertificateParams, DnType, KeyPair};
use thiserror::Error;

use crate::config::Config;

/// RSA key exchange first, ECDHE after; GCM preferred within each group
const MEEK_CIPHER_LIST: &str = "AES128-GCM-SHA256:AES256-GCM-SHA384:RC4-SHA:AES128-SHA:AES256-SHA:\
                                DES-CBC3-SHA:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES128-GCM-SHA256:\
                                ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES256-GCM-SHA384:\
                                ECDHE-RSA-AES128-SHA:ECDHE-ECDSA-AES128-SHA:ECDHE-RSA-AES256-SHA:\
                                ECDHE-ECDSA-AES256-SHA:ECDHE-RSA-DES-CBC3-SHA";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("TLS setup failed: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

/// Builds the acceptor for a meek HTTPS listener: a certificate self-signed
/// for the configured common name, TLS 1.0 through 1.2 with the fixed cipher
/// ordering enforced server-side, and HTTP/1.1 as the only ALPN protocol.
pub fn make_tls_acceptor(config: &Config) -> Result<SslAcceptor, TlsError> {
    let common_name = config
        .meek_certificate_common_name
        .as_deref()
        .unwrap_or("www.example.org");

    let mut params = CertificateParams::new(Vec::new())?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key_pair = KeyPair::generate()?;
    let certificate = params.self_signed(&key_pair)?;

    let x509 = X509::from_pem(certificate.pem().as_bytes())?;
    let private_key = PKey::private_key_from_pem(key_pair.serialize_pem().as_bytes())?;

    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls_server())?;
    apply_meek_tls_settings(&mut builder)?;
    builder.set_certificate(&x509)?;
    builder.set_private_key(&private_key)?;
    builder.check_private_key()?;

    Ok(builder.build())
}

fn apply_meek_tls_settings(builder: &mut SslAcceptorBuilder) -> Result<(), openssl::error::ErrorStack> {
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    // The cipher ordering below only governs TLS 1.2 and earlier; TLS 1.3
    // negotiates its own suites and would bypass the RSA-kex preference.
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    // The legacy RC4 and 3DES entries require a relaxed security level
    builder.set_security_level(0);
    builder.set_options(SslOptions::CIPHER_SERVER_PREFERENCE);
    builder.set_cipher_list(MEEK_CIPHER_LIST)?;
    builder.set_alpn_select_callback(|_, client_protos| {
        openssl::ssl::select_next_proto(b"\x08http/1.1", client_protos).ok_or(AlpnError::NOACK)
    });
    Ok(())
}
