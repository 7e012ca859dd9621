//! TLS configuration and certificate loading.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::TlsConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Load the rustls config for an optional `[listener.tls]` section.
pub async fn load_optional(tls: Option<&TlsConfig>) -> Result<Option<RustlsConfig>, std::io::Error> {
    match tls {
        Some(tls) => {
            let config = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            tracing::info!(cert = %tls.cert_path, "TLS enabled for websocket transport");
            Ok(Some(config))
        }
        None => Ok(None),
    }
}
