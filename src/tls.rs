//! HTTPS 监听的 TLS 配置：加载证书或生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Args;

const SELF_SIGNED_CERT_FILE: &str = "lock-server-cert.pem";
const SELF_SIGNED_KEY_FILE: &str = "lock-server-key.pem";

/// 证书与私钥的 PEM 路径。
#[derive(Debug, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub self_signed: bool,
}

/// 构建 Rustls 配置。
pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<RustlsConfig> {
    let paths = resolve_cert_paths(args, host)?;
    info!(cert = ?paths.cert, self_signed = paths.self_signed, "loading tls certificate");
    let cert = fs::read(&paths.cert).await?;
    let key = fs::read(&paths.key).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 证书与私钥须成对提供，否则退回到自签名证书。
pub fn resolve_cert_paths(args: &Args, host: IpAddr) -> io::Result<CertPaths> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Ok(CertPaths {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
            self_signed: false,
        }),
        (None, None) => generate_self_signed(host),
        (cert, key) => {
            warn!(
                cert_set = cert.is_some(),
                key_set = key.is_some(),
                "tls cert and key must be set together, falling back to self-signed"
            );
            generate_self_signed(host)
        }
    }
}

fn generate_self_signed(host: IpAddr) -> io::Result<CertPaths> {
    let cert = generate_simple_self_signed([host.to_string(), "localhost".to_string()])
        .map_err(|err| io::Error::other(err.to_string()))?;
    let dir = std::env::temp_dir();
    let paths = CertPaths {
        cert: dir.join(SELF_SIGNED_CERT_FILE),
        key: dir.join(SELF_SIGNED_KEY_FILE),
        self_signed: true,
    };
    std::fs::write(&paths.cert, cert.cert.pem())?;
    std::fs::write(&paths.key, cert.key_pair.serialize_pem())?;
    info!(path = ?paths.cert, "generated self-signed cert");
    Ok(paths)
}
