//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::io;

use crate::build;
use crate::manager::TtlPolicy;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_HTTP_PORT: u16 = 5010;
pub const DEFAULT_TTL_MS: u64 = 30_000;
pub const MAX_TTL_MS: u64 = 300_000;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "lock-server", version = VERSION_INFO, about = "Resource lock server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "LOCK_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "LOCK_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "LOCK_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "LOCK_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "LOCK_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "LOCK_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "LOCK_DEFAULT_TTL_MS",
        default_value_t = DEFAULT_TTL_MS,
        help = "TTL applied when a request omits it, in milliseconds"
    )]
    pub default_ttl_ms: u64,
    #[arg(
        long,
        env = "LOCK_MAX_TTL_MS",
        default_value_t = MAX_TTL_MS,
        help = "Upper bound for requested TTLs, in milliseconds"
    )]
    pub max_ttl_ms: u64,
    #[arg(
        long,
        env = "LOCK_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Interval between expired lock sweeps in seconds"
    )]
    pub sweep_interval_secs: u64,
}

impl Args {
    /// 校验 TTL 与清扫间隔的取值关系。
    pub fn validate(&self) -> io::Result<()> {
        if self.default_ttl_ms == 0 || self.max_ttl_ms == 0 {
            return Err(invalid_input("ttl values must be positive"));
        }
        if self.default_ttl_ms > self.max_ttl_ms {
            return Err(invalid_input("default ttl must not exceed max ttl"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid_input("sweep interval must be positive"));
        }
        Ok(())
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            default_ttl_ms: self.default_ttl_ms,
            max_ttl_ms: self.max_ttl_ms,
        }
    }
}

fn invalid_input(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}
