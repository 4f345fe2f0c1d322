use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trellis::discovery::{Discovery, FileDiscovery, MultiDiscovery};
use trellis::server::tls::StaticCertProvider;
use trellis::ServeOptions;

/// Trellis — HTTPS edge router
#[derive(Parser)]
#[command(name = "trellis", version, about)]
struct Cli {
    /// Directory holding applications.json, ip-rules.json and dev-cert.pem
    #[arg(long, default_value = "/etc/trellis")]
    config_dir: PathBuf,

    /// HTTP listen address ("none" to disable)
    #[arg(long, default_value = "0.0.0.0:80")]
    listen_http: String,

    /// HTTPS listen address ("none" to disable)
    #[arg(long, default_value = "0.0.0.0:443")]
    listen_https: String,

    /// Metrics listen address ("none" to disable)
    #[arg(long, default_value = "0.0.0.0:9090")]
    listen_metrics: String,

    /// Root directory for response caches and turbocharger tiers
    #[arg(long, default_value = "/var/cache/trellis")]
    cache_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn listen_addr(raw: &str) -> anyhow::Result<Option<SocketAddr>> {
    if raw == "none" {
        return Ok(None);
    }
    Ok(Some(raw.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    // several rustls crypto providers may be linked in; pick ours explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing::info!("Trellis v{}", env!("CARGO_PKG_VERSION"));

    let mut readers: Vec<Box<dyn Discovery>> = Vec::new();
    let apps_file = cli.config_dir.join("applications.json");
    if let Some(file_discovery) = FileDiscovery::if_file_exists(&apps_file) {
        tracing::info!(path = %apps_file.display(), "file discovery enabled");
        readers.push(Box::new(file_discovery));
    }
    if readers.is_empty() {
        tracing::warn!("no discovery sources configured; starting with an empty app catalog");
    }
    let discovery = Arc::new(MultiDiscovery::new(readers));

    let listen_https = listen_addr(&cli.listen_https)?;

    // this is expected to be set up with mkcert or similar
    let dev_cert = cli.config_dir.join("dev-cert.pem");
    let cert_provider = match (listen_https, dev_cert.exists()) {
        (Some(_), true) => Some(
            Arc::new(StaticCertProvider::from_pem_file(&dev_cert)?)
                as Arc<dyn trellis::server::tls::CertificateProvider>,
        ),
        (Some(_), false) => {
            tracing::warn!(
                path = %dev_cert.display(),
                "certificate not found; HTTPS listener disabled"
            );
            None
        }
        (None, _) => None,
    };

    let options = ServeOptions {
        listen_http: listen_addr(&cli.listen_http)?,
        listen_https: if cert_provider.is_some() { listen_https } else { None },
        listen_metrics: listen_addr(&cli.listen_metrics)?,
        cert_provider,
        cache_root: cli.cache_dir,
        ip_rules_file: cli.config_dir.join("ip-rules.json"),
    };

    trellis::serve(discovery, options).await?;

    Ok(())
}
