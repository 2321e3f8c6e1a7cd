//! Tapline CLI - A programmable HTTP/S interception proxy

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing_subscriber::EnvFilter;

use tapline::tls::{install_crypto_provider, Authority};
use tapline::{Config, Error, Exporter, ProxyServer};

#[derive(Parser)]
#[command(name = "tapline")]
#[command(about = "A programmable HTTP/S interception proxy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run(RunArgs),

    /// Generate a new CA certificate
    GenerateCa {
        /// Output directory for the certificate and key
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Certificate filename
        #[arg(long, default_value = "ca.crt")]
        cert_name: String,

        /// Key filename
        #[arg(long, default_value = "ca.key")]
        key_name: String,

        /// Organization name in the certificate subject
        #[arg(long, default_value = "tapline")]
        organization: String,

        /// Validity of the root certificate, in days
        #[arg(long, default_value_t = 365)]
        validity_days: u64,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Via signature and certificate organization
    #[arg(long)]
    signature: Option<String>,

    /// Host name that addresses the configuration API
    #[arg(long)]
    api_host: Option<String>,

    /// Add CORS headers to configuration API responses
    #[arg(long)]
    cors: bool,

    /// Path to CA certificate (overrides config)
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to CA private key (overrides config)
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Splice CONNECT tunnels instead of decrypting them
    #[arg(long)]
    no_mitm: bool,

    /// Half-width of leaf certificate validity, in seconds
    #[arg(long)]
    validity: Option<u64>,

    /// Skip verification of upstream certificates (insecure)
    #[arg(long)]
    skip_tls_verify: bool,

    /// Transaction log file
    #[arg(long)]
    log: Option<String>,

    /// Do not write a transaction log file
    #[arg(long, conflicts_with = "log")]
    no_log: bool,

    /// Seconds between transaction log exports
    #[arg(long)]
    log_sync_interval: Option<u64>,

    /// Whether CONNECT entries are left out of the transaction log
    #[arg(long)]
    skip_connect_log: Option<bool>,

    /// Upstream dial timeout, in seconds
    #[arg(long)]
    dialer_timeout: Option<u64>,

    /// Never reuse upstream connections
    #[arg(long)]
    disable_keepalive: bool,

    /// How long idle upstream connections are kept, in seconds
    #[arg(long)]
    keepalive_duration: Option<u64>,

    /// JSON modifier message installed at startup
    #[arg(long)]
    pipeline: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn apply(self, cfg: &mut Config) {
        if let Some(addr) = self.bind {
            cfg.proxy.bind_address = addr;
        }
        if let Some(signature) = self.signature {
            cfg.proxy.signature = signature;
        }
        if let Some(host) = self.api_host {
            cfg.proxy.api_host = host;
        }
        if self.cors {
            cfg.proxy.cors = true;
        }
        if let Some(cert) = self.ca_cert {
            cfg.tls.ca_cert = Some(cert.to_string_lossy().to_string());
        }
        if let Some(key) = self.ca_key {
            cfg.tls.ca_key = Some(key.to_string_lossy().to_string());
        }
        if self.no_mitm {
            cfg.tls.mitm = false;
        }
        if let Some(secs) = self.validity {
            cfg.tls.validity_secs = secs;
        }
        if self.skip_tls_verify {
            cfg.tls.skip_tls_verify = true;
        }
        if let Some(path) = self.log {
            cfg.log.path = Some(path);
        }
        if self.no_log {
            cfg.log.path = None;
        }
        if let Some(secs) = self.log_sync_interval {
            cfg.log.sync_interval_secs = secs;
        }
        if let Some(skip) = self.skip_connect_log {
            cfg.log.skip_connect = skip;
        }
        if let Some(secs) = self.dialer_timeout {
            cfg.upstream.dial_timeout_secs = secs;
        }
        if self.disable_keepalive {
            cfg.upstream.disable_keepalive = true;
        }
        if let Some(secs) = self.keepalive_duration {
            cfg.upstream.keepalive_secs = secs;
        }
        if let Some(path) = self.pipeline {
            cfg.pipeline.file = Some(path.to_string_lossy().to_string());
        }
        if let Some(level) = self.log_level {
            cfg.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config_path = args.config.clone();
            let mut cfg = match &config_path {
                Some(path) => Config::from_file(path)?,
                None => Config::parse("")?,
            };
            args.apply(&mut cfg);
            cfg.validate()?;

            // Initialize logging
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            match config_path {
                Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
                None => tracing::info!("Using default configuration"),
            }

            run(cfg).await?;
        }

        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
            organization,
            validity_days,
        } => {
            std::fs::create_dir_all(&out)?;

            let cert_path = out.join(&cert_name);
            let key_path = out.join(&key_name);

            println!("Generating CA certificate...");

            let ca = Authority::generate(
                &organization,
                Duration::from_secs(validity_days.saturating_mul(24 * 60 * 60)),
            )?;
            ca.save(&cert_path, &key_path)?;

            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", key_path.display());
            println!();
            println!("To use with the proxy:");
            println!(
                "  tapline run --ca-cert {} --ca-key {}",
                cert_path.display(),
                key_path.display()
            );
            println!();
            println!("Clients must trust the certificate to accept intercepted HTTPS.");
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!("  API host: {}", cfg.proxy.api_host);
            println!("  Signature: {}", cfg.proxy.signature);
            println!(
                "  CA cert: {}",
                cfg.tls.ca_cert.as_deref().unwrap_or("(generated)")
            );
            println!("  MITM: {}", if cfg.tls.mitm { "enabled" } else { "disabled" });
            println!(
                "  Transaction log: {}",
                cfg.log.path.as_deref().unwrap_or("disabled")
            );
            println!("  Log level: {}", cfg.logging.level);

            if let Some(ref path) = cfg.pipeline.file {
                let body = std::fs::read(path)
                    .map_err(|e| format!("Failed to read pipeline file '{}': {}", path, e))?;
                tapline::modifier::Registry::default().parse(&body)?;
                println!("  Pipeline: {} (parsed successfully)", path);
            }
        }
    }

    Ok(())
}

/// Serve until Ctrl+C or an export failure, then stop the proxy and flush the
/// transaction log one last time.
async fn run(cfg: Config) -> Result<(), Error> {
    let log_path = cfg.log.path.clone();
    let sync_interval = cfg.log.sync_interval();
    let skip_connect = cfg.log.skip_connect;

    let mut server = ProxyServer::new(cfg)?;
    let addr = server.bind().await?;
    tracing::info!(address = %addr, "Proxy server listening");
    tracing::info!("Configure clients with:");
    tracing::info!("  export HTTP_PROXY=http://{}", addr);
    tracing::info!("  export HTTPS_PROXY=http://{}", addr);

    let (export_stop, export_rx) = watch::channel(false);
    let exporter = log_path.map(|path| {
        tracing::info!(path = %path, interval = ?sync_interval, "Transaction log enabled");
        Arc::new(
            Exporter::new(server.recorder().clone(), path, sync_interval)
                .with_skip_connect(skip_connect),
        )
    });
    let mut export_task = exporter
        .clone()
        .map(|exporter| tokio::spawn(exporter.run(export_rx)));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut serve_task = tokio::spawn(server.serve(shutdown_rx));

    let mut failure = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
        result = &mut serve_task => {
            export_stop.send_replace(true);
            if let Some(task) = export_task {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Final transaction log export failed"),
                    Err(e) => tracing::error!(error = %e, "Exporter task failed"),
                }
            }
            return result.map_err(|e| Error::proxy(format!("server task failed: {}", e)))?;
        }
        result = async {
            match export_task.as_mut() {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            export_task = None;
            let err = match result {
                Ok(Err(e)) => e,
                Ok(Ok(())) => Error::export("exporter stopped unexpectedly"),
                Err(e) => Error::export(format!("exporter task failed: {}", e)),
            };
            tracing::error!(error = %err, "Transaction log export failed, shutting down");
            failure = Some(err);
        }
    }

    let _ = shutdown_tx.send(());
    serve_task
        .await
        .map_err(|e| Error::proxy(format!("server task failed: {}", e)))??;

    export_stop.send_replace(true);
    match (export_task, exporter) {
        (Some(task), _) => {
            task.await
                .map_err(|e| Error::export(format!("exporter task failed: {}", e)))??;
        }
        // The exporter already failed; entries recorded while draining
        // connections still get one more attempt.
        (None, Some(exporter)) => match exporter.drain().await {
            Ok(written) => {
                tracing::info!(entries = written, "Wrote remaining transactions after export failure")
            }
            Err(e) => tracing::error!(error = %e, "Final transaction log export failed"),
        },
        (None, None) => {}
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
