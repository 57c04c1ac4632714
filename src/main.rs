//! doq - DNS-over-QUIC style query client and server
//!
//! Sends one query per session and prints the answer, or serves answers until
//! interrupted.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use doq_exchange::certgen::{self, CertParams};
use doq_exchange::{ClientConfig, DoqClient, DoqServer, ResponseMode, ServerConfig};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "doq")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "DNS-over-QUIC style query client and server", long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one query and print the response
    Client {
        /// Server host name or address
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(long)]
        port: Option<u16>,

        /// Do not validate the server certificate
        #[arg(short = 'k', long)]
        insecure: bool,

        /// PEM file with trusted CA certificates
        #[arg(long, value_name = "FILE")]
        ca_certs: Option<PathBuf>,

        /// Log TLS secrets to this file
        #[arg(long, value_name = "FILE")]
        secrets_log: Option<PathBuf>,

        /// Name checked against the server certificate
        #[arg(long)]
        server_name: Option<String>,

        /// Give up if no session is established within this time (e.g. "5s")
        #[arg(long, value_parser = humantime::parse_duration)]
        connect_timeout: Option<Duration>,

        /// Query payload
        #[arg(long, default_value = "Hello server")]
        query: String,
    },

    /// Answer queries until interrupted
    Server {
        /// Listen address
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// PEM certificate chain
        #[arg(short = 'c', long, value_name = "FILE")]
        certificate: Option<PathBuf>,

        /// PEM private key
        #[arg(short = 'k', long, value_name = "FILE")]
        private_key: Option<PathBuf>,

        /// Send a retry packet to validate client addresses
        #[arg(long)]
        retry: bool,

        /// Answer every query with the query itself
        #[arg(long, conflicts_with = "response")]
        echo: bool,

        /// Fixed response text
        #[arg(long)]
        response: Option<String>,
    },

    /// Generate a self-signed certificate and key
    Certgen {
        /// Directory for cert.pem and key.pem
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Host names or addresses to certify (repeatable)
        #[arg(long = "host", value_name = "NAME")]
        hosts: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Client {
            host,
            port,
            insecure,
            ca_certs,
            secrets_log,
            server_name,
            connect_timeout,
            query,
        } => {
            let mut config = match &cli.config {
                Some(path) => ClientConfig::from_file(path)
                    .with_context(|| format!("loading client config {}", path.display()))?,
                None => ClientConfig::default(),
            };
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if insecure {
                config.insecure = true;
            }
            if ca_certs.is_some() {
                config.ca_certs = ca_certs;
            }
            if secrets_log.is_some() {
                config.secrets_log = secrets_log;
            }
            if server_name.is_some() {
                config.server_name = server_name;
            }
            if let Some(timeout) = connect_timeout {
                config.connect_timeout = timeout;
            }

            run_client(config, query).await?;
        }
        Commands::Server {
            host,
            port,
            certificate,
            private_key,
            retry,
            echo,
            response,
        } => {
            let mut config = match &cli.config {
                Some(path) => ServerConfig::from_file(path)
                    .with_context(|| format!("loading server config {}", path.display()))?,
                None => ServerConfig::default(),
            };
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(certificate) = certificate {
                config.certificate = certificate;
            }
            if private_key.is_some() {
                config.private_key = private_key;
            }
            if retry {
                config.retry = true;
            }
            if echo {
                config.response = ResponseMode::Echo;
            } else if let Some(text) = response {
                config.response = ResponseMode::Fixed { text };
            }

            run_server(config).await?;
        }
        Commands::Certgen {
            out_dir,
            hosts,
            days,
        } => {
            generate_certificate(out_dir, hosts, days)?;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig, query: String) -> Result<()> {
    let target = format!("{}:{}", config.host, config.port);
    let client = DoqClient::new(config).context("setting up client")?;

    let response = client
        .query_until(query, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .with_context(|| format!("query to {}", target))?;

    println!("{}", String::from_utf8_lossy(&response));
    client.wait_idle().await;
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let policy = config.response.clone();
    let server = DoqServer::bind(&config, policy)
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;

    info!("Press Ctrl-C to stop");
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn generate_certificate(out_dir: PathBuf, hosts: Vec<String>, days: i64) -> Result<()> {
    let mut params = CertParams {
        validity_days: days,
        ..CertParams::default()
    };
    if !hosts.is_empty() {
        params.common_name = hosts[0].clone();
        params.subject_alt_names = hosts;
    }
    if params.validity_days <= 0 {
        bail!("--days must be positive");
    }

    let files = certgen::generate(&params)?
        .write_to(&out_dir)
        .with_context(|| format!("writing to {}", out_dir.display()))?;

    info!("Certificate: {}", files.certificate.display());
    info!("Private key: {}", files.private_key.display());
    Ok(())
}
