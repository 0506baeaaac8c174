//! Lobber CLI
//!
//! `lobber relay` runs the public relay; `lobber http` exposes a local HTTP
//! server through a relay with automatic reconnection; `lobber token`
//! generates an API token.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lobber_auth::StaticTokenValidator;
use lobber_client::{ClientConfig, TunnelClient};
use lobber_relay::{RelayConfig, RelayServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Lobber - expose local HTTP servers through a public relay
#[derive(Parser, Debug)]
#[command(name = "lobber")]
#[command(about = "Expose local HTTP servers through a public relay")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay server
    Relay {
        /// Address to listen on
        #[arg(long, env = "LOBBER_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,

        /// The relay's own domain; requests for it are not treated as
        /// tunnel hosts
        #[arg(long, env = "LOBBER_BASE_DOMAIN")]
        base_domain: Option<String>,

        /// Max requests queued per tunnel before it becomes ready
        #[arg(long, env = "LOBBER_MAX_PENDING_QUEUE", default_value_t = 100)]
        max_pending_queue: usize,

        /// Seconds a request may wait in the pre-ready queue
        #[arg(long, env = "LOBBER_PENDING_QUEUE_TTL", default_value_t = 5)]
        pending_queue_ttl: u64,

        /// Accepted tokens as comma-separated user:token pairs. When unset
        /// the relay accepts any non-empty token (development mode).
        #[arg(long, env = "LOBBER_AUTH_TOKENS")]
        auth_tokens: Option<String>,
    },

    /// Expose a local HTTP server through a relay
    Http {
        /// Base URL of the local server to expose
        #[arg(long, env = "LOBBER_LOCAL", default_value = "http://127.0.0.1:3000")]
        local: String,

        /// Relay address (host:port)
        #[arg(long, env = "LOBBER_RELAY")]
        relay: String,

        /// Authentication token
        #[arg(long, env = "LOBBER_TOKEN")]
        token: String,

        /// Hostname to register with the relay
        #[arg(long, env = "LOBBER_DOMAIN")]
        domain: String,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value_t = 0)]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value_t = 1)]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value_t = 60)]
        max_reconnect_delay: u64,
    },

    /// Generate an API token and the hash to store for it
    Token,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn run_relay(
    listen: String,
    base_domain: Option<String>,
    max_pending_queue: usize,
    pending_queue_ttl: u64,
    auth_tokens: Option<String>,
) -> Result<()> {
    let config = RelayConfig {
        max_pending_queue,
        pending_queue_ttl: Duration::from_secs(pending_queue_ttl),
        base_domain,
    };

    let mut server = RelayServer::new(config);
    match auth_tokens {
        Some(pairs) => {
            let validator = parse_auth_tokens(&pairs)?;
            server = server.with_validator(Arc::new(validator));
        }
        None => {
            warn!("no auth tokens configured, accepting any non-empty token (development mode)");
        }
    }

    let listener = RelayServer::bind(&listen).await?;
    let server = Arc::new(server);

    tokio::select! {
        result = server.run(listener) => {
            result.context("relay server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }
    Ok(())
}

/// Parse `user:token,user2:token2` into a validator.
fn parse_auth_tokens(pairs: &str) -> Result<StaticTokenValidator> {
    let mut validator = StaticTokenValidator::new();
    for pair in pairs.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (user, token) = pair
            .split_once(':')
            .with_context(|| format!("invalid auth token entry {pair:?}, expected user:token"))?;
        validator.insert(token, user);
    }
    Ok(validator)
}

async fn run_http_tunnel(
    config: ClientConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let client = TunnelClient::new(config.clone()).context("failed to create tunnel client")?;

    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;
        info!(
            "connection attempt {} (max: {})",
            attempt,
            if max_attempts == 0 {
                "unlimited".to_string()
            } else {
                max_attempts.to_string()
            }
        );

        match client.run().await {
            Ok(()) => {
                info!("tunnel stopped normally");
                return Ok(());
            }
            Err(e) => {
                error!("tunnel error: {e:#}");

                if max_attempts > 0 && attempt >= max_attempts {
                    anyhow::bail!("failed after {attempt} attempts: {e}");
                }

                warn!(
                    "reconnecting in {} seconds",
                    current_delay.as_secs()
                );
                tokio::time::sleep(current_delay).await;
                current_delay = std::cmp::min(current_delay * 2, max_delay);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay {
            listen,
            base_domain,
            max_pending_queue,
            pending_queue_ttl,
            auth_tokens,
        } => {
            run_relay(
                listen,
                base_domain,
                max_pending_queue,
                pending_queue_ttl,
                auth_tokens,
            )
            .await
        }

        Commands::Http {
            local,
            relay,
            token,
            domain,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            let config = ClientConfig {
                local_url: local.clone(),
                relay_addr: relay.clone(),
                token,
                domain: domain.clone(),
            };
            info!("exposing {local} as {domain} via {relay}");

            let tunnel = tokio::spawn(run_http_tunnel(
                config,
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            ));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    Ok(())
                }
                result = tunnel => result.context("tunnel task panicked")?,
            }
        }

        Commands::Token => {
            let (plaintext, hash) =
                lobber_auth::generate_api_token().context("token generation failed")?;
            println!("token: {plaintext}");
            println!("hash:  {hash}");
            println!("Store the hash; the token itself is shown only once.");
            Ok(())
        }
    }
}
