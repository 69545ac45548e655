//! Runnable chat gateway, configured from the environment.
//!
//! ```text
//! CHATGATE_SECRET=dev-secret chat-server
//! CHATGATE_SECRET=dev-secret chat-server mint alice web 3600
//! ```
//!
//! | Variable                   | Default          |
//! |----------------------------|------------------|
//! | `CHATGATE_BIND`            | `127.0.0.1:8080` |
//! | `CHATGATE_ENDPOINT`        | `/hubs/chat`     |
//! | `CHATGATE_ISSUER`          | `chatapp`        |
//! | `CHATGATE_AUDIENCE_WEB`    | `web`            |
//! | `CHATGATE_AUDIENCE_MOBILE` | `mobile`         |
//! | `CHATGATE_SECRET`          | required         |

use std::env;
use std::time::Duration;

use chatgate::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_TTL_SECS: u64 = 3600;

/// Logs every routed event instead of storing it.
struct TracingHistory;

impl HistorySink for TracingHistory {
    async fn append(&self, record: HistoryRecord) {
        tracing::debug!(
            event = ?record.event,
            delivered_to = record.delivered_to,
            routed_at = record.routed_at,
            "history"
        );
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn auth_config() -> Result<AuthConfig, Box<dyn std::error::Error>> {
    let secret = env::var("CHATGATE_SECRET")
        .map_err(|_| "CHATGATE_SECRET must be set")?;
    let audiences = AudienceSet {
        web: env_or("CHATGATE_AUDIENCE_WEB", "web"),
        mobile: env_or("CHATGATE_AUDIENCE_MOBILE", "mobile"),
    };
    let config = AuthConfig::new(env_or("CHATGATE_ISSUER", "chatapp"), secret)
        .with_audiences(audiences);
    config.validate()?;
    Ok(config)
}

/// `mint <user-id> <web|mobile> [ttl-secs]`: prints a token to stdout.
fn mint(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [user, audience, rest @ ..] = args else {
        return Err("usage: chat-server mint <user-id> <web|mobile> [ttl-secs]".into());
    };
    let audience: Audience = audience.parse()?;
    let ttl = match rest.first() {
        Some(secs) => Duration::from_secs(secs.parse()?),
        None => Duration::from_secs(DEFAULT_TTL_SECS),
    };

    let issuer = TokenIssuer::new(auth_config()?)?;
    println!("{}", issuer.issue(&UserId::new(user.as_str()), audience, ttl)?);
    Ok(())
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let bind = env_or("CHATGATE_BIND", "127.0.0.1:8080");
    let endpoint = env_or("CHATGATE_ENDPOINT", "/hubs/chat");

    let server = GatewayServer::builder()
        .bind(&bind)
        .endpoint_path(&endpoint)
        .build(auth_config()?, AnonymousDirectory, TracingHistory)
        .await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    tracing::info!(addr = %server.local_addr()?, %endpoint, "chat server ready");
    server.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("mint") => mint(&args[1..]),
        Some(other) => Err(format!("unknown command {other:?}").into()),
        None => serve().await,
    }
}
