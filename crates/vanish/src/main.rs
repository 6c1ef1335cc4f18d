use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use vanish_server::{
    accounts::User,
    auth::TokenPair,
    handlers::{CreateSecretResponse, SecretContent},
    store::{Page, SecretMeta},
    KeyMode,
};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vanish", about = "Vanish: one-time secret sharing", version)]
struct Cli {
    /// Server URL (default: http://localhost:8080 or $VANISH_SERVER)
    #[arg(long, env = "VANISH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Access token from `vanish login` ($VANISH_TOKEN)
    #[arg(long, env = "VANISH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: $VANISH_PORT or 8080)
        #[arg(long, env = "VANISH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $VANISH_HOST or 0.0.0.0)
        #[arg(long, env = "VANISH_HOST", default_value = "0.0.0.0")]
        host: String,
        /// ephemeral, persistent or master
        #[arg(long, env = "VANISH_KEY_MODE", default_value = "ephemeral")]
        key_mode: KeyMode,
    },
    /// Create an account
    Register {
        email: String,
        #[arg(long, env = "VANISH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Log in and print an access token
    Login {
        email: String,
        #[arg(long, env = "VANISH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Store a secret and print its one-time token
    Push {
        content: String,
        /// 5m, 1h, 12h, 1d, 7d or 14d
        #[arg(long, default_value = "1h")]
        lifetime: String,
        /// Use this passphrase instead of a random one
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Retrieve (and destroy) a secret
    Get { passphrase: String },
    /// List your pending secrets (metadata only)
    List {
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        size: Option<usize>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VANISH_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let client = Client::new();
    let server = cli.server.trim_end_matches('/');

    match cli.command {
        Commands::Serve {
            port,
            host,
            key_mode,
        } => cmd_serve(host, port, key_mode).await,

        Commands::Register { email, password } => {
            let password = require_password(password)?;
            let user = register(&client, server, &email, &password).await?;
            println!("✓ registered {} (id {})", user.email, user.id);
            Ok(())
        }

        Commands::Login { email, password } => {
            let password = require_password(password)?;
            let pair = login(&client, server, &email, &password).await?;
            println!("{}", pair.access_token);
            Ok(())
        }

        Commands::Push {
            content,
            lifetime,
            passphrase,
        } => {
            let token = require_token(&cli.token)?;
            let created = push(
                &client,
                server,
                &token,
                &content,
                &lifetime,
                passphrase.as_deref(),
            )
            .await?;
            println!("{}", created.passphrase);
            Ok(())
        }

        Commands::Get { passphrase } => {
            let token = require_token(&cli.token)?;
            println!("{}", fetch_secret(&client, server, &token, &passphrase).await?);
            Ok(())
        }

        Commands::List { page, size } => {
            let token = require_token(&cli.token)?;
            let listing = fetch_list(&client, server, &token, page, size).await?;
            print_list(&listing);
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, key_mode: KeyMode) -> Result<()> {
    let cfg = vanish_server::ServerConfig {
        host,
        port,
        key_mode,
        ..Default::default()
    };
    vanish_server::run(cfg).await
}

async fn register(client: &Client, server: &str, email: &str, password: &str) -> Result<User> {
    let resp = client
        .post(format!("{server}/users"))
        .json(&json!({ "email": email, "password": password }))
        .send()
        .await
        .context("HTTP request failed")?;
    parse(resp).await
}

async fn login(client: &Client, server: &str, email: &str, password: &str) -> Result<TokenPair> {
    let resp = client
        .post(format!("{server}/auth/login"))
        .json(&json!({ "email": email, "password": password }))
        .send()
        .await
        .context("HTTP request failed")?;
    parse(resp).await
}

async fn push(
    client: &Client,
    server: &str,
    token: &str,
    content: &str,
    lifetime: &str,
    passphrase: Option<&str>,
) -> Result<CreateSecretResponse> {
    let resp = client
        .post(format!("{server}/secrets"))
        .bearer_auth(token)
        .json(&json!({
            "content": content,
            "lifetime": lifetime,
            "passphrase": passphrase,
        }))
        .send()
        .await
        .context("HTTP request failed")?;
    parse(resp).await
}

async fn fetch_secret(client: &Client, server: &str, token: &str, secret: &str) -> Result<String> {
    let resp = client
        .get(format!("{server}/secrets/{secret}"))
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;
    let body: SecretContent = parse(resp).await?;
    Ok(body.content)
}

async fn fetch_list(
    client: &Client,
    server: &str,
    token: &str,
    page: Option<usize>,
    size: Option<usize>,
) -> Result<Page<SecretMeta>> {
    let mut query = Vec::new();
    if let Some(p) = page {
        query.push(("page", p));
    }
    if let Some(s) = size {
        query.push(("size", s));
    }
    let resp = client
        .get(format!("{server}/secrets"))
        .bearer_auth(token)
        .query(&query)
        .send()
        .await
        .context("HTTP request failed")?;
    parse(resp).await
}

fn print_list(listing: &Page<SecretMeta>) {
    if listing.items.is_empty() {
        println!("(no pending secrets)");
        return;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    for m in &listing.items {
        println!("  #{} {} {}", m.id, m.lifetime, expiry_label(m.expires_at, now));
    }
    println!("page {}/{} ({} total)", listing.page, listing.pages.max(1), listing.total);
}

fn expiry_label(expires_at: i64, now: i64) -> String {
    let left = expires_at - now;
    if left > 0 {
        format!(
            "expires in {}",
            humantime::format_duration(Duration::from_secs(left as u64))
        )
    } else {
        "expired, awaiting sweep".to_string()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Decode a success body, or turn the server's `{"error": ..}` into an error.
async fn parse<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("parse response");
    }
    let body: Value = resp.json().await.unwrap_or_default();
    match body["error"].as_str() {
        Some(error) => anyhow::bail!("{error} ({status})"),
        None => anyhow::bail!("server returned {status}"),
    }
}

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--token / VANISH_TOKEN is required for this command (see `vanish login`)")
}

fn require_password(password: Option<String>) -> Result<String> {
    password.context("--password / VANISH_PASSWORD is required for this command")
}
