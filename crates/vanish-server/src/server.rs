use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{load_or_generate_jwt_secret, require_auth, TokenIssuer},
    handlers::{
        create_secret, delete_user, get_secret, get_user, health, list_secrets, list_users, login,
        refresh, register, update_user,
    },
    store::{crypto, Cipher, Store},
    AppState,
};

/// Where the cipher key comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyMode {
    /// Fresh random key per process. Secrets do not survive a restart.
    #[default]
    Ephemeral,
    /// Random key generated once and kept in `vanish.key`.
    Persistent,
    /// Argon2id over `VANISH_MASTER_KEY` with a salt kept in `vanish.salt`.
    Master,
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(Self::Ephemeral),
            "persistent" => Ok(Self::Persistent),
            "master" => Ok(Self::Master),
            other => Err(format!(
                "unknown key mode {other:?} (expected ephemeral, persistent or master)"
            )),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub key_mode: KeyMode,
    /// Overrides the generated `jwt_secret` file ($VANISH_JWT_SECRET).
    pub jwt_secret: Option<String>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        let key_mode = match std::env::var("VANISH_KEY_MODE") {
            Ok(v) => v.parse().unwrap_or_else(|e: String| {
                warn!(error = %e, "ignoring VANISH_KEY_MODE");
                KeyMode::default()
            }),
            Err(_) => KeyMode::default(),
        };
        Self {
            host: std::env::var("VANISH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("VANISH_PORT").unwrap_or(8080),
            data_dir: std::env::var("VANISH_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(
                env_parse("VANISH_SWEEP_INTERVAL_SECS").unwrap_or(60),
            ),
            cors_origins: std::env::var("VANISH_CORS_ORIGINS").ok(),
            key_mode,
            jwt_secret: std::env::var("VANISH_JWT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            access_token_ttl: Duration::from_secs(
                60 * env_parse::<u64>("VANISH_ACCESS_TOKEN_MINUTES").unwrap_or(15),
            ),
            refresh_token_ttl: Duration::from_secs(
                60 * env_parse::<u64>("VANISH_REFRESH_TOKEN_MINUTES").unwrap_or(7 * 24 * 60),
            ),
        }
    }
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master key from `VANISH_MASTER_KEY_FILE` (preferred) or `VANISH_MASTER_KEY`.
pub fn resolve_master_key() -> Result<String> {
    if let Ok(path) = std::env::var("VANISH_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("VANISH_MASTER_KEY").is_ok() {
            warn!("both VANISH_MASTER_KEY and VANISH_MASTER_KEY_FILE are set; using file");
        }
        return Ok(key);
    }
    let key = std::env::var("VANISH_MASTER_KEY")
        .context("VANISH_MASTER_KEY or VANISH_MASTER_KEY_FILE is required in master key mode")?;
    if key.is_empty() {
        anyhow::bail!("VANISH_MASTER_KEY must not be empty");
    }
    Ok(key)
}

pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

fn load_or_create_key(data_dir: &Path) -> Result<crypto::EncryptionKey> {
    let key_path = data_dir.join("vanish.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read vanish.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "vanish.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write vanish.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join("vanish.salt");
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read vanish.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "vanish.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        std::fs::write(&salt_path, salt).context("write vanish.salt")?;
        info!("generated new key derivation salt");
        Ok(salt)
    }
}

/// Build the process cipher for the configured key mode.
pub fn load_cipher(mode: KeyMode, data_dir: &Path) -> Result<Cipher> {
    let key = match mode {
        KeyMode::Ephemeral => {
            warn!("ephemeral encryption key: secrets will not survive a restart");
            crypto::generate_key()
        }
        KeyMode::Persistent => load_or_create_key(data_dir)?,
        KeyMode::Master => {
            let master = resolve_master_key()?;
            let salt = load_or_create_salt(data_dir)?;
            crypto::derive_key(&master, &salt)?
        }
    };
    Ok(Cipher::new(key))
}

pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/users", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh));

    let protected = Router::new()
        .route("/users", get(list_users))
        .route(
            "/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/secrets", get(list_secrets).post(create_secret))
        .route("/secrets/{token}", get(get_secret))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), key_mode = ?cfg.key_mode, "using data directory");

    let cipher = load_cipher(cfg.key_mode, &data_dir)?;
    let store = Store::open(&data_dir.join("vanish.db"), cipher).context("open store")?;

    let jwt_secret = match cfg.jwt_secret {
        Some(s) => s.into_bytes(),
        None => load_or_generate_jwt_secret(&data_dir)?,
    };
    let tokens = TokenIssuer::new(&jwt_secret, cfg.access_token_ttl, cfg.refresh_token_ttl);

    store.clone().spawn_sweep(cfg.sweep_interval);
    info!(interval = ?cfg.sweep_interval, "expiry sweeper started");

    let app = router(AppState { store, tokens }, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "vanish server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<HeaderValue> =
                o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
