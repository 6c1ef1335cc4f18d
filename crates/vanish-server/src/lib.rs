pub mod accounts;
pub mod auth;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod server;
pub mod store;
pub mod vault;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub tokens: auth::TokenIssuer,
}

pub use error::VanishError;
pub use server::{load_cipher, read_key_file, resolve_data_dir, router, run, KeyMode, ServerConfig};
