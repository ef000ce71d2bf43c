//! Gateway server: middleware wiring, cookies, and the process shell.

pub mod auth;
pub mod cookies;
mod router;
mod server;

pub use auth::{AppState, AppStateInner};
pub use router::create_router;
pub use server::Gateway;
