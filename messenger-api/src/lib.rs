pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
#[cfg(test)]
mod test_support;
pub mod websocket;

pub use auth::{AuthenticatedUser, CredentialValidator, JwtValidator};
pub use error::ApiError;
pub use server::{run, AppState};
