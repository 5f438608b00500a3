//! OAuth 2.1 authorization for remote servers
//!
//! - [`pkce`] generates code verifiers, challenges and state tokens
//! - [`store`] holds pending authorizations, tokens and caches in memory
//! - [`discovery`] locates authorization server endpoints
//! - [`registration`] performs dynamic client registration
//! - [`engine`] drives the grant flows on top of the pieces above

pub mod discovery;
pub mod engine;
pub mod pkce;
pub mod registration;
pub mod store;

pub use engine::{EngineSettings, InitiateOptions, OAuthEngine, OAuthStatus};
pub use store::{AuthStateStore, GrantKind, TokenRecord};
