//! Push gateway access: credentials and the messaging HTTP client.
//!
//! # Architecture
//!
//! ```text
//! gateway
//! ├── credentials
//! │   └── Service-account assertion -> cached bearer token
//! │
//! └── client
//!     └── Authenticated sends to the messaging endpoint
//! ```
//!
//! The dispatch layer owns the policy (fan-out, endpoint pruning,
//! cache invalidation); this module only knows how to authenticate
//! and how to push one message to one device endpoint.

// Rust guideline compliant 2026-01

pub mod client;
pub mod credentials;

pub use client::{PushGateway, SendError};
pub use credentials::{
    BearerToken, CredentialError, CredentialProvider, JwtGrantExchanger, TokenExchange,
};
