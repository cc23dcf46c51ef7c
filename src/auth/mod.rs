//! Identity and workspace-membership checks.
//!
//! Both are owned by external services; this module only defines the seams
//! and two implementations: an HTTP client for production and a static table
//! for development and tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{UserId, WorkspaceId};

mod clients;
mod tokens;

pub use clients::AuthClient;
pub use tokens::{StaticAuth, TableError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("auth service returned {status}")]
    Status { status: u16 },

    #[error("auth service returned a malformed identity: {0}")]
    Malformed(String),
}

/// Maps a bearer token to a user identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` means the token is unknown or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, AuthError>;
}

/// Answers whether a user belongs to a workspace.
#[async_trait]
pub trait WorkspaceAuthorizer: Send + Sync {
    async fn is_member(&self, user_id: UserId, workspace_id: WorkspaceId) -> Result<bool, AuthError>;
}
