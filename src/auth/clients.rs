use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{UserId, WorkspaceId};

use super::{AuthError, Authenticator, WorkspaceAuthorizer};

#[derive(Deserialize)]
struct UserInfo {
    id: String,
}

/// Client for the external auth service.
///
/// `GET {base}/userinfo` with the bearer token resolves an identity;
/// `GET {base}/workspaces/{workspace}/members/{user}` answers membership
/// with 200 (member) or 403/404 (not a member).
#[derive(Clone)]
pub struct AuthClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http_client,
        })
    }
}

#[async_trait]
impl Authenticator for AuthClient {
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, AuthError> {
        let response = self
            .http_client
            .get(format!("{}/userinfo", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                return Err(AuthError::Status { status: status.as_u16() });
            }
            _ => {}
        }

        let UserInfo { id } = response.json().await?;
        Uuid::parse_str(&id)
            .map(Some)
            .map_err(|_| AuthError::Malformed(id))
    }
}

#[async_trait]
impl WorkspaceAuthorizer for AuthClient {
    async fn is_member(&self, user_id: UserId, workspace_id: WorkspaceId) -> Result<bool, AuthError> {
        let status = self
            .http_client
            .get(format!(
                "{}/workspaces/{workspace_id}/members/{user_id}",
                self.base_url
            ))
            .send()
            .await?
            .status();

        match status {
            s if s.is_success() => Ok(true),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            s => Err(AuthError::Status { status: s.as_u16() }),
        }
    }
}
