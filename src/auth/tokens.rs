use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{UserId, WorkspaceId};

use super::{AuthError, Authenticator, WorkspaceAuthorizer};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("expected {expected} in {entry:?}")]
    Malformed { entry: String, expected: &'static str },

    #[error("bad {field} id in {entry:?}: {source}")]
    BadId {
        entry: String,
        field: &'static str,
        source: uuid::Error,
    },
}

fn parse_id(entry: &str, field: &'static str, raw: &str) -> Result<Uuid, TableError> {
    Uuid::parse_str(raw.trim()).map_err(|source| TableError::BadId {
        entry: entry.to_owned(),
        field,
        source,
    })
}

fn split<'a>(entry: &'a str, sep: char, expected: &'static str) -> Result<(&'a str, &'a str), TableError> {
    entry.split_once(sep).ok_or_else(|| TableError::Malformed {
        entry: entry.to_owned(),
        expected,
    })
}

/// Fixed token and membership tables.
///
/// With no membership table every authenticated user is treated as a member
/// of every workspace.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    tokens: HashMap<String, UserId>,
    members: Option<HashSet<(UserId, WorkspaceId)>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    pub fn with_member(mut self, user_id: UserId, workspace_id: WorkspaceId) -> Self {
        self.members
            .get_or_insert_with(HashSet::new)
            .insert((user_id, workspace_id));
        self
    }

    pub fn allows_everyone(&self) -> bool {
        self.members.is_none()
    }

    /// Parses `token=user_uuid,token2=user_uuid2`.
    pub fn parse_tokens(mut self, raw: &str) -> Result<Self, TableError> {
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, user) = split(entry, '=', "token=user")?;
            let user = parse_id(entry, "user", user)?;
            self.tokens.insert(token.trim().to_owned(), user);
        }
        Ok(self)
    }

    /// Parses `user_uuid@workspace_uuid,...`.
    pub fn parse_members(mut self, raw: &str) -> Result<Self, TableError> {
        let members = self.members.get_or_insert_with(HashSet::new);
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (user, workspace) = split(entry, '@', "user@workspace")?;
            members.insert((parse_id(entry, "user", user)?, parse_id(entry, "workspace", workspace)?));
        }
        Ok(self)
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self, token: &str) -> Result<Option<UserId>, AuthError> {
        Ok(self.tokens.get(token).copied())
    }
}

#[async_trait]
impl WorkspaceAuthorizer for StaticAuth {
    async fn is_member(&self, user_id: UserId, workspace_id: WorkspaceId) -> Result<bool, AuthError> {
        Ok(match &self.members {
            Some(members) => members.contains(&(user_id, workspace_id)),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_token_and_member_tables() {
        let (alice, ws) = (Uuid::now_v7(), Uuid::now_v7());
        let auth = StaticAuth::new()
            .parse_tokens(&format!("abc={alice}, ,"))
            .unwrap()
            .parse_members(&format!("{alice}@{ws}"))
            .unwrap();

        assert_eq!(auth.authenticate("abc").await.unwrap(), Some(alice));
        assert_eq!(auth.authenticate("nope").await.unwrap(), None);
        assert!(auth.is_member(alice, ws).await.unwrap());
        assert!(!auth.is_member(alice, Uuid::now_v7()).await.unwrap());
        assert!(!auth.allows_everyone());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            StaticAuth::new().parse_tokens("abc"),
            Err(TableError::Malformed { expected: "token=user", .. })
        ));
        assert!(matches!(
            StaticAuth::new().parse_tokens("abc=not-a-uuid"),
            Err(TableError::BadId { field: "user", .. })
        ));
        assert!(matches!(
            StaticAuth::new().parse_members(&format!("{}@y", Uuid::now_v7())),
            Err(TableError::BadId { field: "workspace", .. })
        ));

        let err = StaticAuth::new().parse_members("nobody").unwrap_err();
        assert_eq!(err.to_string(), r#"expected user@workspace in "nobody""#);
    }
}
