//! User repository used by the verification workflow.
//!
//! The relational store of the platform is outside the worker. The worker
//! reads users and replaces their membership list through this trait; the
//! Redis implementation keeps one JSON document per user and one for the
//! membership list so the list is always written as a single replace.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::{User, UserGroupMembership};
use crate::queue::redis_broker::connect;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("user {0} not found")]
    NotFound(Uuid),

    #[error("user store error: {0}")]
    Storage(String),
}

impl From<redis::RedisError> for RepositoryError {
    fn from(err: redis::RedisError) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Storage(format!("invalid stored document: {}", err))
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Load a user with the full membership list.
    async fn get_by_id(&self, user_id: Uuid) -> Result<User, RepositoryError>;

    /// Replace the user's whole membership list.
    async fn update_user_groups(
        &self,
        user_id: Uuid,
        memberships: &[UserGroupMembership],
    ) -> Result<(), RepositoryError>;
}

/// Redis-backed user store.
#[derive(Clone)]
pub struct RedisUserRepository {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisUserRepository {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, RepositoryError> {
        let conn = connect(url).await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn user_key(&self, user_id: Uuid) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    fn groups_key(&self, user_id: Uuid) -> String {
        format!("{}:user:{}:groups", self.prefix, user_id)
    }
}

#[async_trait]
impl UserRepository for RedisUserRepository {
    async fn get_by_id(&self, user_id: Uuid) -> Result<User, RepositoryError> {
        let mut conn = self.conn.clone();
        let (user, groups): (Option<String>, Option<String>) = redis::pipe()
            .get(self.user_key(user_id))
            .get(self.groups_key(user_id))
            .query_async(&mut conn)
            .await?;

        let user = user.ok_or(RepositoryError::NotFound(user_id))?;
        let mut user: User = serde_json::from_str(&user)?;
        if let Some(groups) = groups {
            user.group_memberships = serde_json::from_str(&groups)?;
        }

        Ok(user)
    }

    async fn update_user_groups(
        &self,
        user_id: Uuid,
        memberships: &[UserGroupMembership],
    ) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(memberships)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.groups_key(user_id), body).await?;

        info!(
            user_id = %user_id,
            memberships = memberships.len(),
            "user_groups_updated"
        );

        Ok(())
    }
}
