//! OAuth session shared by every request to one remote system.
//!
//! The token pair lives in a [`TokenStore`] (a JSON file by default) so that
//! a refreshed token survives the process. [`Session::refresh`] exchanges the
//! refresh token at the token endpoint and persists the result; concurrent
//! callers that saw the same stale token trigger a single refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::OAuthConfig;
use crate::remote::RemoteError;

/// Token pair as returned by the token endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Provider-specific extras (endpoints, member ids) kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Where the token pair is persisted between runs.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<OAuthToken>;
    async fn save(&self, token: &OAuthToken) -> Result<()>;
}

/// A token pair stored as a JSON file.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<OAuthToken> {
        let content = tokio::fs::read_to_string(&self.path).await.with_context(|| {
            format!(
                "Failed to read token file {} (complete the OAuth authorization once and save the token response there)",
                self.path.display()
            )
        })?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid token file: {}", self.path.display()))
    }

    async fn save(&self, token: &OAuthToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(token)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write token file: {}", self.path.display()))
    }
}

/// Authenticated session against one remote system.
pub struct Session {
    name: String,
    oauth: OAuthConfig,
    http: reqwest::Client,
    store: Box<dyn TokenStore>,
    token: RwLock<Arc<OAuthToken>>,
    refreshing: Mutex<()>,
}

impl Session {
    /// Open a session with the token currently held by `store`.
    pub async fn open(
        name: impl Into<String>,
        oauth: OAuthConfig,
        http: reqwest::Client,
        store: Box<dyn TokenStore>,
    ) -> Result<Self> {
        let name = name.into();
        let token = store
            .load()
            .await
            .with_context(|| format!("Failed to load {} token", name))?;
        Ok(Self {
            name,
            oauth,
            http,
            store,
            token: RwLock::new(Arc::new(token)),
            refreshing: Mutex::new(()),
        })
    }

    /// Open a session backed by the configured token file.
    pub async fn from_config(name: &str, oauth: &OAuthConfig, http: reqwest::Client) -> Result<Self> {
        let store = FileTokenStore::new(oauth.token_file.clone());
        Self::open(name, oauth.clone(), http, Box::new(store)).await
    }

    pub async fn access_token(&self) -> String {
        self.token.read().await.access_token.clone()
    }

    /// Exchange the refresh token for a new token pair and persist it.
    ///
    /// `stale` is the access token the caller was rejected with. If another
    /// task already replaced it, no second refresh is made.
    pub async fn refresh(&self, stale: &str) -> Result<(), RemoteError> {
        let _guard = self.refreshing.lock().await;

        let current = self.token.read().await.clone();
        if current.access_token != stale {
            debug!(session = %self.name, "token already refreshed by another request");
            return Ok(());
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| RemoteError::Refresh(format!("{}: no refresh token stored", self.name)))?;
        let scope = current.scope.clone().unwrap_or_default();
        let params = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", scope.as_str()),
            ("redirect_uri", self.oauth.redirect_uri.as_str()),
        ];

        let response = self
            .http
            .post(&self.oauth.token_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| RemoteError::Refresh(format!("{}: token request failed: {}", self.name, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Refresh(format!(
                "{}: token endpoint returned {}: {}",
                self.name, status, body
            )));
        }

        let mut token: OAuthToken = response
            .json()
            .await
            .map_err(|e| RemoteError::Refresh(format!("{}: invalid token response: {}", self.name, e)))?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token);
        }

        self.store
            .save(&token)
            .await
            .map_err(|e| RemoteError::Refresh(format!("{}: {:#}", self.name, e)))?;
        *self.token.write().await = Arc::new(token);
        info!(session = %self.name, "access token refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let token: OAuthToken = serde_json::from_str(
            r#"{"access_token":"secret-a","refresh_token":"secret-r","expires_in":3600,"member_id":"m1"}"#,
        )
        .unwrap();
        let shown = format!("{:?}", token);
        assert!(!shown.contains("secret-a"));
        assert!(!shown.contains("secret-r"));
        assert_eq!(token.extra.get("member_id").and_then(|v| v.as_str()), Some("m1"));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested").join("token.json"));
        assert!(store.load().await.is_err());

        let token: OAuthToken =
            serde_json::from_str(r#"{"access_token":"a1","refresh_token":"r1"}"#).unwrap();
        store.save(&token).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.access_token, "a1");
        assert_eq!(loaded.refresh_token.as_deref(), Some("r1"));
    }
}
