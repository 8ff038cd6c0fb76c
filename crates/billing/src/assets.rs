//! Asset store client
//!
//! The scheduler only needs `delete`. Deleting an object that is already
//! gone counts as success so a retried sweep converges.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::purchases::MediaAsset;

#[derive(Debug, Error)]
pub enum AssetStoreError {
    #[error("asset already deleted")]
    AlreadyGone,

    #[error("asset deletion failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn delete(&self, media: &MediaAsset) -> Result<(), AssetStoreError>;
}

/// Deletes objects with `DELETE {base_url}/objects/{storage_key}`
#[derive(Clone)]
pub struct HttpAssetStore {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
}

impl HttpAssetStore {
    pub fn new(base_url: Option<String>, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            token,
        }
    }

    /// `ASSET_API_URL` and optional `ASSET_API_TOKEN`
    pub fn from_env() -> Self {
        let base_url = std::env::var("ASSET_API_URL").ok().filter(|u| !u.is_empty());
        let token = std::env::var("ASSET_API_TOKEN").ok().filter(|t| !t.is_empty());
        if base_url.is_none() {
            tracing::warn!("ASSET_API_URL not set; expired assets will not be deleted");
        }
        Self::new(base_url, token)
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    fn object_url(base_url: &str, storage_key: &str) -> String {
        let key = storage_key.trim_start_matches('/');
        format!("{}/objects/{}", base_url, key)
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn delete(&self, media: &MediaAsset) -> Result<(), AssetStoreError> {
        // Unconfigured deletions fail so the purchase stays due and is
        // retried once the endpoint is set.
        let Some(base_url) = &self.base_url else {
            return Err(AssetStoreError::Failed(
                "asset store endpoint not configured".to_string(),
            ));
        };

        let mut request = self
            .client
            .delete(Self::object_url(base_url, &media.storage_key));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AssetStoreError::Failed(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(AssetStoreError::AlreadyGone),
            status => Err(AssetStoreError::Failed(format!(
                "asset store returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[test]
    fn test_object_url_joins_cleanly() {
        assert_eq!(
            HttpAssetStore::object_url("https://assets.example.com", "/media/a.jpg"),
            "https://assets.example.com/objects/media/a.jpg"
        );
        let store = HttpAssetStore::new(Some("https://assets.example.com/".into()), None);
        assert_eq!(store.base_url.as_deref(), Some("https://assets.example.com"));
    }

    #[tokio::test]
    async fn test_unconfigured_store_fails_deletion() {
        let store = HttpAssetStore::new(None, None);
        assert!(!store.is_enabled());
        let media = MediaAsset {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: "Harbor".into(),
            storage_key: "media/harbor.jpg".into(),
            price_cents: 100,
            is_sold: true,
            published_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        assert!(matches!(
            store.delete(&media).await,
            Err(AssetStoreError::Failed(_))
        ));
    }
}
