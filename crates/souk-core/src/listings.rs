use serde::Deserialize;
use souk_db::DbPool;
use souk_models::conversation::ListingPreview;
use std::time::Duration;

use crate::CoreError;

/// Where listing details come from. The marketplace owns listings; this
/// service only reads them.
#[derive(Clone)]
pub enum ListingProvider {
    /// The marketplace `listings` table, mirrored in the same database.
    Database(DbPool),
    /// The marketplace HTTP API.
    Remote(RemoteListings),
}

impl ListingProvider {
    /// `Ok(None)` when the listing does not exist.
    pub async fn resolve(&self, listing_id: i64) -> Result<Option<ListingPreview>, CoreError> {
        match self {
            ListingProvider::Database(pool) => {
                let row = souk_db::listings::get_listing(pool, listing_id).await?;
                Ok(row.map(|row| ListingPreview {
                    listing_id: row.id,
                    seller_id: row.seller_id,
                    title: row.title,
                    price_cents: row.price_cents,
                    first_image: row.first_image,
                }))
            }
            ListingProvider::Remote(remote) => remote.resolve(listing_id).await,
        }
    }
}

#[derive(Deserialize)]
struct RemoteListing {
    #[serde(with = "souk_models::ids")]
    seller_id: i64,
    title: String,
    price_cents: i64,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Clone)]
pub struct RemoteListings {
    client: reqwest::Client,
    base_url: String,
    cache: moka::future::Cache<i64, ListingPreview>,
}

impl RemoteListings {
    pub fn new(base_url: &str, cache_ttl: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CoreError::Internal(format!("listing client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(cache_ttl)
                .build(),
        })
    }

    async fn resolve(&self, listing_id: i64) -> Result<Option<ListingPreview>, CoreError> {
        if let Some(hit) = self.cache.get(&listing_id).await {
            return Ok(Some(hit));
        }

        let url = format!("{}/listings/{}", self.base_url, listing_id);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            tracing::error!(listing_id, "listing lookup failed: {e}");
            CoreError::Internal("listing service unavailable".into())
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            tracing::error!(listing_id, status = %resp.status(), "listing lookup rejected");
            return Err(CoreError::Internal("listing service unavailable".into()));
        }

        let body: RemoteListing = resp.json().await.map_err(|e| {
            tracing::error!(listing_id, "listing response malformed: {e}");
            CoreError::Internal("listing service unavailable".into())
        })?;
        let preview = ListingPreview {
            listing_id,
            seller_id: body.seller_id,
            title: body.title,
            price_cents: body.price_cents,
            first_image: body.images.into_iter().next(),
        };
        self.cache.insert(listing_id, preview.clone()).await;
        Ok(Some(preview))
    }
}
