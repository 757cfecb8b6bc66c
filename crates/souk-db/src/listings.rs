use crate::{DbError, DbPool};

/// Read-only mirror of a marketplace listing.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ListingRow {
    pub id: i64,
    pub seller_id: i64,
    pub title: String,
    pub price_cents: i64,
    pub first_image: Option<String>,
}

pub async fn get_listing(pool: &DbPool, listing_id: i64) -> Result<Option<ListingRow>, DbError> {
    let row = sqlx::query_as::<_, ListingRow>(
        "SELECT id, seller_id, title, price_cents, first_image FROM listings WHERE id = $1",
    )
    .bind(listing_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Seed or refresh a mirrored listing.
pub async fn upsert_listing(pool: &DbPool, listing: &ListingRow) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO listings (id, seller_id, title, price_cents, first_image)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (id) DO UPDATE SET
             seller_id = excluded.seller_id,
             title = excluded.title,
             price_cents = excluded.price_cents,
             first_image = excluded.first_image",
    )
    .bind(listing.id)
    .bind(listing.seller_id)
    .bind(&listing.title)
    .bind(listing.price_cents)
    .bind(&listing.first_image)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn upsert_then_read_back() {
        let pool = test_pool().await;
        let mut listing = ListingRow {
            id: 7,
            seller_id: 1,
            title: "Road bike".into(),
            price_cents: 45_000,
            first_image: None,
        };
        upsert_listing(&pool, &listing).await.unwrap();
        listing.first_image = Some("https://img.example/bike.jpg".into());
        upsert_listing(&pool, &listing).await.unwrap();

        assert_eq!(get_listing(&pool, 7).await.unwrap(), Some(listing));
        assert!(get_listing(&pool, 8).await.unwrap().is_none());
    }
}
