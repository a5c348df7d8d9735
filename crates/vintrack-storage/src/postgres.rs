//! Postgres implementation of the persistence facade.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;
use vintrack_core::{CanonicalListing, CatalogOption, ListingQuery};

use crate::{ListingStore, StoreError};

const LISTING_COLUMNS: &str = "id, source_id, source_url, vin, model_year, model, trim_level, \
     generation, price, mileage, exterior_color, interior_color, location, title, options_text, \
     sold_date, scraped_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Upserts catalog entries by id. Returns the number of rows written.
    pub async fn seed_option_catalog(&self, entries: &[CatalogOption]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for entry in entries {
            let result = sqlx::query(
                "INSERT INTO option_catalog (id, name, category) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, category = EXCLUDED.category",
            )
            .bind(entry.id)
            .bind(&entry.name)
            .bind(&entry.category)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Current option catalog, ordered by id.
    pub async fn load_option_catalog(&self) -> Result<Vec<CatalogOption>, StoreError> {
        let rows = sqlx::query("SELECT id, name, category FROM option_catalog ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CatalogOption {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    category: row.try_get("category")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

fn row_to_listing(row: &PgRow) -> Result<CanonicalListing, sqlx::Error> {
    Ok(CanonicalListing {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        source_url: row.try_get("source_url")?,
        vin: row.try_get("vin")?,
        year: row.try_get("model_year")?,
        model: row.try_get("model")?,
        trim: row.try_get("trim_level")?,
        generation: row.try_get("generation")?,
        price: row.try_get("price")?,
        mileage: row.try_get("mileage")?,
        exterior_color: row.try_get("exterior_color")?,
        interior_color: row.try_get("interior_color")?,
        location: row.try_get("location")?,
        title: row.try_get("title")?,
        options_text: row.try_get("options_text")?,
        sold_date: row.try_get("sold_date")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn bind_listing<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    listing: &'q CanonicalListing,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&listing.source_id)
        .bind(&listing.source_url)
        .bind(&listing.vin)
        .bind(listing.year)
        .bind(&listing.model)
        .bind(&listing.trim)
        .bind(&listing.generation)
        .bind(listing.price)
        .bind(listing.mileage)
        .bind(&listing.exterior_color)
        .bind(&listing.interior_color)
        .bind(&listing.location)
        .bind(&listing.title)
        .bind(&listing.options_text)
        .bind(listing.sold_date)
        .bind(listing.scraped_at)
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<CanonicalListing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM canonical_listings WHERE source_url = $1");
        let row = sqlx::query(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_listing).transpose()?)
    }

    async fn find_by_vin(&self, vin: &str) -> Result<Option<CanonicalListing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM canonical_listings WHERE vin = $1");
        let row = sqlx::query(&sql)
            .bind(vin)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_listing).transpose()?)
    }

    async fn upsert_by_url(
        &self,
        listing: &CanonicalListing,
    ) -> Result<CanonicalListing, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO canonical_listings (
                id, source_id, source_url, vin, model_year, model, trim_level, generation,
                price, mileage, exterior_color, interior_color, location, title,
                options_text, sold_date, scraped_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (source_url) DO UPDATE SET
                source_id = EXCLUDED.source_id,
                vin = EXCLUDED.vin,
                model_year = EXCLUDED.model_year,
                model = EXCLUDED.model,
                trim_level = EXCLUDED.trim_level,
                generation = EXCLUDED.generation,
                price = EXCLUDED.price,
                mileage = EXCLUDED.mileage,
                exterior_color = EXCLUDED.exterior_color,
                interior_color = EXCLUDED.interior_color,
                location = EXCLUDED.location,
                title = EXCLUDED.title,
                options_text = EXCLUDED.options_text,
                sold_date = EXCLUDED.sold_date,
                scraped_at = EXCLUDED.scraped_at
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let row = bind_listing(sqlx::query(&sql).bind(listing.id), listing)
            .fetch_one(&self.pool)
            .await?;
        Ok(row_to_listing(&row)?)
    }

    async fn update_by_id(
        &self,
        id: Uuid,
        listing: &CanonicalListing,
    ) -> Result<CanonicalListing, StoreError> {
        let sql = format!(
            r#"
            UPDATE canonical_listings SET
                source_id = $2, source_url = $3, vin = $4, model_year = $5, model = $6,
                trim_level = $7, generation = $8, price = $9, mileage = $10,
                exterior_color = $11, interior_color = $12, location = $13, title = $14,
                options_text = $15, sold_date = $16, scraped_at = $17
            WHERE id = $1
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let row = bind_listing(sqlx::query(&sql).bind(id), listing)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row_to_listing(&row)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM canonical_listings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn replace_option_associations(
        &self,
        listing_id: Uuid,
        option_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM canonical_listings WHERE id = $1 FOR UPDATE")
            .bind(listing_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(listing_id));
        }

        sqlx::query("DELETE FROM listing_options WHERE listing_id = $1")
            .bind(listing_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO listing_options (listing_id, option_id) \
             SELECT $1, UNNEST($2::BIGINT[]) ON CONFLICT DO NOTHING",
        )
        .bind(listing_id)
        .bind(option_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn option_associations(&self, listing_id: Uuid) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT option_id FROM listing_options WHERE listing_id = $1 ORDER BY option_id",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("option_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn query(&self, query: &ListingQuery) -> Result<Vec<CanonicalListing>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {LISTING_COLUMNS} FROM canonical_listings WHERE TRUE"
        ));
        if let Some(vin) = &query.vin {
            builder.push(" AND upper(vin) = upper(").push_bind(vin.clone()).push(")");
        }
        if let Some(source_id) = &query.source_id {
            builder.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if let Some(model) = &query.model {
            builder.push(" AND lower(model) = lower(").push_bind(model.clone()).push(")");
        }
        if let Some(trim) = &query.trim {
            builder.push(" AND lower(trim_level) = lower(").push_bind(trim.clone()).push(")");
        }
        if let Some(generation) = &query.generation {
            builder
                .push(" AND lower(generation) = lower(")
                .push_bind(generation.clone())
                .push(")");
        }
        if let Some(from) = query.sold_from {
            builder.push(" AND sold_date >= ").push_bind(from);
        }
        if let Some(to) = query.sold_to {
            builder.push(" AND sold_date <= ").push_bind(to);
        }
        if let Some(min) = query.price_min {
            builder.push(" AND price >= ").push_bind(min);
        }
        if let Some(max) = query.price_max {
            builder.push(" AND price <= ").push_bind(max);
        }
        builder.push(" ORDER BY sold_date DESC NULLS LAST, source_url ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(row_to_listing)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}
