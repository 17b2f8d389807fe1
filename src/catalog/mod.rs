// src/catalog/mod.rs
//
// Boundary to the catalog collaborator: read-only snapshot loading, brand-set
// extraction, and the price propagation sink. Sink failures are logged and
// swallowed; they must never abort the matching flow.

use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;

use crate::matching::normalize::deep_normalize;
use crate::models::core::{CatalogEntry, ProductId, RecordId, TemplateId};
use crate::utils::db_connect::PgPool;

/// Loads the active catalog snapshot for one template.
pub async fn load_active_catalog(
    pool: &PgPool,
    template_id: &TemplateId,
) -> Result<Vec<CatalogEntry>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for catalog load")?;

    let rows = conn
        .query(
            "SELECT id, name, brand, template_id, wholesale_price, retail_price, keywords
             FROM matching.catalog_entries
             WHERE template_id = $1 AND active = TRUE",
            &[&template_id.0],
        )
        .await
        .context("Failed to query active catalog entries")?;

    let entries: Vec<CatalogEntry> = rows
        .iter()
        .map(|row| CatalogEntry {
            id: ProductId(row.get("id")),
            name: row.get("name"),
            brand: row.get("brand"),
            template_id: TemplateId(row.get("template_id")),
            wholesale_price: row.get("wholesale_price"),
            retail_price: row.get("retail_price"),
            keywords: row
                .get::<_, Option<Vec<String>>>("keywords")
                .unwrap_or_default(),
        })
        .collect();

    info!(
        "Loaded catalog snapshot: {} active entries for template {}",
        entries.len(),
        template_id.0
    );
    Ok(entries)
}

/// Normalized brand set for a catalog snapshot, passed explicitly into the
/// scorer per call (never stored as engine state).
pub fn build_brand_set(catalog: &[CatalogEntry]) -> HashSet<String> {
    catalog
        .iter()
        .filter_map(|entry| entry.brand.as_deref())
        .map(deep_normalize)
        .filter(|brand| !brand.is_empty())
        .collect()
}

/// Propagates a confirmed wholesale price onto the catalog product. Invoked
/// on every auto-confirm or manual confirm; errors are downgraded to warnings.
pub async fn apply_wholesale_price(
    pool: &PgPool,
    product_id: &ProductId,
    wholesale_name: &str,
    price: Option<f64>,
    unit: Option<&str>,
    source_record_id: &RecordId,
) {
    let Some(price) = price else {
        return;
    };
    if let Err(e) =
        apply_wholesale_price_inner(pool, product_id, wholesale_name, price, unit, source_record_id)
            .await
    {
        warn!(
            "Price propagation failed for product {} (record {}): {}",
            product_id.0, source_record_id.0, e
        );
    }
}

async fn apply_wholesale_price_inner(
    pool: &PgPool,
    product_id: &ProductId,
    wholesale_name: &str,
    price: f64,
    unit: Option<&str>,
    source_record_id: &RecordId,
) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for price propagation")?;
    let updated = conn
        .execute(
            "UPDATE matching.catalog_entries
             SET wholesale_price = $2,
                 wholesale_name = $3,
                 wholesale_unit = $4,
                 price_source_record_id = $5,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
            &[
                &product_id.0,
                &price,
                &wholesale_name,
                &unit,
                &source_record_id.0,
            ],
        )
        .await
        .context("Failed to update catalog wholesale price")?;
    if updated == 0 {
        warn!(
            "Price propagation matched no catalog entry for product {}",
            product_id.0
        );
    }
    Ok(())
}
