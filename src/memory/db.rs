// src/memory/db.rs
//
// Persistence for learned memory records. A per-template snapshot is loaded
// into a MemoryStore at task start; mutated records are written back with a
// batch upsert. The partial unique index on (normalized_name, template_id)
// WHERE status = 'active' backs the one-active-record invariant against
// concurrent writers.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::memory::store::MemoryStore;
use crate::models::core::{
    LearnSource, MemoryRecord, MemoryStatus, ProductId, TaskId, TemplateId,
};
use crate::utils::db_connect::PgPool;

fn record_from_row(row: &Row) -> Result<MemoryRecord> {
    let conflicts: serde_json::Value = row.get("conflicts");
    let audit_trail: serde_json::Value = row.get("audit_trail");
    Ok(MemoryRecord {
        id: row.get("id"),
        normalized_name: row.get("normalized_name"),
        original_name: row.get("original_name"),
        confirmed_product_id: ProductId(row.get("product_id")),
        template_id: TemplateId(row.get("template_id")),
        confidence: row.get("confidence"),
        confirm_count: row.get("confirm_count"),
        usage_count: row.get("usage_count"),
        weight: row.get("weight"),
        status: MemoryStatus::from_str(row.get("status")),
        is_user_preference: row.get("is_user_preference"),
        source: LearnSource::from_str(row.get("source")),
        source_task_id: row
            .get::<_, Option<String>>("source_task_id")
            .map(TaskId),
        conflicts: serde_json::from_value(conflicts)
            .context("Failed to deserialize memory conflicts")?,
        audit_trail: serde_json::from_value(audit_trail)
            .context("Failed to deserialize memory audit trail")?,
        created_at: row.get("created_at"),
        last_confirmed_at: row.get("last_confirmed_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Loads the memory snapshot for one template (or every template when none is
/// given, for the cleanup pass).
pub async fn load_memory_store(
    pool: &PgPool,
    template_id: Option<&TemplateId>,
) -> Result<MemoryStore> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for memory load")?;

    let rows = match template_id {
        Some(template) => {
            conn.query(
                "SELECT id, normalized_name, original_name, product_id, template_id,
                        confidence, confirm_count, usage_count, weight, status,
                        is_user_preference, source, source_task_id, conflicts,
                        audit_trail, created_at, last_confirmed_at, updated_at
                 FROM matching.memory_records
                 WHERE template_id = $1",
                &[&template.0],
            )
            .await
            .context("Failed to query memory records for template")?
        }
        None => {
            conn.query(
                "SELECT id, normalized_name, original_name, product_id, template_id,
                        confidence, confirm_count, usage_count, weight, status,
                        is_user_preference, source, source_task_id, conflicts,
                        audit_trail, created_at, last_confirmed_at, updated_at
                 FROM matching.memory_records",
                &[],
            )
            .await
            .context("Failed to query all memory records")?
        }
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match record_from_row(row) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable memory record: {}", e),
        }
    }
    info!(
        "Loaded {} memory record(s){}",
        records.len(),
        template_id.map_or(String::new(), |t| format!(" for template {}", t.0))
    );
    Ok(MemoryStore::from_records(records))
}

/// Writes every dirty record back in one transactional batch upsert.
pub async fn persist_dirty(pool: &PgPool, store: &mut MemoryStore) -> Result<usize> {
    let dirty = store.take_dirty();
    if dirty.is_empty() {
        return Ok(0);
    }

    let mut conn = pool
        .get()
        .await
        .context("Failed to get DB connection for memory persist")?;
    let transaction = conn
        .transaction()
        .await
        .context("Failed to start transaction for memory persist")?;

    let mut values_clause_parts = Vec::new();
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    let mut param_idx = 1;

    for record in &dirty {
        values_clause_parts.push(format!(
            "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
            param_idx,
            param_idx + 1,
            param_idx + 2,
            param_idx + 3,
            param_idx + 4,
            param_idx + 5,
            param_idx + 6,
            param_idx + 7,
            param_idx + 8,
            param_idx + 9,
            param_idx + 10,
            param_idx + 11,
            param_idx + 12,
            param_idx + 13,
            param_idx + 14,
            param_idx + 15,
            param_idx + 16,
            param_idx + 17
        ));
        params.push(Box::new(record.id.clone()));
        params.push(Box::new(record.normalized_name.clone()));
        params.push(Box::new(record.original_name.clone()));
        params.push(Box::new(record.confirmed_product_id.0.clone()));
        params.push(Box::new(record.template_id.0.clone()));
        params.push(Box::new(record.confidence));
        params.push(Box::new(record.confirm_count));
        params.push(Box::new(record.usage_count));
        params.push(Box::new(record.weight));
        params.push(Box::new(record.status.as_str().to_string()));
        params.push(Box::new(record.is_user_preference));
        params.push(Box::new(record.source.as_str().to_string()));
        params.push(Box::new(
            record.source_task_id.as_ref().map(|t| t.0.clone()),
        ));
        params.push(Box::new(
            serde_json::to_value(&record.conflicts)
                .context("Failed to serialize memory conflicts")?,
        ));
        params.push(Box::new(
            serde_json::to_value(&record.audit_trail)
                .context("Failed to serialize memory audit trail")?,
        ));
        params.push(Box::new(record.created_at));
        params.push(Box::new(record.last_confirmed_at));
        params.push(Box::new(record.updated_at));
        param_idx += 18;
    }

    let upsert_sql = format!(
        "INSERT INTO matching.memory_records (
            id, normalized_name, original_name, product_id, template_id,
            confidence, confirm_count, usage_count, weight, status,
            is_user_preference, source, source_task_id, conflicts,
            audit_trail, created_at, last_confirmed_at, updated_at
         ) VALUES {}
         ON CONFLICT (id) DO UPDATE SET
            product_id = EXCLUDED.product_id,
            confidence = EXCLUDED.confidence,
            confirm_count = EXCLUDED.confirm_count,
            usage_count = EXCLUDED.usage_count,
            weight = EXCLUDED.weight,
            status = EXCLUDED.status,
            is_user_preference = EXCLUDED.is_user_preference,
            source = EXCLUDED.source,
            source_task_id = EXCLUDED.source_task_id,
            conflicts = EXCLUDED.conflicts,
            audit_trail = EXCLUDED.audit_trail,
            last_confirmed_at = EXCLUDED.last_confirmed_at,
            updated_at = EXCLUDED.updated_at",
        values_clause_parts.join(", ")
    );

    let params_slice: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();

    debug!(
        "Persisting {} dirty memory record(s) with {} parameters",
        dirty.len(),
        params_slice.len()
    );

    transaction
        .execute(upsert_sql.as_str(), params_slice.as_slice())
        .await
        .context("Failed to execute memory record batch upsert")?;
    transaction
        .commit()
        .await
        .context("Failed to commit memory record batch upsert")?;

    info!("Persisted {} memory record(s)", dirty.len());
    Ok(dirty.len())
}
