//! Reads against the foreign MakerWorks schema.
//!
//! The source tables are owned by an external system, so every column is
//! decoded tolerantly: ids and totals may arrive as integers, numerics or
//! text, JSON blobs as jsonb or text, timestamps as timestamptz, naive
//! timestamps or RFC 3339 strings. Anything that cannot be decoded becomes
//! `None` and is judged by the normalizer, not by the reader.

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::Row;

use crate::config::SyncConfig;
use crate::job::SourceRow;
use crate::store::ReadStrategy;

/// Column list for the two read strategies. With the companion checkout
/// table absent, its fields are selected as NULL so the row shape stays
/// identical.
fn select_clause(config: &SyncConfig, strategy: ReadStrategy) -> String {
    match strategy {
        ReadStrategy::Joined => format!(
            "SELECT j.id::text AS id, j.payment_intent_id, j.total, j.currency, \
             j.line_items, c.shipping, c.metadata, j.user_id, c.customer_email, \
             j.payment_method, j.status, j.fulfillment_status, j.fulfilled_at, \
             j.created_at, j.updated_at \
             FROM {jobs} j \
             LEFT JOIN {checkouts} c ON c.payment_intent_id = j.payment_intent_id",
            jobs = config.source_table,
            checkouts = config.checkout_table,
        ),
        ReadStrategy::Bare => format!(
            "SELECT j.id::text AS id, j.payment_intent_id, j.total, j.currency, \
             j.line_items, NULL::jsonb AS shipping, NULL::jsonb AS metadata, \
             j.user_id, NULL::text AS customer_email, \
             j.payment_method, j.status, j.fulfillment_status, j.fulfilled_at, \
             j.created_at, j.updated_at \
             FROM {jobs} j",
            jobs = config.source_table,
        ),
    }
}

/// Delta or full row set, ordered by modification time ascending.
pub fn rows_query(config: &SyncConfig, strategy: ReadStrategy, with_since: bool) -> String {
    let mut sql = select_clause(config, strategy);
    if with_since {
        sql.push_str(" WHERE j.updated_at > $1");
    }
    sql.push_str(" ORDER BY j.updated_at ASC");
    sql
}

/// Current source rows for a set of ids (dead-letter retries).
pub fn rows_by_ids_query(config: &SyncConfig, strategy: ReadStrategy) -> String {
    let mut sql = select_clause(config, strategy);
    sql.push_str(" WHERE j.id::text = ANY($1) ORDER BY j.updated_at ASC");
    sql
}

pub fn watermark_query(config: &SyncConfig) -> String {
    format!(
        "SELECT max(updated_at) FROM {jobs}",
        jobs = config.source_table
    )
}

/// Decode one foreign row into a [`SourceRow`].
pub fn decode_row(row: &Row) -> Result<SourceRow> {
    Ok(SourceRow {
        id: row.try_get::<_, String>("id")?,
        payment_intent_id: decode_text(row, "payment_intent_id"),
        total: decode_total(row),
        currency: decode_text(row, "currency"),
        line_items: decode_json(row, "line_items"),
        shipping: decode_json(row, "shipping"),
        metadata: decode_json(row, "metadata"),
        user_id: decode_text(row, "user_id"),
        customer_email: decode_text(row, "customer_email"),
        payment_method: decode_text(row, "payment_method"),
        status: decode_text(row, "status"),
        fulfillment_status: decode_text(row, "fulfillment_status"),
        fulfilled_at: decode_timestamp(row, "fulfilled_at"),
        created_at: decode_timestamp(row, "created_at"),
        updated_at: decode_timestamp(row, "updated_at"),
    })
}

fn decode_text(row: &Row, column: &str) -> Option<String> {
    if let Ok(value) = row.try_get::<_, Option<String>>(column) {
        return value;
    }
    if let Ok(value) = row.try_get::<_, Option<uuid::Uuid>>(column) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<_, Option<i64>>(column) {
        return value.map(|v| v.to_string());
    }
    None
}

/// Monetary totals drift between bigint, numeric and double precision in the
/// wild; accept all of them.
fn decode_total(row: &Row) -> Option<f64> {
    if let Ok(value) = row.try_get::<_, Option<i64>>("total") {
        return value.map(|v| v as f64);
    }
    if let Ok(value) = row.try_get::<_, Option<i32>>("total") {
        return value.map(|v| v as f64);
    }
    if let Ok(value) = row.try_get::<_, Option<f64>>("total") {
        return value;
    }
    if let Ok(value) = row.try_get::<_, Option<Decimal>>("total") {
        return value.and_then(|d| d.to_f64());
    }
    if let Ok(value) = row.try_get::<_, Option<String>>("total") {
        return value.and_then(|s| s.parse::<f64>().ok());
    }
    None
}

fn decode_json(row: &Row, column: &str) -> Option<serde_json::Value> {
    if let Ok(value) = row.try_get::<_, Option<serde_json::Value>>(column) {
        return value;
    }
    // Text column holding encoded JSON; the normalizer parses it.
    if let Ok(value) = row.try_get::<_, Option<String>>(column) {
        return value.map(serde_json::Value::String);
    }
    None
}

fn decode_timestamp(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    if let Ok(value) = row.try_get::<_, Option<DateTime<Utc>>>(column) {
        return value;
    }
    if let Ok(value) = row.try_get::<_, Option<NaiveDateTime>>(column) {
        return value.map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(value) = row.try_get::<_, Option<String>>(column) {
        return value
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_query_filters_and_orders() {
        let config = SyncConfig::default();
        let sql = rows_query(&config, ReadStrategy::Joined, true);
        assert!(sql.contains("WHERE j.updated_at > $1"));
        assert!(sql.ends_with("ORDER BY j.updated_at ASC"));
        assert!(sql.contains("LEFT JOIN makerworks_checkouts"));
    }

    #[test]
    fn full_query_has_no_watermark_filter() {
        let config = SyncConfig::default();
        let sql = rows_query(&config, ReadStrategy::Bare, false);
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("NULL::jsonb AS shipping"));
        assert!(!sql.contains("JOIN"));
    }

    #[test]
    fn id_lookup_query_uses_any() {
        let config = SyncConfig::default();
        let sql = rows_by_ids_query(&config, ReadStrategy::Bare);
        assert!(sql.contains("= ANY($1)"));
    }
}
