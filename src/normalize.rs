//! Row normalization and validation.
//!
//! Coerces a raw [`SourceRow`] into a [`NormalizedJob`] or fails with a
//! [`ValidationError`] naming the offending field. Pure and deterministic;
//! no I/O, safe to call for every candidate row of every run.

use crate::job::{FulfillmentStatus, JobStatus, NormalizedJob, SourceRow};

/// Validation failure for a single source row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("job id is empty")]
    EmptyId,
    #[error("payment intent id is missing or empty")]
    MissingPaymentIntent,
    #[error("total is missing")]
    MissingTotal,
    #[error("total {0} is not a finite non-negative amount")]
    InvalidTotal(f64),
    #[error("currency is missing or empty")]
    MissingCurrency,
    #[error("line items are missing")]
    MissingLineItems,
    #[error("line items are not a JSON array")]
    LineItemsNotArray,
    #[error("line items are not valid JSON: {0}")]
    LineItemsUnparsable(String),
    #[error("created timestamp is missing or invalid")]
    MissingCreatedAt,
    #[error("updated timestamp is missing or invalid")]
    MissingUpdatedAt,
}

/// Validate and coerce a raw source row into the destination entity shape.
pub fn normalize(row: &SourceRow) -> Result<NormalizedJob, ValidationError> {
    if row.id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }

    let payment_intent_id = match row.payment_intent_id.as_deref() {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => return Err(ValidationError::MissingPaymentIntent),
    };

    let raw_total = row.total.ok_or(ValidationError::MissingTotal)?;
    if !raw_total.is_finite() || raw_total < 0.0 {
        return Err(ValidationError::InvalidTotal(raw_total));
    }
    let total = raw_total.round() as i64;

    let currency = match row.currency.as_deref() {
        Some(s) if !s.trim().is_empty() => s.to_lowercase(),
        _ => return Err(ValidationError::MissingCurrency),
    };

    let line_items = decode_line_items(row.line_items.as_ref())?;

    let created_at = row.created_at.ok_or(ValidationError::MissingCreatedAt)?;
    let updated_at = row.updated_at.ok_or(ValidationError::MissingUpdatedAt)?;

    Ok(NormalizedJob {
        id: row.id.clone(),
        payment_intent_id,
        total,
        currency,
        line_items,
        shipping: row.shipping.clone(),
        metadata: row.metadata.clone(),
        user_id: row.user_id.clone(),
        customer_email: row.customer_email.clone(),
        payment_method: row.payment_method.clone(),
        status: JobStatus::from_source(row.status.as_deref()),
        fulfillment_status: FulfillmentStatus::from_source(row.fulfillment_status.as_deref()),
        fulfilled_at: row.fulfilled_at,
        created_at,
        updated_at,
    })
}

/// Line items arrive either as a JSON array or as a JSON-encoded string
/// containing one, depending on which source table they were read from.
/// Element shape is not inspected; they are mirrored as opaque JSON.
fn decode_line_items(
    raw: Option<&serde_json::Value>,
) -> Result<serde_json::Value, ValidationError> {
    let value = match raw {
        None | Some(serde_json::Value::Null) => return Err(ValidationError::MissingLineItems),
        Some(serde_json::Value::String(s)) => serde_json::from_str::<serde_json::Value>(s)
            .map_err(|e| ValidationError::LineItemsUnparsable(e.to_string()))?,
        Some(v) => v.clone(),
    };

    if value.is_array() {
        Ok(value)
    } else {
        Err(ValidationError::LineItemsNotArray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn valid_row() -> SourceRow {
        SourceRow {
            id: "mw-1001".into(),
            payment_intent_id: Some("pi_abc123".into()),
            total: Some(4250.0),
            currency: Some("USD".into()),
            line_items: Some(serde_json::json!([{"sku": "panel-3mm", "qty": 2}])),
            shipping: Some(serde_json::json!({"city": "Portland"})),
            metadata: None,
            user_id: Some("u-9".into()),
            customer_email: Some("maker@example.com".into()),
            payment_method: Some("card".into()),
            status: Some("paid".into()),
            fulfillment_status: Some("ready".into()),
            fulfilled_at: None,
            created_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 3, 2, 10, 30, 0).unwrap()),
        }
    }

    #[test]
    fn normalizes_a_valid_row() {
        let job = normalize(&valid_row()).expect("row should normalize");
        assert_eq!(job.id, "mw-1001");
        assert_eq!(job.total, 4250);
        assert_eq!(job.currency, "usd");
        assert_eq!(job.status, JobStatus::Paid);
        assert_eq!(job.fulfillment_status, FulfillmentStatus::Ready);
        assert!(job.line_items.is_array());
    }

    #[test]
    fn normalization_is_deterministic() {
        let row = valid_row();
        let first = normalize(&row).unwrap();
        let second = normalize(&row).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_empty_id() {
        let mut row = valid_row();
        row.id = "  ".into();
        assert_eq!(normalize(&row), Err(ValidationError::EmptyId));
    }

    #[test]
    fn rejects_missing_payment_intent() {
        let mut row = valid_row();
        row.payment_intent_id = Some(String::new());
        assert_eq!(normalize(&row), Err(ValidationError::MissingPaymentIntent));
        row.payment_intent_id = None;
        assert_eq!(normalize(&row), Err(ValidationError::MissingPaymentIntent));
    }

    #[test]
    fn rejects_bad_totals() {
        let mut row = valid_row();
        row.total = None;
        assert_eq!(normalize(&row), Err(ValidationError::MissingTotal));
        row.total = Some(-1.0);
        assert!(matches!(
            normalize(&row),
            Err(ValidationError::InvalidTotal(_))
        ));
        row.total = Some(f64::NAN);
        assert!(matches!(
            normalize(&row),
            Err(ValidationError::InvalidTotal(_))
        ));
        row.total = Some(f64::INFINITY);
        assert!(matches!(
            normalize(&row),
            Err(ValidationError::InvalidTotal(_))
        ));
    }

    #[test]
    fn zero_total_is_allowed() {
        let mut row = valid_row();
        row.total = Some(0.0);
        assert_eq!(normalize(&row).unwrap().total, 0);
    }

    #[test]
    fn currency_is_lowercased() {
        let mut row = valid_row();
        row.currency = Some("EUR".into());
        assert_eq!(normalize(&row).unwrap().currency, "eur");
    }

    #[test]
    fn accepts_line_items_as_json_string() {
        let mut row = valid_row();
        row.line_items = Some(serde_json::Value::String("[{\"sku\":\"x\"}]".into()));
        let job = normalize(&row).unwrap();
        assert_eq!(job.line_items, serde_json::json!([{"sku": "x"}]));
    }

    #[test]
    fn accepts_empty_line_items_array() {
        let mut row = valid_row();
        row.line_items = Some(serde_json::json!([]));
        assert_eq!(normalize(&row).unwrap().line_items, serde_json::json!([]));
    }

    #[test]
    fn rejects_non_array_line_items() {
        let mut row = valid_row();
        row.line_items = Some(serde_json::json!({"sku": "x"}));
        assert_eq!(normalize(&row), Err(ValidationError::LineItemsNotArray));
        row.line_items = Some(serde_json::Value::String("{\"sku\":\"x\"}".into()));
        assert_eq!(normalize(&row), Err(ValidationError::LineItemsNotArray));
        row.line_items = Some(serde_json::Value::String("not json".into()));
        assert!(matches!(
            normalize(&row),
            Err(ValidationError::LineItemsUnparsable(_))
        ));
        row.line_items = None;
        assert_eq!(normalize(&row), Err(ValidationError::MissingLineItems));
    }

    #[test]
    fn rejects_missing_timestamps() {
        let mut row = valid_row();
        row.created_at = None;
        assert_eq!(normalize(&row), Err(ValidationError::MissingCreatedAt));
        let mut row = valid_row();
        row.updated_at = None;
        assert_eq!(normalize(&row), Err(ValidationError::MissingUpdatedAt));
    }

    #[test]
    fn unknown_statuses_fall_back_to_defaults() {
        let mut row = valid_row();
        row.status = Some("weird".into());
        row.fulfillment_status = None;
        let job = normalize(&row).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.fulfillment_status, FulfillmentStatus::Pending);
    }
}
