//! Job data types shared by the sync engine and the destination store.
//!
//! `SourceRow` is the raw shape read from the foreign MakerWorks schema,
//! `NormalizedJob` is the validated form produced by [`crate::normalize`],
//! and `DestinationJob` is the locally-owned entity the dashboard queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a fabrication job.
///
/// Source values map case-sensitively; anything unrecognized (including an
/// absent value) falls back to [`JobStatus::Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Paid,
    InProduction,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Paid => "paid",
            JobStatus::InProduction => "in_production",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Map a raw MakerWorks status string onto the closed enumeration.
    pub fn from_source(raw: Option<&str>) -> Self {
        match raw {
            Some("pending") => JobStatus::Pending,
            Some("paid") => JobStatus::Paid,
            Some("in_production") => JobStatus::InProduction,
            Some("completed") => JobStatus::Completed,
            Some("cancelled") => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fulfillment progress of a job, defaulting to [`FulfillmentStatus::Pending`]
/// for unrecognized or absent source values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Ready,
    Shipped,
    PickedUp,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Pending => "pending",
            FulfillmentStatus::Ready => "ready",
            FulfillmentStatus::Shipped => "shipped",
            FulfillmentStatus::PickedUp => "picked_up",
        }
    }

    /// Map a raw MakerWorks fulfillment string onto the closed enumeration.
    pub fn from_source(raw: Option<&str>) -> Self {
        match raw {
            Some("pending") => FulfillmentStatus::Pending,
            Some("ready") => FulfillmentStatus::Ready,
            Some("shipped") => FulfillmentStatus::Shipped,
            Some("picked_up") => FulfillmentStatus::PickedUp,
            _ => FulfillmentStatus::Pending,
        }
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw record read from the foreign MakerWorks job table, optionally joined
/// with the companion checkout table on `payment_intent_id`.
///
/// Every field except `id` is optional because the source schema is owned by
/// an external system and read tolerantly; validation happens in
/// [`crate::normalize::normalize`]. The struct serializes to JSON so the
/// last-known payload can be captured into dead-letter entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: String,
    pub payment_intent_id: Option<String>,
    /// Monetary total in minor units. Decoded leniently (integer, numeric or
    /// float columns) so drift in the source column type does not break reads.
    pub total: Option<f64>,
    pub currency: Option<String>,
    /// JSON array of line items, or a JSON-encoded string containing one.
    pub line_items: Option<serde_json::Value>,
    pub shipping: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub customer_email: Option<String>,
    pub payment_method: Option<String>,
    pub status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// Last-modified timestamp; the sync watermark field.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceRow {
    /// The raw payload captured into dead-letter entries.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Validated, typed form of a [`SourceRow`], ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedJob {
    pub id: String,
    pub payment_intent_id: String,
    /// Minor units, always >= 0.
    pub total: i64,
    /// Lower-cased ISO currency code.
    pub currency: String,
    /// Always a JSON array; elements are treated as opaque.
    pub line_items: serde_json::Value,
    pub shipping: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub customer_email: Option<String>,
    pub payment_method: Option<String>,
    pub status: JobStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Locally-owned persisted job entity.
///
/// MakerWorks-origin fields are written only by the sync engine; the
/// queue position and the viewed/invoice/receipt timestamps belong to the
/// dashboard mutation paths and are never overwritten by sync updates.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationJob {
    pub id: String,
    pub payment_intent_id: String,
    pub total: i64,
    pub currency: String,
    pub line_items: serde_json::Value,
    pub shipping: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub customer_email: Option<String>,
    pub payment_method: Option<String>,
    pub status: JobStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub source_created_at: DateTime<Utc>,
    pub source_updated_at: DateTime<Utc>,
    /// Manual-ordering position, assigned on insert and then owned by the
    /// dashboard.
    pub queue_position: i64,
    pub viewed_at: Option<DateTime<Utc>>,
    pub invoiced_at: Option<DateTime<Utc>>,
    pub receipted_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl DestinationJob {
    /// Build a fresh destination row from a normalized job, with locally-owned
    /// fields in their untouched state.
    pub fn from_normalized(job: &NormalizedJob, queue_position: i64, now: DateTime<Utc>) -> Self {
        DestinationJob {
            id: job.id.clone(),
            payment_intent_id: job.payment_intent_id.clone(),
            total: job.total,
            currency: job.currency.clone(),
            line_items: job.line_items.clone(),
            shipping: job.shipping.clone(),
            metadata: job.metadata.clone(),
            user_id: job.user_id.clone(),
            customer_email: job.customer_email.clone(),
            payment_method: job.payment_method.clone(),
            status: job.status,
            fulfillment_status: job.fulfillment_status,
            fulfilled_at: job.fulfilled_at,
            source_created_at: job.created_at,
            source_updated_at: job.updated_at,
            queue_position,
            viewed_at: None,
            invoiced_at: None,
            receipted_at: None,
            synced_at: now,
        }
    }

    /// Overwrite the MakerWorks-origin fields in place, leaving locally-owned
    /// fields untouched.
    pub fn apply_normalized(&mut self, job: &NormalizedJob, now: DateTime<Utc>) {
        self.payment_intent_id = job.payment_intent_id.clone();
        self.total = job.total;
        self.currency = job.currency.clone();
        self.line_items = job.line_items.clone();
        self.shipping = job.shipping.clone();
        self.metadata = job.metadata.clone();
        self.user_id = job.user_id.clone();
        self.customer_email = job.customer_email.clone();
        self.payment_method = job.payment_method.clone();
        self.status = job.status;
        self.fulfillment_status = job.fulfillment_status;
        self.fulfilled_at = job.fulfilled_at;
        self.source_created_at = job.created_at;
        self.source_updated_at = job.updated_at;
        self.synced_at = now;
    }
}
