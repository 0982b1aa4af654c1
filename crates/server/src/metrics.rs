//! Prometheus metrics for the hoard server.
//!
//! Exposes upload and delete outcomes, deduplication savings, and the
//! compensating actions the coordinator had to take.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no user ids, names, or hashes, but they do reveal aggregate
//! usage. Restrict the endpoint to scraper addresses at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use hoard_core::{DeleteOutcome, UploadKind};
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static UPLOADS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("hoard_uploads_total", "Uploads by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static DEDUP_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hoard_dedup_hits_total",
        "Uploads satisfied by a reference to existing content",
    )
    .expect("metric creation failed")
});

pub static COMPENSATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hoard_compensations_total",
        "Reservations deleted after a failed or cancelled blob write",
    )
    .expect("metric creation failed")
});

pub static BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hoard_bytes_stored_total",
        "Bytes written to the blob store for new content",
    )
    .expect("metric creation failed")
});

pub static BYTES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hoard_bytes_deduplicated_total",
        "Bytes not written because the content already existed",
    )
    .expect("metric creation failed")
});

pub static DELETES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("hoard_deletes_total", "Deletes by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static BLOB_PURGES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "hoard_blob_purges_total",
        "Blobs removed after their last record was deleted",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "hoard_upload_duration_seconds",
            "Time spent in the dedup coordinator per upload",
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build as many routers as they like.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DEDUP_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COMPENSATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_STORED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DELETES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_PURGES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

fn upload_label(kind: UploadKind) -> &'static str {
    match kind {
        UploadKind::AlreadyUploaded => "already_uploaded",
        UploadKind::Reference => "reference",
        UploadKind::Stored => "stored",
    }
}

/// Record a successful upload of `size` bytes.
pub fn record_upload(kind: UploadKind, size: u64) {
    UPLOADS.with_label_values(&[upload_label(kind)]).inc();
    match kind {
        UploadKind::Stored => BYTES_STORED.inc_by(size),
        UploadKind::Reference => {
            DEDUP_HITS.inc();
            BYTES_DEDUPLICATED.inc_by(size);
        }
        UploadKind::AlreadyUploaded => BYTES_DEDUPLICATED.inc_by(size),
    }
}

/// Record a failed upload by error kind.
pub fn record_upload_failure(error_kind: &str) {
    let label = format!("failed_{error_kind}");
    UPLOADS.with_label_values(&[label.as_str()]).inc();
}

/// Record a successful delete.
pub fn record_delete(outcome: &DeleteOutcome) {
    let label = match outcome {
        DeleteOutcome::ReferenceRemoved => "reference_removed",
        DeleteOutcome::RecordRemoved { .. } => "record_removed",
        DeleteOutcome::ContentRemoved => "content_removed",
    };
    DELETES.with_label_values(&[label]).inc();
}

/// Record a failed delete by error kind.
pub fn record_delete_failure(error_kind: &str) {
    let label = format!("failed_{error_kind}");
    DELETES.with_label_values(&[label.as_str()]).inc();
}
