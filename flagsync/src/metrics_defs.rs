//! Metrics definitions for the synchronization engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STREAMING_AUTH_REJECTIONS: MetricDef = MetricDef {
    name: "streaming.auth_rejections",
    metric_type: MetricType::Counter,
    description: "Number of times the auth endpoint rejected the SDK key",
};

pub const STREAMING_TOKEN_REFRESHES: MetricDef = MetricDef {
    name: "streaming.token_refreshes",
    metric_type: MetricType::Counter,
    description: "Number of streaming token refreshes before expiry",
};

pub const STREAMING_STATUS: MetricDef = MetricDef {
    name: "streaming.status",
    metric_type: MetricType::Counter,
    description: "Streaming status transitions, tagged by status",
};

pub const STREAMING_NOTIFICATIONS: MetricDef = MetricDef {
    name: "streaming.notifications",
    metric_type: MetricType::Counter,
    description: "Push notifications received, tagged by type",
};

pub const STREAMING_MALFORMED_PAYLOADS: MetricDef = MetricDef {
    name: "streaming.malformed_payloads",
    metric_type: MetricType::Counter,
    description: "SSE messages or inline payloads that could not be decoded",
};

pub const SYNC_FETCH_ERRORS: MetricDef = MetricDef {
    name: "sync.fetch.errors",
    metric_type: MetricType::Counter,
    description: "Failed fetches, tagged by resource",
};

pub const SYNC_FETCH_DURATION: MetricDef = MetricDef {
    name: "sync.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to bring a cache up to date in seconds, tagged by resource",
};

pub const SYNC_SEGMENT_KEYS: MetricDef = MetricDef {
    name: "sync.segment.keys",
    metric_type: MetricType::Histogram,
    description: "Number of keys added or removed by a segment delta",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STREAMING_AUTH_REJECTIONS,
    STREAMING_TOKEN_REFRESHES,
    STREAMING_STATUS,
    STREAMING_NOTIFICATIONS,
    STREAMING_MALFORMED_PAYLOADS,
    SYNC_FETCH_ERRORS,
    SYNC_FETCH_DURATION,
    SYNC_SEGMENT_KEYS,
];
