//! Metrics definitions for the reconciler.

use shared::metrics_defs::{MetricDef, MetricType};

pub const BITBUCKET_REQUESTS: MetricDef = MetricDef {
    name: "bitbucket.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the Bitbucket API, labelled by response status",
};

pub const BITBUCKET_RETRIES: MetricDef = MetricDef {
    name: "bitbucket.retries",
    metric_type: MetricType::Counter,
    description: "Bitbucket requests retried after a 429 or 5xx response",
};

pub const ACL_ENTRIES: MetricDef = MetricDef {
    name: "acl.entries",
    metric_type: MetricType::Histogram,
    description: "Number of ACL entries fetched for one resource",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to reconcile one resource in seconds",
};

pub const RESOLUTION_FAILURES: MetricDef = MetricDef {
    name: "reconcile.resolution_failures",
    metric_type: MetricType::Counter,
    description: "Identities skipped because their remote account could not be resolved",
};

pub const DANGLING_PERMISSIONS: MetricDef = MetricDef {
    name: "reconcile.dangling",
    metric_type: MetricType::Histogram,
    description: "Granted remote ACL entries with no reconciled local identity",
};

pub const CACHE_WRITE_FAILURES: MetricDef = MetricDef {
    name: "cache.write_failures",
    metric_type: MetricType::Counter,
    description: "Advisory cache writes that failed and were dropped",
};

pub const ALL_METRICS: &[MetricDef] = &[
    BITBUCKET_REQUESTS,
    BITBUCKET_RETRIES,
    ACL_ENTRIES,
    RECONCILE_DURATION,
    RESOLUTION_FAILURES,
    DANGLING_PERMISSIONS,
    CACHE_WRITE_FAILURES,
];
