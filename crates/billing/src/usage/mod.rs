//! Usage metering: in-process aggregation with periodic durable flush

mod aggregator;
mod models;

pub use aggregator::{BucketKey, FlushSummary, IngestOutcome, UsageAggregator};
pub use models::{FlushBatch, UsageEvent, UsageRecord};
