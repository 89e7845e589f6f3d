//! Sink-side ingestion pipeline core for a log/metric shipping agent.
//!
//! A source hands envelopes to a [`Sink`]; the sink buffers them in a
//! two-tier queue, assembles batches under count/byte/time caps, throttles
//! submission with an adaptive multi-bucket rate limiter, dispatches to a
//! pluggable backend, and advances per-source bookmarks only once a batch
//! (or the successful slice of a partially-failed one) is acknowledged.
//! Delivery is at-least-once; there is no cross-sink or global ordering
//! guarantee, only per-bookmark-key monotonicity.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sink_pipeline::{
//!     AlwaysAllow, BookmarkCoordinator, Envelope, NoopMetricsSink, Sink, SinkConfig, SinkParts,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(primary_client: Arc<dyn sink_pipeline::BackendClient<bytes::Bytes, ()>>) -> anyhow::Result<()> {
//! let bookmark = BookmarkCoordinator::in_memory();
//! let sink = Sink::new(
//!     "access-logs",
//!     bookmark,
//!     SinkParts {
//!         primary_client,
//!         secondary_client: None,
//!         network_gate: Arc::new(AlwaysAllow),
//!         metrics_sink: Arc::new(NoopMetricsSink),
//!         sizer: Arc::new(|e: &Envelope<bytes::Bytes>| e.payload.len()),
//!         config: SinkConfig::default(),
//!         durable_codec: None,
//!         health_probe: None,
//!     },
//! )
//! .await?;
//! sink.spawn(1);
//! sink.push(Envelope::new(bytes::Bytes::from_static(b"log line"), 1)).await?;
//! sink.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod batching;
mod bookmark;
mod config;
mod dispatcher;
mod durable_queue;
mod envelope;
mod error;
mod failover;
mod http_backend;
mod metrics;
mod network_gate;
mod queue;
mod sink;
mod telemetry;
mod throttle;

#[cfg(test)]
mod testutil;

pub use backend::{BackendClient, EntryError, RecordIndex, SubmitOutcome};
pub use batching::combine_small_records;
pub use bookmark::BookmarkCoordinator;
pub use config::{DecorationConfig, SecondaryQueueType, SinkConfig};
pub use dispatcher::{Dispatcher, DispatcherState, StopSignal};
pub use durable_queue::{BatchCodec, DurableQueue};
pub use envelope::{Batch, Envelope, RawRecord, SizeOf};
pub use error::{BookmarkError, DispatchError, QueueError, RetryHint, SinkError};
pub use failover::{ActiveClient, FailoverController, HealthProbe};
pub use http_backend::{FramingMode, HttpBackendClient};
pub use metrics::{MetricsCounters, MetricsSink, NoopMetricsSink, SinkMetrics};
pub use network_gate::{AlwaysAllow, NetworkGate, PriorityThresholdGate};
pub use queue::{BackpressureStrategy, BatchCaps, PushOutcome, RequeueOutcome, TwoTierQueue};
pub use sink::{Sink, SinkParts};
pub use telemetry::RateLimitedLog;
pub use throttle::{AdaptiveThrottle, JitterSource, ThreadRngJitter, ThrottleConfig};
