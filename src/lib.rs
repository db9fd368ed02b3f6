//! PostHog client for Rust.
//!
//! Events are validated and normalized on the caller's task, queued on
//! a bounded in-memory channel, batched by a background worker, and
//! delivered with retry and decorrelated-jitter backoff. Feature flags
//! are decided locally from a periodically refreshed definition cache
//! when a personal API key is configured, falling back to the remote
//! decide endpoint otherwise.
//!
//! ```no_run
//! use posthog_rust::{Client, Config, Event};
//!
//! # async fn run() {
//! let config = Config::builder("phc_project_key")
//!     .host("https://us.posthog.com")
//!     .build()
//!     .unwrap();
//! let client = Client::new(config).await.unwrap();
//!
//! let mut event = Event::new("user signed up", "user-42");
//! event.insert_prop("plan", "free").unwrap();
//! client.capture(event).await;
//!
//! client.shutdown().await;
//! # }
//! ```

mod backoff;
mod batch;
mod client;
mod config;
mod endpoints;
mod error;
mod event;
mod exception;
mod feature_flags;
mod flag_service;
mod local_evaluation;
mod message;
mod remote_evaluation;
mod transport;
mod worker;

/// Library tag injected into every message as `$lib`.
pub const LIB_NAME: &str = "posthog-rust";
/// Library version injected into every message as `$lib_version`.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backoff::BackoffPolicy;
pub use batch::{BatchAdd, MessageBatch};
pub use client::Client;
pub use config::{BeforeSend, Config, ConfigBuilder, OnError};
pub use endpoints::{Endpoint, EndpointManager};
pub use error::Error;
pub use event::{Event, Properties};
pub use exception::{Exception, StackFrame};
pub use feature_flags::{
    hash_key, in_rollout, FeatureFlag, FlagConditionGroup, FlagError, FlagFilters, FlagProperty,
    FlagResult, FlagValue, GroupLogic, GroupValue, InconclusiveMatchError, Multivariate,
    PropertyGroup, Variant,
};
pub use flag_service::{FlagCallEvent, FlagOptions};
pub use local_evaluation::{FlagCache, FlagPoller, LocalEvaluationResponse, LocalEvaluator};
pub use message::{Message, MessageKind};
pub use remote_evaluation::{FlagDetail, FlagMetadata, FlagReason, RemoteEvaluator, RemoteFlags};
pub use transport::{Response, Transport};
