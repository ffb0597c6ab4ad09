//! The Rust SDK for PostHog product analytics and feature flags.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that captures [`Event`]s for users identified by a
//! `distinct_id` and evaluates feature flags for them. Events are queued and sent to the server
//! in batches by a background thread.
//!
//! Feature flags are evaluated locally when flag definitions are available (this requires a
//! personal API key, see [`ClientConfig::personal_api_key`] and [`Client::start_poller_thread`]).
//! Flags that cannot be evaluated locally are evaluated by the server. Server results go through
//! a [`FeatureFlagCache`]; [`RequestScopedFeatureFlagCache`] asks the server at most once per
//! user and [`RequestScope`], e.g. an inbound HTTP request of a web service.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! In production, it is recommended to ignore all errors, as analytics and feature flag
//! evaluation should not be critical enough to cause system crashes. However, the returned errors
//! are valuable for debugging and usually indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `posthog` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! An example can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

use std::collections::HashMap;

mod api_client;
mod batch;
mod client;
mod config;
mod error;
mod event;
pub mod flags;
mod flusher;
mod groups;

pub use client::Client;
pub use config::{ClientConfig, ClientSettings};
pub use error::{Error, Result};
pub use event::{CapturedEvent, Event};
pub use flags::cache::{
    FeatureFlagCache, FlagCacheKey, NullFeatureFlagCache, RequestScope,
    RequestScopedFeatureFlagCache, ScopeAccessor, ScopeGuard, ThreadLocalScopeAccessor,
};
pub use flags::{FeatureFlag, FeatureFlagValue, FeatureFlags, FlagOptions, PollerThread};
pub use groups::{Group, Groups};

/// Properties of events, persons and groups.
pub type Properties = HashMap<String, serde_json::Value>;
