//! # grav_stream
//!
//! Delivery of workflow events to observers.
//!
//! Events are appended to a bounded, expiring per-thread log and broadcast
//! to live subscribers at the same time. A subscriber that connects late,
//! or reconnects with the last id it saw, gets the retained history first
//! and then the live feed, in order and without duplicates.
//!
//! - [`EventLog`]: durable storage, in memory or as JSON-lines files
//! - [`SubscriberRegistry`]: per-thread broadcast and wildcard channels
//! - [`EventPublisher`]: the [`grav_core::EventSink`] the workflow publishes to
//! - [`Subscription`]: backlog replay, offset resume and lag recovery

pub mod error;
pub mod log;
pub mod publisher;
pub mod registry;
pub mod subscription;

pub use error::{StreamError, StreamResult};
pub use log::{EventFrame, EventLog, FileEventLog, InMemoryEventLog, LoggedEvent};
pub use publisher::EventPublisher;
pub use registry::{pattern_regex, PatternSubscription, SubscriberRegistry};
pub use subscription::Subscription;
