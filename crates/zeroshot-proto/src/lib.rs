//! # zeroshot-proto
//!
//! Shared types, error definitions, and the message bus for the zeroshot
//! orchestrator.
//!
//! This crate provides the foundational abstractions used across all
//! zeroshot crates, including:
//! - `Message` and `MessageBus` types for the per-cluster event ledger
//! - Topic types and filters for event routing
//! - Reserved topic names the supervisor and agents agree on
//! - Common error types

mod bus;
mod error;
mod message;
mod topic;

pub use bus::{MessageBus, MessageQuery, SubscriptionId};
pub use error::{Error, Result};
pub use message::{Message, ORCHESTRATOR_PUBLISHER};
pub use topic::{topics, Topic, TopicFilter};
