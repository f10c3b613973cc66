//! Topic names and filters for message routing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved topic names shared between the supervisor and agents.
pub mod topics {
    /// Default seed topic published when a cluster starts.
    pub const ISSUE_OPENED: &str = "ISSUE_OPENED";

    /// Conventional topic published by agent completion hooks.
    pub const TASK_COMPLETE: &str = "TASK_COMPLETE";

    /// Conventional topic published by agent error hooks.
    pub const TASK_FAILED: &str = "TASK_FAILED";

    /// Reserved topic the supervisor watches to initiate a graceful stop.
    pub const CLUSTER_STOP: &str = "CLUSTER_STOP";

    /// Published by the runtime when an agent enters the error state.
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
}

/// A message topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A subscription filter over topics.
///
/// Supports exact matches, the catch-all `*`, and trailing prefix wildcards
/// (`task.*` matches `task.start` and `task.done`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Matches every topic.
    pub fn all() -> Self {
        Self("*".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this filter matches the given topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        if self.0 == "*" {
            return true;
        }
        if let Some(prefix) = self.0.strip_suffix(".*") {
            return topic
                .as_str()
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.0 == topic.as_str()
    }
}

impl From<&str> for TopicFilter {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let filter = TopicFilter::new("TASK_COMPLETE");
        assert!(filter.matches(&Topic::new("TASK_COMPLETE")));
        assert!(!filter.matches(&Topic::new("TASK_COMPLETED")));
        assert!(!filter.matches(&Topic::new("task_complete")));
    }

    #[test]
    fn test_catch_all() {
        let filter = TopicFilter::all();
        assert!(filter.matches(&Topic::new("anything")));
        assert!(filter.matches(&Topic::new("CLUSTER_STOP")));
    }

    #[test]
    fn test_prefix_wildcard() {
        let filter = TopicFilter::new("task.*");
        assert!(filter.matches(&Topic::new("task.start")));
        assert!(filter.matches(&Topic::new("task.done.confirmed")));
        assert!(!filter.matches(&Topic::new("task")));
        assert!(!filter.matches(&Topic::new("taskforce.start")));
    }
}
