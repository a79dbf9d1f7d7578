//! Queue selection rules.
//!
//! A queue specification is a comma-separated list of queue names:
//! - `""` or `"*"` selects every queue
//! - `"-a,b"` selects every queue except `a` and `b` (rows without a queue
//!   name are selected)
//! - `"a, b"` selects only `a` and `b`
//!
//! The same [`QueueSelector`] drives both the storage-side selection query
//! and the in-memory admission check, so the two always agree.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueSelector {
    #[default]
    All,
    Exclude(Vec<String>),
    Include(Vec<String>),
}

impl QueueSelector {
    /// Parse a queue selector string. Never fails: unrecognised input selects by name.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let text = if text.is_empty() { "*" } else { text };

        let (exclude, names) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };

        let queues: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from)
            .collect();

        if queues.iter().any(|q| q == "*") {
            QueueSelector::All
        } else if exclude {
            QueueSelector::Exclude(queues)
        } else {
            QueueSelector::Include(queues)
        }
    }

    /// Whether a job on `queue_name` falls inside this selection.
    pub fn matches(&self, queue_name: Option<&str>) -> bool {
        match self {
            QueueSelector::All => true,
            QueueSelector::Exclude(names) => {
                queue_name.is_none_or(|q| !names.iter().any(|n| n == q))
            }
            QueueSelector::Include(names) => {
                queue_name.is_some_and(|q| names.iter().any(|n| n == q))
            }
        }
    }

    /// Compile into a standalone predicate over queue names.
    pub fn predicate(&self) -> impl Fn(Option<&str>) -> bool + Send + Sync + 'static {
        let selector = self.clone();
        move |queue_name| selector.matches(queue_name)
    }
}

impl FromStr for QueueSelector {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
