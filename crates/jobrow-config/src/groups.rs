//! Queue-group grammar.
//!
//! A queue string is a semicolon-separated list of groups, each
//! `selector[:max_threads]`, e.g. `"*:1;mice,ferrets:2;elephant:4"`. Group
//! order is preserved: earlier groups get first refusal on work.

use jobrow_core::QueueSelector;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// One scheduling group: a queue selection and its worker count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGroup {
    /// The selector text as written, used to name the group.
    pub name: String,
    pub selector: QueueSelector,
    pub max_threads: usize,
}

impl QueueGroup {
    /// Parse every group in `queue_string`, filling in `default_max_threads`
    /// where a group gives no count. An empty string yields a single group
    /// covering all queues.
    pub fn parse_all(queue_string: &str, default_max_threads: usize) -> ConfigResult<Vec<Self>> {
        let mut groups = Vec::new();

        for segment in queue_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            groups.push(Self::parse(segment, default_max_threads)?);
        }

        if groups.is_empty() {
            groups.push(Self::parse("*", default_max_threads)?);
        }

        Ok(groups)
    }

    fn parse(segment: &str, default_max_threads: usize) -> ConfigResult<Self> {
        let (name, max_threads) = match segment.split_once(':') {
            Some((name, threads)) => {
                let threads = threads.trim();
                let count = threads
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidQueueGroup {
                        group: segment.to_string(),
                        message: format!("thread count {threads:?} is not a number"),
                    })?;
                (name.trim(), count)
            }
            None => (segment, default_max_threads),
        };

        if max_threads == 0 {
            return Err(ConfigError::InvalidQueueGroup {
                group: segment.to_string(),
                message: "thread count must be at least 1".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            selector: QueueSelector::parse(name),
            max_threads,
        })
    }
}
