//! Composite group identity.

use std::fmt;
use std::str::FromStr;

use crate::error::GroupError;

/// Identity of a group: the consumer that will process released chunks and
/// the queue they are released onto. Rendered as `consumer:queue`.
///
/// The consumer part may not contain `:`, so a rendered name always splits
/// back unambiguously at its first colon. Queue names may contain colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName {
    consumer: String,
    queue: String,
}

impl GroupName {
    pub fn new(consumer: impl Into<String>, queue: impl Into<String>) -> Result<Self, GroupError> {
        let consumer = consumer.into();
        let queue = queue.into();

        let invalid = |reason: &str| GroupError::InvalidGroupName {
            name: format!("{}:{}", consumer, queue),
            reason: reason.to_string(),
        };

        if consumer.is_empty() {
            return Err(invalid("consumer is empty"));
        }
        if consumer.contains(':') {
            return Err(invalid("consumer contains ':'"));
        }
        if queue.is_empty() {
            return Err(invalid("queue is empty"));
        }

        Ok(Self { consumer, queue })
    }

    /// Parses a rendered `consumer:queue` name.
    pub fn parse(name: &str) -> Result<Self, GroupError> {
        match name.split_once(':') {
            Some((consumer, queue)) => Self::new(consumer, queue),
            None => Err(GroupError::InvalidGroupName {
                name: name.to_string(),
                reason: "expected 'consumer:queue'".to_string(),
            }),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.consumer, self.queue)
    }
}

impl FromStr for GroupName {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
