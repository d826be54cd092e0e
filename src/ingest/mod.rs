//! Ingestion: deciding whether a submission is grouped or passed through.
//!
//! Producers hand every job submission to the [`Interceptor`]. Submissions for
//! consumers configured for grouping are diverted into their group; everything
//! else goes straight to the host queue. A chunk released by a flush carries
//! a leading `true` marker so it passes through on its way back in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::GroupError;
use crate::grouping::Grouping;

/// A job submission on its way to the host queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Consumer that will process the job.
    pub consumer: String,
    pub queue: String,
    pub args: Vec<Value>,
    /// Set when the host is retrying a job that failed before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(consumer: impl Into<String>, queue: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            consumer: consumer.into(),
            queue: queue.into(),
            args,
            failed_at: None,
        }
    }

    pub fn with_failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn is_retry(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Whether the arguments start with the grouped-chunk marker.
    pub fn is_released_chunk(&self) -> bool {
        matches!(self.args.first(), Some(Value::Bool(true)))
    }
}

/// What became of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Intercepted {
    /// Enqueue this submission on the host queue as is.
    Dispatch(Submission),
    /// The submission was merged into its group; `added` messages were appended.
    Grouped { added: usize },
}

/// Routes submissions into groups.
#[derive(Debug, Clone)]
pub struct Interceptor {
    grouping: Grouping,
}

impl Interceptor {
    pub fn new(grouping: Grouping) -> Self {
        Self { grouping }
    }

    pub async fn intercept(&self, mut submission: Submission) -> Result<Intercepted, GroupError> {
        let settings = self.grouping.consumers().settings_for(&submission.consumer);
        if !settings.is_grouped() {
            return Ok(Intercepted::Dispatch(submission));
        }

        if submission.is_released_chunk() {
            submission.args.remove(0);
            return Ok(Intercepted::Dispatch(submission));
        }

        if submission.is_retry() {
            debug!(
                consumer = %submission.consumer,
                queue = %submission.queue,
                "Retry bypasses grouping"
            );
            return Ok(Intercepted::Dispatch(submission));
        }

        let group = self
            .grouping
            .group(&submission.consumer, &submission.queue)?;

        let added = if settings.bulk_merge {
            group.add_bulk(&submission.args).await?
        } else {
            usize::from(group.add(&Value::Array(submission.args)).await?)
        };

        Ok(Intercepted::Grouped { added })
    }
}
