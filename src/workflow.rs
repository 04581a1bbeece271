//! Downstream workflow triggered by the ingestion listener.

use crate::notify::{Notification, Notifier};
use crate::state::UserId;
use async_trait::async_trait;
use std::sync::Arc;

/// Failure while handling an otherwise valid trigger.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A collaborator of the workflow failed.
    #[error("downstream failure: {0:#}")]
    Downstream(#[from] anyhow::Error),
    /// The workflow panicked.
    #[error("workflow panicked: {0}")]
    Panicked(String),
}

/// Workflow contract: invoked once per valid trigger request.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn trigger(&self, user_id: UserId, submission_id: i64) -> Result<(), WorkflowError>;
}

/// Announces received submissions through the notifier.
#[derive(Clone)]
pub struct SubmissionWorkflow {
    notifier: Arc<dyn Notifier>,
}

impl SubmissionWorkflow {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Workflow for SubmissionWorkflow {
    async fn trigger(&self, user_id: UserId, submission_id: i64) -> Result<(), WorkflowError> {
        tracing::info!(user_id, submission_id, "processing submission");
        self.notifier
            .notify(&Notification::SubmissionReceived {
                user_id,
                submission_id,
            })
            .await?;
        Ok(())
    }
}
