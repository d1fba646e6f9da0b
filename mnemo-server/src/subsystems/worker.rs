use async_trait::async_trait;
use mnemo_core::models::{DistillationPayload, WorkerTask};
use serde_json::Value;
use std::sync::Arc;

use super::distill::DistillationProcessor;
use super::pool::{TaskDispatcher, TaskError};

/// Task name for conversation distillation.
pub const DISTILL_TASK: &str = "distill_conversation";

/// The dispatcher installed in every worker unit.
#[derive(Clone)]
pub struct DistillationWorker {
    processor: Arc<DistillationProcessor>,
}

impl DistillationWorker {
    pub fn new(processor: Arc<DistillationProcessor>) -> Self {
        Self { processor }
    }
}

impl Default for DistillationWorker {
    fn default() -> Self {
        Self::new(Arc::new(DistillationProcessor::new()))
    }
}

#[async_trait]
impl TaskDispatcher for DistillationWorker {
    async fn dispatch(&self, task: WorkerTask) -> Result<Value, TaskError> {
        match task.task_name.as_str() {
            DISTILL_TASK => {
                let payload: DistillationPayload = serde_json::from_value(task.data)
                    .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
                let result = self.processor.process(payload).await;
                serde_json::to_value(result).map_err(|e| TaskError::Failed(e.to_string()))
            }
            other => Err(TaskError::UnknownTask(other.to_string())),
        }
    }
}
