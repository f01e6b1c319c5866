//! Events passed from the health monitor to the requeue consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A worker was force-restarted; its in-flight jobs must be requeued.
    WorkerRestarted {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
}

impl WorkerEvent {
    pub fn restarted(worker_id: WorkerId) -> Self {
        Self::WorkerRestarted {
            worker_id,
            at: Utc::now(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        match self {
            WorkerEvent::WorkerRestarted { worker_id, .. } => worker_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = WorkerEvent::restarted(WorkerId::from("gpu-1"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "worker_restarted");
        assert_eq!(value["worker_id"], "gpu-1");
        assert_eq!(event.worker_id().as_str(), "gpu-1");
    }
}
