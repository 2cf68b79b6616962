// src/context.rs
//
// =============================================================================
// LABFLOW: TASK CONTEXT
// =============================================================================
//
// The capability handle passed to a running task behavior. Everything a task
// does to the lab (reserve resources, move samples, ask an operator, report
// progress) goes through here, which is what lets the supervisor make every
// blocking point a cancellation point.

use crate::coordinator::{Reservation, ResourceCoordinator, ResourceRequest};
use crate::core::{RequestContext, SampleRecord, TaskStatus};
use crate::errors::{LabError, Result};
use crate::input::InputGateway;
use crate::samples::SampleBoard;
use crate::store::LabStore;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Best-effort teardown a behavior can register for the forced-termination
/// path (e.g. "command the furnace to a safe setpoint"). Runs at most once.
pub type CleanupHook = Box<dyn FnOnce() -> CleanupFuture + Send>;

pub struct TaskContext {
    task_id: Uuid,
    experiment_id: Uuid,
    store: LabStore,
    coordinator: ResourceCoordinator,
    samples: SampleBoard,
    input: InputGateway,
    cancel: Arc<AtomicBool>,
    cleanup: Mutex<Option<CleanupHook>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: Uuid,
        experiment_id: Uuid,
        store: LabStore,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            experiment_id,
            coordinator: ResourceCoordinator::new(store.clone()),
            samples: SampleBoard::new(store.clone()),
            input: InputGateway::new(store.clone()),
            store,
            cancel,
            cleanup: Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn experiment_id(&self) -> Uuid {
        self.experiment_id
    }

    /// Fail with `Cancelled` if a cancellation request has landed. Behaviors
    /// with long compute loops call this between iterations; every other
    /// context method already checks it.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(LabError::Cancelled);
        }
        Ok(())
    }

    /// Reserve devices and sample positions, blocking until granted. While
    /// waiting, the task is surfaced as REQUESTING_RESOURCES so an operator
    /// can tell "queued on hardware" from "running on hardware".
    pub async fn acquire(&self, request: &ResourceRequest) -> Result<Reservation> {
        self.checkpoint()?;
        self.store.cas_task_status(
            self.task_id,
            &[TaskStatus::Running],
            TaskStatus::RequestingResources,
        )?;
        let acquired = self
            .coordinator
            .acquire(self.task_id, request, &self.cancel)
            .await;
        self.store.cas_task_status(
            self.task_id,
            &[TaskStatus::RequestingResources],
            TaskStatus::Running,
        )?;
        acquired
    }

    /// Post a prompt to the operator queue and block for the answer.
    pub async fn ask_operator(
        &self,
        prompt: impl Into<String>,
        options: Vec<String>,
    ) -> Result<String> {
        self.checkpoint()?;
        self.input
            .ask(
                prompt,
                options,
                RequestContext::Task {
                    task_id: self.task_id,
                    experiment_id: self.experiment_id,
                },
                &self.cancel,
            )
            .await
    }

    /// Record a sample's new location. The destination slot must be held by
    /// this task's reservation.
    pub fn move_sample(&self, sample_id: Uuid, destination: &str) -> Result<()> {
        self.checkpoint()?;
        self.samples.move_sample(self.task_id, sample_id, destination)
    }

    /// Mark a sample as taken off-lab.
    pub fn remove_sample(&self, sample_id: Uuid) -> Result<()> {
        self.checkpoint()?;
        self.samples.remove_sample_from_lab(sample_id)
    }

    pub fn sample(&self, sample_id: Uuid) -> Result<SampleRecord> {
        self.store.get_sample(sample_id)
    }

    /// Operator-facing progress line ("ramping to 600C, 45 min left").
    pub fn set_message(&self, message: &str) -> Result<()> {
        self.store.set_task_message(self.task_id, message)
    }

    /// Attach partial results as they come in; the behavior's return value
    /// overwrites this on normal completion.
    pub fn report_result(&self, result: &Value) -> Result<()> {
        self.store.set_task_result(self.task_id, result)
    }

    /// Register the teardown to run if this task is forcibly terminated.
    /// A later registration replaces an earlier one.
    pub fn on_cleanup(&self, hook: CleanupHook) {
        *self.cleanup.lock().unwrap() = Some(hook);
    }

    pub(crate) fn take_cleanup(&self) -> Option<CleanupHook> {
        self.cleanup.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{PositionSpec, Requirement};
    use crate::core::{SamplePositionDef, TaskRecord};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn running_task(store: &LabStore) -> TaskRecord {
        let task = TaskRecord {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            type_name: "Moving".into(),
            parameters: json!({}),
            samples: HashMap::new(),
            status: TaskStatus::Running,
            prev_tasks: vec![],
            next_tasks: vec![],
            message: String::new(),
            result: None,
            last_updated: Utc::now(),
        };
        store.insert_task(&task).unwrap();
        task
    }

    #[tokio::test]
    async fn acquire_round_trips_the_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        SampleBoard::new(store.clone())
            .add_positions(&[SamplePositionDef::new("transfer_rack", 1, "")])
            .unwrap();
        let task = running_task(&store);

        let ctx = TaskContext::new(
            task.id,
            task.experiment_id,
            store.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let request = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::names(["transfer_rack"])),
        );
        let mut reservation = ctx.acquire(&request).await.unwrap();
        // back to RUNNING once the grant is in hand
        assert_eq!(store.task_status(task.id).unwrap(), TaskStatus::Running);
        reservation.release().unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_refuses_further_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let task = running_task(&store);

        let cancel = Arc::new(AtomicBool::new(true));
        let ctx = TaskContext::new(task.id, task.experiment_id, store, cancel);
        assert!(matches!(ctx.checkpoint(), Err(LabError::Cancelled)));
        assert!(matches!(
            ctx.acquire(&ResourceRequest::new()).await,
            Err(LabError::Cancelled)
        ));
    }
}
