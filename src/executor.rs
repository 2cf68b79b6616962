// src/executor.rs
//
// =============================================================================
// LABFLOW: TASK SUPERVISOR
// =============================================================================
//
// The Execution Engine.
//
// Responsibilities:
// 1. Promote tasks along the lifecycle: PENDING -> READY once every upstream
//    task completed, READY -> RUNNING at dispatch.
// 2. Run each RUNNING task on its own supervised tokio task.
// 3. Forced termination: CANCELLING marks the intent, the execution unit is
//    aborted at its next await point, then a finalizer stops held hardware
//    and returns every resource. The executor and the finalizer race to the
//    terminal status through CAS, so exactly one outcome wins.
//
// Every transition is a conditional update in the store; a tick that loses a
// race simply skips that task.

use crate::context::TaskContext;
use crate::coordinator::ResourceCoordinator;
use crate::core::{TaskRecord, TaskStatus};
use crate::devices::DeviceBoard;
use crate::errors::{LabError, Result};
use crate::input::InputGateway;
use crate::registry::{LabRegistry, TaskSpec};
use crate::store::LabStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a cancelled task gets to unwind cooperatively before the hard
/// abort. All context operations observe the flag well within this window.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

struct RunningTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    ctx: Arc<TaskContext>,
}

pub struct TaskSupervisor {
    store: LabStore,
    registry: Arc<LabRegistry>,
    coordinator: ResourceCoordinator,
    devices: DeviceBoard,
    input: InputGateway,
    running: Mutex<HashMap<Uuid, RunningTask>>,
}

impl TaskSupervisor {
    pub fn new(store: LabStore, registry: Arc<LabRegistry>) -> Self {
        Self {
            coordinator: ResourceCoordinator::new(store.clone()),
            devices: DeviceBoard::new(store.clone()),
            input: InputGateway::new(store.clone()),
            store,
            registry,
            running: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // SCHEDULER TICK
    // -------------------------------------------------------------------------

    /// One scheduling pass. Called periodically by the lab's main loop; safe
    /// to call from a single place only (dispatch assumes one scheduler).
    pub async fn tick(&self) -> Result<()> {
        self.reap_finished();
        self.honor_cancellations().await?;
        self.promote_pending()?;
        self.dispatch_ready()?;
        Ok(())
    }

    /// Act on CANCELLING markers set out-of-process (the CLI writes the
    /// marker; only the process holding the execution unit can do the kill).
    async fn honor_cancellations(&self) -> Result<()> {
        for task in self.store.tasks_with_status(TaskStatus::Cancelling)? {
            let entry = self.running.lock().unwrap().remove(&task.id);
            if let Some(entry) = entry {
                self.terminate_running(task.id, entry).await;
            }
        }
        Ok(())
    }

    /// PENDING -> READY once every upstream completed. An upstream that ended
    /// in ERROR or CANCELLED drags its downstream straight to CANCELLED, so
    /// an experiment can never wait on a task that will not run.
    fn promote_pending(&self) -> Result<()> {
        for task in self.store.tasks_with_status(TaskStatus::Pending)? {
            let mut all_done = true;
            let mut dead_upstream = false;
            for prev in &task.prev_tasks {
                match self.store.task_status(*prev)? {
                    TaskStatus::Completed => {}
                    TaskStatus::Error | TaskStatus::Cancelled => {
                        dead_upstream = true;
                        break;
                    }
                    _ => {
                        all_done = false;
                        break;
                    }
                }
            }
            if dead_upstream {
                if self
                    .store
                    .cas_task_status(task.id, &[TaskStatus::Pending], TaskStatus::Cancelled)?
                {
                    self.store
                        .set_task_message(task.id, "not run: an upstream task did not complete")?;
                    log::info!("task {} cancelled, upstream did not complete", task.id);
                }
            } else if all_done {
                self.store
                    .cas_task_status(task.id, &[TaskStatus::Pending], TaskStatus::Ready)?;
            }
        }
        Ok(())
    }

    fn dispatch_ready(&self) -> Result<()> {
        for task in self.store.tasks_with_status(TaskStatus::Ready)? {
            if !self
                .store
                .cas_task_status(task.id, &[TaskStatus::Ready], TaskStatus::Running)?
            {
                continue;
            }
            log::info!("dispatching task {} ({})", task.id, task.type_name);
            self.spawn(task);
        }
        Ok(())
    }

    fn reap_finished(&self) {
        let mut running = self.running.lock().unwrap();
        running.retain(|_, t| !t.handle.is_finished());
    }

    pub fn running_count(&self) -> usize {
        let running = self.running.lock().unwrap();
        running.len()
    }

    // -------------------------------------------------------------------------
    // EXECUTION
    // -------------------------------------------------------------------------

    fn spawn(&self, record: TaskRecord) {
        let task_id = record.id;
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(TaskContext::new(
            record.id,
            record.experiment_id,
            self.store.clone(),
            cancel.clone(),
        ));

        let store = self.store.clone();
        let registry = self.registry.clone();
        let coordinator = self.coordinator.clone();
        let exec_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let spec = TaskSpec {
                task_id: record.id,
                experiment_id: record.experiment_id,
                parameters: record.parameters.clone(),
                samples: record.samples.clone(),
            };
            let outcome = match registry.build_task(&record.type_name, &spec) {
                Ok(behavior) => behavior.run(&exec_ctx).await,
                Err(e) => Err(e),
            };
            finish(&store, &coordinator, record.id, outcome);
        });

        let mut running = self.running.lock().unwrap();
        running.insert(task_id, RunningTask { cancel, handle, ctx });
    }

    // -------------------------------------------------------------------------
    // FORCED TERMINATION
    // -------------------------------------------------------------------------

    /// Cancel a task in any state. Queued tasks are cancelled in place; a
    /// running task is flagged, given a short grace period, then aborted at
    /// its next await point and finalized (hardware stopped, resources
    /// returned). Cancelling an already-terminal task is a no-op.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        if self.store.cas_task_status(
            task_id,
            &[TaskStatus::Pending, TaskStatus::Ready],
            TaskStatus::Cancelled,
        )? {
            log::info!("task {task_id} cancelled before dispatch");
            return Ok(());
        }

        let status = self.store.task_status(task_id)?;
        if status.is_terminal() {
            return Ok(());
        }
        if !self.store.cas_task_status(
            task_id,
            &[TaskStatus::Running, TaskStatus::RequestingResources],
            TaskStatus::Cancelling,
        )? {
            // lost a race against completion or a concurrent cancel
            return Ok(());
        }

        let entry = self.running.lock().unwrap().remove(&task_id);
        match entry {
            Some(entry) => self.terminate_running(task_id, entry).await,
            // no execution unit (e.g. marked RUNNING by a previous process);
            // just finalize the record
            None => self.finalize_cancelled(task_id, None).await,
        }
        Ok(())
    }

    async fn terminate_running(&self, task_id: Uuid, entry: RunningTask) {
        log::warn!("forcibly terminating task {task_id}");
        entry.cancel.store(true, Ordering::SeqCst);
        let mut handle = entry.handle;
        if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
            // the grace period is over; kill it at its current await point
            handle.abort();
            let _ = handle.await;
        }
        self.finalize_cancelled(task_id, Some(entry.ctx)).await;
    }

    /// After the kill: run the behavior's registered teardown, bring held
    /// hardware to a safe stop, return every resource, close dangling input
    /// requests, and settle the terminal status.
    async fn finalize_cancelled(&self, task_id: Uuid, ctx: Option<Arc<TaskContext>>) {
        if let Some(ctx) = ctx {
            if let Some(hook) = ctx.take_cleanup() {
                hook().await;
            }
        }
        match self.devices.held_by(task_id) {
            Ok(names) => {
                for name in names {
                    if let Some(driver) = self.registry.device(&name) {
                        if let Err(e) = driver.emergency_stop().await {
                            log::error!("emergency stop of {name} failed: {e}");
                        }
                    }
                }
            }
            Err(e) => log::error!("could not list devices of task {task_id}: {e}"),
        }
        if let Err(e) = self.coordinator.release_all(task_id) {
            log::error!("could not release resources of task {task_id}: {e}");
        }
        if let Err(e) = self.input.cancel_for_task(task_id) {
            log::error!("could not close input requests of task {task_id}: {e}");
        }
        // the executor may have settled the status first; that result stands
        match self
            .store
            .cas_task_status(task_id, &[TaskStatus::Cancelling], TaskStatus::Cancelled)
        {
            Ok(true) => log::info!("task {task_id} cancelled"),
            Ok(false) => {}
            Err(e) => log::error!("could not settle status of task {task_id}: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // CRASH RECOVERY
    // -------------------------------------------------------------------------

    /// Settle tasks a previous process left mid-flight. Their execution units
    /// are gone, so the records go to a terminal state and their resources
    /// come back.
    pub fn recover_orphans(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [
            TaskStatus::Running,
            TaskStatus::RequestingResources,
            TaskStatus::Cancelling,
        ] {
            for task in self.store.tasks_with_status(status)? {
                let to = if status == TaskStatus::Cancelling {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Error
                };
                if self.store.cas_task_status(task.id, &[status], to)? {
                    self.store
                        .set_task_message(task.id, "interrupted by a controller restart")?;
                    self.coordinator.release_all(task.id)?;
                    self.input.cancel_for_task(task.id)?;
                    log::warn!("recovered orphaned task {} as {}", task.id, to.as_str());
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}

/// Settle the executor-side outcome of a behavior run.
fn finish(
    store: &LabStore,
    coordinator: &ResourceCoordinator,
    task_id: Uuid,
    outcome: Result<serde_json::Value>,
) {
    let settle = |from: &[TaskStatus], to: TaskStatus| -> bool {
        match store.cas_task_status(task_id, from, to) {
            Ok(applied) => applied,
            Err(e) => {
                log::error!("could not settle status of task {task_id}: {e}");
                false
            }
        }
    };
    match outcome {
        Ok(result) => {
            if let Err(e) = store.set_task_result(task_id, &result) {
                log::error!("could not store result of task {task_id}: {e}");
            }
            if settle(
                &[TaskStatus::Running, TaskStatus::RequestingResources],
                TaskStatus::Completed,
            ) {
                log::info!("task {task_id} completed");
            } else {
                // a cancellation landed between the last await and here
                settle(&[TaskStatus::Cancelling], TaskStatus::Cancelled);
            }
        }
        Err(LabError::Cancelled) => {
            settle(
                &[
                    TaskStatus::Running,
                    TaskStatus::RequestingResources,
                    TaskStatus::Cancelling,
                ],
                TaskStatus::Cancelled,
            );
            log::info!("task {task_id} unwound after cancellation");
        }
        Err(e) => {
            if let Err(err) = store.set_task_message(task_id, &e.to_string()) {
                log::error!("could not store error of task {task_id}: {err}");
            }
            if settle(
                &[TaskStatus::Running, TaskStatus::RequestingResources],
                TaskStatus::Error,
            ) {
                log::error!("task {task_id} failed: {e}");
            } else {
                settle(&[TaskStatus::Cancelling], TaskStatus::Cancelled);
            }
        }
    }
    // behaviors release through Reservation; this catches panicky paths
    if let Err(e) = coordinator.release_all(task_id) {
        log::error!("could not release resources of task {task_id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SamplePositionDef, TaskRecord};
    use crate::coordinator::{PositionSpec, Requirement, ResourceRequest};
    use crate::registry::TaskBehavior;
    use crate::samples::SampleBoard;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    struct Instant;

    #[async_trait]
    impl TaskBehavior for Instant {
        async fn run(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
            Ok(json!({"ok": true}))
        }
    }

    struct HoldRackForever;

    #[async_trait]
    impl TaskBehavior for HoldRackForever {
        async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
            let request = ResourceRequest::new().require(
                Requirement::positions_only()
                    .with_position(PositionSpec::names(["transfer_rack"])),
            );
            let _held = ctx.acquire(&request).await?;
            loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    struct HoldRackWithTeardown {
        torn_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskBehavior for HoldRackWithTeardown {
        async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
            let torn_down = self.torn_down.clone();
            ctx.on_cleanup(Box::new(move || {
                Box::pin(async move {
                    torn_down.store(true, Ordering::SeqCst);
                })
            }));
            let request = ResourceRequest::new().require(
                Requirement::positions_only()
                    .with_position(PositionSpec::names(["transfer_rack"])),
            );
            let _held = ctx.acquire(&request).await?;
            loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn harness() -> (tempfile::TempDir, LabStore, TaskSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        SampleBoard::new(store.clone())
            .add_positions(&[SamplePositionDef::new("transfer_rack", 1, "")])
            .unwrap();

        let mut registry = LabRegistry::new();
        registry
            .register_task_type("Instant", Box::new(|_| Ok(Box::new(Instant))))
            .unwrap();
        registry
            .register_task_type("HoldRack", Box::new(|_| Ok(Box::new(HoldRackForever))))
            .unwrap();
        let supervisor = TaskSupervisor::new(store.clone(), Arc::new(registry));
        (dir, store, supervisor)
    }

    fn insert_task(store: &LabStore, type_name: &str, prev: Vec<Uuid>) -> Uuid {
        let task = TaskRecord {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            type_name: type_name.into(),
            parameters: json!({}),
            samples: HashMap::new(),
            status: TaskStatus::Pending,
            prev_tasks: prev,
            next_tasks: vec![],
            message: String::new(),
            result: None,
            last_updated: Utc::now(),
        };
        store.insert_task(&task).unwrap();
        task.id
    }

    async fn wait_for(store: &LabStore, id: Uuid, status: TaskStatus) {
        for _ in 0..200 {
            if store.task_status(id).unwrap() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task never reached {}, stuck at {}",
            status.as_str(),
            store.task_status(id).unwrap().as_str()
        );
    }

    #[tokio::test]
    async fn chain_runs_in_dependency_order() {
        let (_dir, store, supervisor) = harness();
        let first = insert_task(&store, "Instant", vec![]);
        let second = insert_task(&store, "Instant", vec![first]);

        // second is not promoted while first is unfinished
        supervisor.tick().await.unwrap();
        assert_eq!(store.task_status(second).unwrap(), TaskStatus::Pending);

        wait_for(&store, first, TaskStatus::Completed).await;
        supervisor.tick().await.unwrap();
        supervisor.tick().await.unwrap();
        wait_for(&store, second, TaskStatus::Completed).await;

        let result = store.get_task(first).unwrap().result.unwrap();
        assert_eq!(result["ok"], json!(true));
    }

    #[tokio::test]
    async fn join_waits_for_every_upstream() {
        let (_dir, store, supervisor) = harness();
        let left = insert_task(&store, "Instant", vec![]);
        let right = insert_task(&store, "Instant", vec![]);
        let join = insert_task(&store, "Instant", vec![left, right]);

        store
            .cas_task_status(left, &[TaskStatus::Pending], TaskStatus::Completed)
            .unwrap();
        supervisor.tick().await.unwrap();
        // one upstream still live: the join stays queued
        assert_eq!(store.task_status(join).unwrap(), TaskStatus::Pending);

        wait_for(&store, right, TaskStatus::Completed).await;
        supervisor.tick().await.unwrap();
        supervisor.tick().await.unwrap();
        wait_for(&store, join, TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn forced_termination_returns_resources() {
        let (_dir, store, supervisor) = harness();
        let holder = insert_task(&store, "HoldRack", vec![]);
        supervisor.tick().await.unwrap();
        wait_for(&store, holder, TaskStatus::Running).await;

        // give it time to actually take the rack
        for _ in 0..100 {
            if !SampleBoard::new(store.clone())
                .slots_held_by(holder)
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        supervisor.cancel_task(holder).await.unwrap();
        assert_eq!(store.task_status(holder).unwrap(), TaskStatus::Cancelled);
        assert!(SampleBoard::new(store.clone())
            .slots_held_by(holder)
            .unwrap()
            .is_empty());

        // cancelling again is harmless
        supervisor.cancel_task(holder).await.unwrap();
    }

    #[tokio::test]
    async fn forced_termination_runs_the_registered_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        SampleBoard::new(store.clone())
            .add_positions(&[SamplePositionDef::new("transfer_rack", 1, "")])
            .unwrap();

        let torn_down = Arc::new(AtomicBool::new(false));
        let mut registry = LabRegistry::new();
        {
            let torn_down = torn_down.clone();
            registry
                .register_task_type(
                    "Teardown",
                    Box::new(move |_| {
                        Ok(Box::new(HoldRackWithTeardown {
                            torn_down: torn_down.clone(),
                        }))
                    }),
                )
                .unwrap();
        }
        let supervisor = TaskSupervisor::new(store.clone(), Arc::new(registry));

        let holder = insert_task(&store, "Teardown", vec![]);
        supervisor.tick().await.unwrap();
        wait_for(&store, holder, TaskStatus::Running).await;
        // the hook is registered before the rack is taken, so holding the
        // rack means the teardown is in place
        for _ in 0..100 {
            if !SampleBoard::new(store.clone())
                .slots_held_by(holder)
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        supervisor.cancel_task(holder).await.unwrap();
        assert!(torn_down.load(Ordering::SeqCst));
        assert_eq!(store.task_status(holder).unwrap(), TaskStatus::Cancelled);
        assert!(SampleBoard::new(store)
            .slots_held_by(holder)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancel_before_dispatch_skips_execution() {
        let (_dir, store, supervisor) = harness();
        let queued = insert_task(&store, "Instant", vec![]);
        supervisor.cancel_task(queued).await.unwrap();
        assert_eq!(store.task_status(queued).unwrap(), TaskStatus::Cancelled);

        supervisor.tick().await.unwrap();
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn downstream_of_dead_upstream_is_cancelled() {
        let (_dir, store, supervisor) = harness();
        let first = insert_task(&store, "Instant", vec![]);
        let second = insert_task(&store, "Instant", vec![first]);
        supervisor.cancel_task(first).await.unwrap();

        supervisor.tick().await.unwrap();
        assert_eq!(store.task_status(second).unwrap(), TaskStatus::Cancelled);
        let message = store.get_task(second).unwrap().message;
        assert!(message.contains("upstream"));
    }

    #[tokio::test]
    async fn tick_honors_externally_set_cancel_marker() {
        let (_dir, store, supervisor) = harness();
        let holder = insert_task(&store, "HoldRack", vec![]);
        supervisor.tick().await.unwrap();
        wait_for(&store, holder, TaskStatus::Running).await;

        // what the CLI does from another process: mark, don't kill
        assert!(store
            .cas_task_status(holder, &[TaskStatus::Running], TaskStatus::Cancelling)
            .unwrap());
        supervisor.tick().await.unwrap();
        assert_eq!(store.task_status(holder).unwrap(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn orphan_recovery_settles_stale_records() {
        let (_dir, store, supervisor) = harness();
        let orphan = insert_task(&store, "Instant", vec![]);
        store
            .cas_task_status(orphan, &[TaskStatus::Pending], TaskStatus::Running)
            .unwrap();

        assert_eq!(supervisor.recover_orphans().unwrap(), 1);
        assert_eq!(store.task_status(orphan).unwrap(), TaskStatus::Error);
    }
}
