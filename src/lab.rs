// src/lab.rs
//
// =============================================================================
// LABFLOW: LAB FACADE
// =============================================================================
//
// Wires the store, registry, experiment manager and task supervisor together
// and runs the control loop. Everything the CLI (or an embedding program)
// does goes through this type.
//
// One process runs the loop; other processes talk to the same database for
// submissions, status and cancellation markers.

use crate::core::{DeviceRecord, ExperimentRecord, InputRequest, SampleRecord, TaskRecord, TaskStatus};
use crate::devices::DeviceBoard;
use crate::errors::Result;
use crate::experiments::ExperimentManager;
use crate::executor::TaskSupervisor;
use crate::input::InputGateway;
use crate::registry::LabRegistry;
use crate::samples::SampleBoard;
use crate::store::LabStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LabConfig {
    pub db_path: PathBuf,
    pub tick_interval: Duration,
}

impl LabConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Everything an operator wants on one screen.
#[derive(Debug, Serialize)]
pub struct LabSnapshot {
    pub devices: Vec<DeviceRecord>,
    pub experiments: Vec<ExperimentRecord>,
    pub tasks: Vec<TaskRecord>,
    pub samples: Vec<SampleRecord>,
    pub pending_requests: Vec<InputRequest>,
}

pub struct Lab {
    store: LabStore,
    registry: Arc<LabRegistry>,
    supervisor: TaskSupervisor,
    experiments: ExperimentManager,
    devices: DeviceBoard,
    samples: SampleBoard,
    input: InputGateway,
    tick_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Lab {
    pub fn open(config: LabConfig, registry: LabRegistry) -> Result<Self> {
        let store = LabStore::open(&config.db_path)?;
        let registry = Arc::new(registry);
        Ok(Self {
            supervisor: TaskSupervisor::new(store.clone(), registry.clone()),
            experiments: ExperimentManager::new(store.clone()),
            devices: DeviceBoard::new(store.clone()),
            samples: SampleBoard::new(store.clone()),
            input: InputGateway::new(store.clone()),
            store,
            registry,
            tick_interval: config.tick_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// First-time provisioning: write every registered device and sample
    /// position into the database. Refuses to overwrite existing devices.
    pub fn setup(&self) -> Result<()> {
        self.devices.add_registered_devices(&self.registry)?;
        self.samples.add_positions(&self.registry.all_positions())?;
        log::info!(
            "lab provisioned with {} device(s) and {} position(s)",
            self.registry.devices().count(),
            self.registry.all_positions().len()
        );
        Ok(())
    }

    /// Set when the loop should wind down (e.g. from a ctrl-c handler).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// The control loop: seed device statuses, settle what a previous process
    /// left behind, then compile / schedule / close out until shutdown.
    pub async fn run(&self) -> Result<()> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".into());
        log::info!("lab controller starting on {host}");

        self.devices.sync_statuses(&self.registry).await?;
        let orphans = self.supervisor.recover_orphans()?;
        if orphans > 0 {
            log::warn!("settled {orphans} task(s) from a previous run");
        }

        // a store error fails that pass only; the loop retries next tick
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.experiments.compile_pending() {
                log::error!("experiment compile pass failed: {e}");
            }
            if let Err(e) = self.supervisor.tick().await {
                log::error!("scheduler tick failed: {e}");
            }
            if let Err(e) = self.experiments.sweep_completed() {
                log::error!("experiment close-out pass failed: {e}");
            }
            tokio::time::sleep(self.tick_interval).await;
        }
        log::info!("lab controller stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // OPERATOR API
    // -------------------------------------------------------------------------

    pub fn submit_experiment(&self, submission: crate::core::ExperimentSubmission) -> Result<Uuid> {
        self.experiments.submit(&self.registry, submission)
    }

    pub fn experiment(&self, id: Uuid) -> Result<ExperimentRecord> {
        self.experiments.get(id)
    }

    /// Record a cancellation marker. Queued tasks cancel on the spot; for a
    /// running task the marker is honored by the process that owns the
    /// execution unit (its next scheduler pass does the kill).
    pub fn request_task_cancellation(&self, task_id: Uuid) -> Result<()> {
        if self.store.cas_task_status(
            task_id,
            &[TaskStatus::Pending, TaskStatus::Ready],
            TaskStatus::Cancelled,
        )? {
            return Ok(());
        }
        if self.store.cas_task_status(
            task_id,
            &[TaskStatus::Running, TaskStatus::RequestingResources],
            TaskStatus::Cancelling,
        )? {
            return Ok(());
        }
        // terminal or mid-cancel already; a missing task still errors
        let status = self.store.task_status(task_id)?;
        log::info!("task {task_id} is {}, nothing to cancel", status.as_str());
        Ok(())
    }

    /// Cancel every non-terminal task of an experiment. The close-out sweep
    /// then settles the experiment itself.
    pub fn request_experiment_cancellation(&self, experiment_id: Uuid) -> Result<()> {
        for task_id in self.experiments.task_ids(experiment_id)? {
            self.request_task_cancellation(task_id)?;
        }
        Ok(())
    }

    /// In-process cancellation, kill included.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        self.supervisor.cancel_task(task_id).await
    }

    pub fn pause_device(&self, name: &str) -> Result<()> {
        self.devices.request_pause(name)
    }

    pub fn resume_device(&self, name: &str) -> Result<()> {
        self.devices.release_pause(name)
    }

    pub fn pending_requests(&self) -> Result<Vec<InputRequest>> {
        self.input.pending()
    }

    pub fn respond(&self, request_id: Uuid, response: &str) -> Result<()> {
        self.input.submit_response(request_id, response)
    }

    pub fn snapshot(&self) -> Result<LabSnapshot> {
        Ok(LabSnapshot {
            devices: self.devices.list()?,
            experiments: self.store.all_experiments()?,
            tasks: self.store.all_tasks()?,
            samples: self.store.all_samples()?,
            pending_requests: self.input.pending()?,
        })
    }
}
