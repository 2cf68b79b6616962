// src/registry.rs
//
// =============================================================================
// LABFLOW: PLUGIN REGISTRY
// =============================================================================
//
// The Hexagonal Ports.
//
// Responsibilities:
// 1. Define the `DeviceDriver` trait (hardware contract).
// 2. Define the `TaskBehavior` trait (experiment step contract).
// 3. Hold the explicit registry object built at startup and passed by Arc --
//    there is deliberately no process-wide implicit registration.
//
// Unknown task type names are rejected at experiment submission, never at
// execution time.

use crate::context::TaskContext;
use crate::core::SamplePositionDef;
use crate::errors::{LabError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// 1. DEVICE CONTRACT
// ============================================================================

/// Capability contract a concrete device integration must expose. The core
/// never talks to hardware directly; it only occupies/releases devices in the
/// store and calls these hooks at well-defined points.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Unique device name, e.g. "furnace_1".
    fn name(&self) -> &str;

    /// Device class used for type-based resource requests, e.g. "Furnace".
    fn type_name(&self) -> &str;

    fn description(&self) -> String {
        String::new()
    }

    /// Sample positions this device contributes. Names are relative; the
    /// registry prefixes them with `<device name>/` at bootstrap.
    fn sample_positions(&self) -> Vec<SamplePositionDef>;

    /// Whether the physical device is mid-run (used to seed status at boot).
    async fn is_running(&self) -> bool;

    /// Abort sequence invoked when a task holding this device is forcibly
    /// terminated. Must be safe to call at any point.
    async fn emergency_stop(&self) -> Result<()>;
}

// ============================================================================
// 2. TASK CONTRACT
// ============================================================================

/// Everything a task behavior gets to know about its own task record.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: Uuid,
    pub experiment_id: Uuid,
    pub parameters: Value,
    /// Role name -> sample id.
    pub samples: HashMap<String, Uuid>,
}

/// One registered task kind. `run` executes on a supervised execution unit and
/// may block for hours inside driver calls; every blocking point it reaches
/// through the context is an abort point for forced cancellation.
#[async_trait]
pub trait TaskBehavior: Send + Sync {
    /// Cheap input validation, called before dispatch. Default accepts.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value>;
}

pub type TaskConstructor =
    Box<dyn Fn(&TaskSpec) -> Result<Box<dyn TaskBehavior>> + Send + Sync>;

// ============================================================================
// 3. THE REGISTRY
// ============================================================================

/// Built once during startup configuration, then shared read-only.
#[derive(Default)]
pub struct LabRegistry {
    devices: HashMap<String, Arc<dyn DeviceDriver>>,
    task_types: HashMap<String, TaskConstructor>,
    standalone_positions: Vec<SamplePositionDef>,
}

impl LabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, driver: Arc<dyn DeviceDriver>) -> Result<()> {
        let name = driver.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(LabError::validation(format!(
                "duplicated device name: {name}"
            )));
        }
        self.devices.insert(name, driver);
        Ok(())
    }

    pub fn register_task_type(
        &mut self,
        type_name: impl Into<String>,
        constructor: TaskConstructor,
    ) -> Result<()> {
        let type_name = type_name.into();
        if self.task_types.contains_key(&type_name) {
            return Err(LabError::validation(format!(
                "duplicated task type: {type_name}"
            )));
        }
        self.task_types.insert(type_name, constructor);
        Ok(())
    }

    /// A sample-holding location not owned by any device (e.g. a transfer rack).
    pub fn register_standalone_position(&mut self, position: SamplePositionDef) {
        self.standalone_positions.push(position);
    }

    pub fn device(&self, name: &str) -> Option<&Arc<dyn DeviceDriver>> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn DeviceDriver>> {
        self.devices.values()
    }

    pub fn has_task_type(&self, type_name: &str) -> bool {
        self.task_types.contains_key(type_name)
    }

    pub fn build_task(&self, type_name: &str, spec: &TaskSpec) -> Result<Box<dyn TaskBehavior>> {
        let ctor = self.task_types.get(type_name).ok_or_else(|| {
            LabError::validation(format!("unknown task type: {type_name}"))
        })?;
        ctor(spec)
    }

    /// All sample positions of the lab: device-owned ones (prefixed with the
    /// device name) plus standalone ones.
    pub fn all_positions(&self) -> Vec<SamplePositionDef> {
        let mut out = Vec::new();
        for driver in self.devices.values() {
            for mut pos in driver.sample_positions() {
                pos.name = format!(
                    "{}{}{}",
                    driver.name(),
                    crate::core::POSITION_SEPARATOR,
                    pos.name
                );
                out.push(pos);
            }
        }
        out.extend(self.standalone_positions.iter().cloned());
        out
    }
}
