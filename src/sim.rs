// src/sim.rs
//
// =============================================================================
// LABFLOW: SIMULATED LAB
// =============================================================================
//
// A small virtual lab (two furnaces, one robot arm, a shared table) used for
// development, demos and the integration tests. Device calls log instead of
// touching hardware; heating time is compressed to milliseconds.

use crate::context::TaskContext;
use crate::core::{ExperimentSample, ExperimentSubmission, ExperimentTask, SamplePositionDef};
use crate::coordinator::{PositionSpec, Requirement, ResourceRequest};
use crate::errors::{LabError, Result};
use crate::registry::{DeviceDriver, LabRegistry, TaskBehavior, TaskSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// 1. DEVICES
// ============================================================================

pub struct SimulatedFurnace {
    name: String,
}

impl SimulatedFurnace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedFurnace {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &str {
        "Furnace"
    }

    fn description(&self) -> String {
        "simulated box furnace, max 1200C".into()
    }

    fn sample_positions(&self) -> Vec<SamplePositionDef> {
        vec![SamplePositionDef::new("inside", 4, "heating chamber")]
    }

    async fn is_running(&self) -> bool {
        false
    }

    async fn emergency_stop(&self) -> Result<()> {
        log::warn!("{}: heater off, venting", self.name);
        Ok(())
    }
}

pub struct SimulatedRobotArm {
    name: String,
}

impl SimulatedRobotArm {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedRobotArm {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &str {
        "RobotArm"
    }

    fn description(&self) -> String {
        "simulated 6-axis sample handler".into()
    }

    fn sample_positions(&self) -> Vec<SamplePositionDef> {
        vec![SamplePositionDef::new("gripper", 1, "in-transit hold")]
    }

    async fn is_running(&self) -> bool {
        false
    }

    async fn emergency_stop(&self) -> Result<()> {
        log::warn!("{}: halting motion", self.name);
        Ok(())
    }
}

// ============================================================================
// 2. TASK BEHAVIORS
// ============================================================================

fn default_hold_seconds() -> u64 {
    2
}

#[derive(Debug, Deserialize)]
struct HeatingParams {
    setpoint_c: f64,
    #[serde(default = "default_hold_seconds")]
    hold_seconds: u64,
}

/// Reserve any idle furnace, load this task's samples into its chamber and
/// hold at the setpoint. Samples stay in the furnace; a Moving task takes
/// them out.
struct Heating {
    spec: TaskSpec,
    params: HeatingParams,
}

#[async_trait]
impl TaskBehavior for Heating {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1200.0).contains(&self.params.setpoint_c) {
            return Err(LabError::validation(format!(
                "setpoint {}C is outside the furnace range 0..=1200C",
                self.params.setpoint_c
            )));
        }
        if self.spec.samples.is_empty() {
            return Err(LabError::validation("Heating needs at least one sample"));
        }
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let request = ResourceRequest::new().require(
            Requirement::device_of_type("Furnace")
                .with_position(PositionSpec::prefix("$/inside", self.spec.samples.len())),
        );
        let mut reservation = ctx.acquire(&request).await?;
        let furnace = reservation.grants[0]
            .device
            .clone()
            .unwrap_or_default();
        {
            let furnace = furnace.clone();
            ctx.on_cleanup(Box::new(move || {
                Box::pin(async move {
                    log::warn!("{furnace}: returning to safe setpoint after kill");
                })
            }));
        }

        let slots = reservation.grants[0].slots_for("$/inside").to_vec();
        for (sample_id, slot) in self.spec.samples.values().zip(&slots) {
            ctx.move_sample(*sample_id, slot)?;
        }

        ctx.set_message(&format!(
            "{furnace}: ramping to {}C",
            self.params.setpoint_c
        ))?;
        // one simulated "minute" per hold second
        for elapsed in 0..self.params.hold_seconds {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.set_message(&format!(
                "{furnace}: holding at {}C ({elapsed}/{} min)",
                self.params.setpoint_c, self.params.hold_seconds
            ))?;
        }

        reservation.release()?;
        Ok(json!({
            "furnace": furnace,
            "peak_temperature_c": self.params.setpoint_c,
            "hold_seconds": self.params.hold_seconds,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct MovingParams {
    destination: String,
}

/// Reserve the robot arm plus one free slot under the destination and move
/// the bound sample there.
struct Moving {
    spec: TaskSpec,
    params: MovingParams,
}

impl Moving {
    const SAMPLE_ROLE: &'static str = "sample";
}

#[async_trait]
impl TaskBehavior for Moving {
    fn validate(&self) -> Result<()> {
        if self.params.destination.trim().is_empty() {
            return Err(LabError::validation("Moving needs a destination"));
        }
        if !self.spec.samples.contains_key(Self::SAMPLE_ROLE) {
            return Err(LabError::validation(format!(
                "Moving needs a sample bound to role `{}`",
                Self::SAMPLE_ROLE
            )));
        }
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value> {
        let request = ResourceRequest::new()
            .require(Requirement::device_of_type("RobotArm"))
            .require(
                Requirement::positions_only()
                    .with_position(PositionSpec::prefix(self.params.destination.clone(), 1)),
            );
        let mut reservation = ctx.acquire(&request).await?;

        let arm = reservation.grants[0].device.clone().unwrap_or_default();
        let slot = reservation.grants[1].slots_for(&self.params.destination)[0].clone();
        let sample_id = self.spec.samples[Self::SAMPLE_ROLE];

        ctx.set_message(&format!("{arm}: moving sample to {slot}"))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.move_sample(sample_id, &slot)?;

        reservation.release()?;
        Ok(json!({ "moved_to": slot }))
    }
}

// ============================================================================
// 3. LAB ASSEMBLY
// ============================================================================

/// The registry of the simulated lab.
pub fn build_simulated_lab() -> Result<LabRegistry> {
    let mut registry = LabRegistry::new();
    registry.register_device(std::sync::Arc::new(SimulatedFurnace::new("furnace_1")))?;
    registry.register_device(std::sync::Arc::new(SimulatedFurnace::new("furnace_2")))?;
    registry.register_device(std::sync::Arc::new(SimulatedRobotArm::new("robot_arm_1")))?;
    registry.register_standalone_position(SamplePositionDef::new(
        "furnace_table",
        4,
        "staging table shared by both furnaces",
    ));

    registry.register_task_type(
        "Heating",
        Box::new(|spec| {
            let params: HeatingParams = serde_json::from_value(spec.parameters.clone())?;
            Ok(Box::new(Heating {
                spec: spec.clone(),
                params,
            }))
        }),
    )?;
    registry.register_task_type(
        "Moving",
        Box::new(|spec| {
            let params: MovingParams = serde_json::from_value(spec.parameters.clone())?;
            Ok(Box::new(Moving {
                spec: spec.clone(),
                params,
            }))
        }),
    )?;
    Ok(registry)
}

/// Heat one pellet, then park it on the shared table.
pub fn demo_experiment() -> ExperimentSubmission {
    ExperimentSubmission {
        name: "demo anneal".into(),
        tags: vec!["demo".into()],
        samples: vec![ExperimentSample {
            name: "pellet".into(),
            sample_id: None,
            tags: vec![],
            metadata: HashMap::new(),
        }],
        tasks: vec![
            ExperimentTask {
                type_name: "Heating".into(),
                parameters: json!({ "setpoint_c": 600.0, "hold_seconds": 2 }),
                samples: HashMap::from([("sample".to_string(), "pellet".to_string())]),
                next_tasks: vec![1],
                task_id: None,
            },
            ExperimentTask {
                type_name: "Moving".into(),
                parameters: json!({ "destination": "furnace_table" }),
                samples: HashMap::from([("sample".to_string(), "pellet".to_string())]),
                next_tasks: vec![],
                task_id: None,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_positions_are_prefixed() {
        let registry = build_simulated_lab().unwrap();
        let names: Vec<String> = registry
            .all_positions()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert!(names.contains(&"furnace_1/inside".to_string()));
        assert!(names.contains(&"robot_arm_1/gripper".to_string()));
        assert!(names.contains(&"furnace_table".to_string()));
    }

    #[test]
    fn heating_rejects_an_unreachable_setpoint() {
        let spec = TaskSpec {
            task_id: uuid::Uuid::new_v4(),
            experiment_id: uuid::Uuid::new_v4(),
            parameters: json!({ "setpoint_c": 1500.0 }),
            samples: HashMap::from([("sample".to_string(), uuid::Uuid::new_v4())]),
        };
        let registry = build_simulated_lab().unwrap();
        let behavior = registry.build_task("Heating", &spec).unwrap();
        assert!(matches!(behavior.validate(), Err(LabError::Validation(_))));
    }
}
