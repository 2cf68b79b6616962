// src/lib.rs
//
// =============================================================================
// LABFLOW: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod context;
pub mod coordinator;
pub mod core;
pub mod devices;
pub mod errors;
pub mod executor;
pub mod experiments;
pub mod input;
pub mod lab;
pub mod registry;
pub mod samples;
pub mod sim;
pub mod store;

// 2. Re-exports (The Public API)
// These allow `use labflow::Lab` or `use labflow::TaskBehavior` downstream.

pub use crate::context::TaskContext;
pub use crate::coordinator::{PositionSpec, Requirement, Reservation, ResourceRequest};
pub use crate::core::{ExperimentSubmission, SamplePositionDef, TaskStatus};
pub use crate::errors::{LabError, Result};
pub use crate::lab::{Lab, LabConfig, LabSnapshot};
pub use crate::registry::{DeviceDriver, LabRegistry, TaskBehavior, TaskSpec};
