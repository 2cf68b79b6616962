// src/experiments.rs
//
// =============================================================================
// LABFLOW: EXPERIMENT MANAGER
// =============================================================================
//
// Intake and compilation of experiment DAGs.
//
// Submission is all-or-nothing: the whole document is validated against the
// registry and its task graph checked for cycles before anything is stored.
// A later sweep compiles each accepted experiment in a single transaction:
// samples become sample records, task declarations become task records with
// the edge list transposed (the submission names successors, the scheduler
// wants predecessors), and the generated ids are written back into the
// experiment document for traceability.

use crate::core::{
    ExperimentRecord, ExperimentStatus, ExperimentSubmission, SampleRecord, TaskRecord, TaskStatus,
};
use crate::errors::{LabError, Result};
use crate::registry::{LabRegistry, TaskSpec};
use crate::store::LabStore;
use chrono::Utc;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Clone)]
pub struct ExperimentManager {
    store: LabStore,
}

impl ExperimentManager {
    pub fn new(store: LabStore) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // INTAKE
    // -------------------------------------------------------------------------

    /// Validate and accept a submission. On any defect the whole document is
    /// rejected and nothing is stored.
    pub fn submit(
        &self,
        registry: &LabRegistry,
        submission: ExperimentSubmission,
    ) -> Result<Uuid> {
        validate_submission(registry, &submission)?;
        validate_behaviors(registry, &submission)?;
        let record = ExperimentRecord::from_submission(submission);
        self.store.insert_experiment(&record)?;
        log::info!(
            "accepted experiment {} ({}, {} task(s))",
            record.id,
            record.name,
            record.tasks.len()
        );
        Ok(record.id)
    }

    // -------------------------------------------------------------------------
    // COMPILATION
    // -------------------------------------------------------------------------

    /// Compile every accepted experiment into live sample and task records.
    /// Each experiment compiles in one transaction, so a crash mid-sweep
    /// leaves it either untouched or fully materialized.
    pub fn compile_pending(&self) -> Result<usize> {
        let mut compiled = 0;
        for experiment in self.store.experiments_with_status(ExperimentStatus::Pending)? {
            match self.compile_one(experiment) {
                Ok(id) => {
                    log::info!("experiment {id} is now running");
                    compiled += 1;
                }
                Err(e) => log::error!("experiment compilation failed: {e}"),
            }
        }
        Ok(compiled)
    }

    fn compile_one(&self, mut experiment: ExperimentRecord) -> Result<Uuid> {
        // supplied sample ids are caller promises; a collision with an
        // existing record fails this experiment, not the sweep
        for sample in &experiment.samples {
            if let Some(id) = sample.sample_id {
                if self.store.sample_exists(id)? {
                    let message = format!("sample id {id} already exists in the lab");
                    self.store.update_experiment_status(
                        experiment.id,
                        ExperimentStatus::Error,
                        Some(&message),
                    )?;
                    return Err(LabError::validation(message));
                }
            }
        }

        let now = Utc::now();
        let mut sample_ids: HashMap<String, Uuid> = HashMap::new();
        let mut samples: Vec<SampleRecord> = Vec::new();
        for sample in &mut experiment.samples {
            let id = sample.sample_id.unwrap_or_else(Uuid::new_v4);
            sample.sample_id = Some(id);
            sample_ids.insert(sample.name.clone(), id);
            samples.push(SampleRecord {
                id,
                name: sample.name.clone(),
                position: None,
                tags: sample.tags.clone(),
                metadata: sample.metadata.clone(),
                last_updated: now,
            });
        }

        let task_ids: Vec<Uuid> = experiment.tasks.iter().map(|_| Uuid::new_v4()).collect();
        let mut prev_tasks: Vec<Vec<Uuid>> = vec![Vec::new(); experiment.tasks.len()];
        for (i, task) in experiment.tasks.iter().enumerate() {
            for &next in &task.next_tasks {
                prev_tasks[next].push(task_ids[i]);
            }
        }

        let mut tasks: Vec<TaskRecord> = Vec::new();
        for (i, task) in experiment.tasks.iter_mut().enumerate() {
            task.task_id = Some(task_ids[i]);
            let task_samples = task
                .samples
                .iter()
                .map(|(role, name)| (role.clone(), sample_ids[name]))
                .collect();
            tasks.push(TaskRecord {
                id: task_ids[i],
                experiment_id: experiment.id,
                type_name: task.type_name.clone(),
                parameters: task.parameters.clone(),
                samples: task_samples,
                status: TaskStatus::Pending,
                prev_tasks: prev_tasks[i].clone(),
                next_tasks: task.next_tasks.iter().map(|&n| task_ids[n]).collect(),
                message: String::new(),
                result: None,
                last_updated: now,
            });
        }

        experiment.status = ExperimentStatus::Running;
        experiment.last_updated = now;

        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        for sample in &samples {
            LabStore::insert_sample_with(&tx, sample)?;
        }
        for task in &tasks {
            LabStore::insert_task_with(&tx, task)?;
        }
        LabStore::replace_experiment_with(&tx, &experiment)?;
        tx.commit()?;
        Ok(experiment.id)
    }

    // -------------------------------------------------------------------------
    // CLOSE-OUT
    // -------------------------------------------------------------------------

    /// Settle running experiments whose tasks have all reached a terminal
    /// state: every task COMPLETED means success, any ERROR marks the
    /// experiment failed, otherwise it was cancelled.
    pub fn sweep_completed(&self) -> Result<()> {
        for experiment in self.store.experiments_with_status(ExperimentStatus::Running)? {
            let mut statuses = Vec::with_capacity(experiment.tasks.len());
            for task in &experiment.tasks {
                let Some(id) = task.task_id else {
                    // compiled experiments always carry ids; skip defensively
                    continue;
                };
                statuses.push(self.store.task_status(id)?);
            }
            if !statuses.iter().all(TaskStatus::is_terminal) {
                continue;
            }
            let outcome = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
                ExperimentStatus::Completed
            } else if statuses.iter().any(|s| *s == TaskStatus::Error) {
                ExperimentStatus::Error
            } else {
                ExperimentStatus::Cancelled
            };
            self.store
                .update_experiment_status(experiment.id, outcome, None)?;
            log::info!(
                "experiment {} finished as {}",
                experiment.id,
                outcome.as_str()
            );
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<ExperimentRecord> {
        self.store.get_experiment(id)
    }

    /// Task ids of a compiled experiment, in declaration order.
    pub fn task_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let experiment = self.store.get_experiment(id)?;
        Ok(experiment.tasks.iter().filter_map(|t| t.task_id).collect())
    }
}

// ============================================================================
// SUBMISSION VALIDATION
// ============================================================================

fn validate_submission(registry: &LabRegistry, submission: &ExperimentSubmission) -> Result<()> {
    if submission.name.trim().is_empty() {
        return Err(LabError::validation("experiment name must not be empty"));
    }
    if submission.tasks.is_empty() {
        return Err(LabError::validation(
            "an experiment needs at least one task",
        ));
    }

    let mut sample_names: HashSet<&str> = HashSet::new();
    for sample in &submission.samples {
        if sample.name.trim().is_empty() {
            return Err(LabError::validation("sample names must not be empty"));
        }
        if !sample_names.insert(&sample.name) {
            return Err(LabError::validation(format!(
                "duplicated sample name: {}",
                sample.name
            )));
        }
    }

    let task_count = submission.tasks.len();
    for (i, task) in submission.tasks.iter().enumerate() {
        if !registry.has_task_type(&task.type_name) {
            return Err(LabError::validation(format!(
                "task {i} has unknown type: {}",
                task.type_name
            )));
        }
        for (role, sample_name) in &task.samples {
            if !sample_names.contains(sample_name.as_str()) {
                return Err(LabError::validation(format!(
                    "task {i} binds role `{role}` to undeclared sample `{sample_name}`"
                )));
            }
        }
        for &next in &task.next_tasks {
            if next >= task_count {
                return Err(LabError::validation(format!(
                    "task {i} points at out-of-range task index {next}"
                )));
            }
            if next == i {
                return Err(LabError::validation(format!(
                    "task {i} depends on itself"
                )));
            }
        }
    }

    let mut graph = DiGraph::<(), ()>::new();
    let nodes: Vec<_> = (0..task_count).map(|_| graph.add_node(())).collect();
    for (i, task) in submission.tasks.iter().enumerate() {
        for &next in &task.next_tasks {
            graph.add_edge(nodes[i], nodes[next], ());
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(LabError::validation(
            "the task graph contains a cycle; experiments must be DAGs",
        ));
    }
    Ok(())
}

/// Instantiate every declared task against provisional sample ids and run its
/// own input validation, so malformed parameters bounce at submission instead
/// of erroring hours later on the bench.
fn validate_behaviors(registry: &LabRegistry, submission: &ExperimentSubmission) -> Result<()> {
    let provisional: HashMap<&str, Uuid> = submission
        .samples
        .iter()
        .map(|s| (s.name.as_str(), Uuid::new_v4()))
        .collect();
    for (i, task) in submission.tasks.iter().enumerate() {
        let spec = TaskSpec {
            task_id: Uuid::nil(),
            experiment_id: Uuid::nil(),
            parameters: task.parameters.clone(),
            samples: task
                .samples
                .iter()
                .map(|(role, name)| (role.clone(), provisional[name.as_str()]))
                .collect(),
        };
        let behavior = registry
            .build_task(&task.type_name, &spec)
            .map_err(|e| LabError::validation(format!("task {i} ({}): {e}", task.type_name)))?;
        behavior
            .validate()
            .map_err(|e| LabError::validation(format!("task {i} ({}): {e}", task.type_name)))?;
    }
    Ok(())
}
