// src/store.rs
//
// =============================================================================
// LABFLOW: STATE STORE
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite using the "Hybrid Relational" pattern.
// - High-traffic fields (status, timestamps) are columns.
// - Complex documents (tasks, experiments, samples, requests) are JSON text,
//   with hot JSON fields patched in place via json_set.
// - Every cross-thread invariant rests on single-document conditional
//   updates: an UPDATE with a status guard either applies atomically or
//   reports zero affected rows. No in-process locks.
// - Busy timeout handles contention from concurrent task threads and readers.

use crate::core::{
    ExperimentRecord, ExperimentStatus, InputRequest, RequestStatus, SampleRecord, TaskRecord,
    TaskStatus,
};
use crate::errors::{LabError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Clone)]
pub struct LabStore {
    path: PathBuf,
}

impl LabStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the schema if it doesn't exist.
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS devices (
                name TEXT PRIMARY KEY,
                type_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                pause_status TEXT NOT NULL,
                task_id TEXT,
                message TEXT NOT NULL DEFAULT '',
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sample_positions (
                name TEXT PRIMARY KEY,
                capacity INTEGER NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS slots (
                name TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                idx INTEGER NOT NULL,
                status TEXT NOT NULL,
                task_id TEXT
            );

            CREATE TABLE IF NOT EXISTS samples (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                position TEXT,
                updated_at_ms INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                experiment_id TEXT NOT NULL,
                type_name TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS input_requests (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_slots_position ON slots(position);
            CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
            CREATE INDEX IF NOT EXISTS idx_requests_status ON input_requests(status);
            COMMIT;",
        )?;

        Ok(())
    }

    /// One short-lived connection per call. Pragmas are per-connection, so
    /// they are applied here rather than in init.
    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    pub(crate) fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // -------------------------------------------------------------------------
    // TASKS
    // -------------------------------------------------------------------------

    pub fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        Self::insert_task_with(&self.conn()?, task)
    }

    pub(crate) fn insert_task_with(conn: &Connection, task: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(task)?;
        conn.execute(
            "INSERT INTO tasks (id, experiment_id, type_name, status, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id.to_string(),
                task.experiment_id.to_string(),
                task.type_name,
                task.status.as_str(),
                Self::now_ms(),
                json
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: Uuid) -> Result<TaskRecord> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(LabError::NotFound(format!("task {id}"))),
        }
    }

    pub fn task_status(&self, id: Uuid) -> Result<TaskStatus> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        status
            .and_then(|s| TaskStatus::parse(&s))
            .ok_or_else(|| LabError::NotFound(format!("task {id}")))
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM tasks WHERE status = ?1 ORDER BY updated_at_ms ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    pub fn all_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT full_json FROM tasks ORDER BY updated_at_ms ASC")?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    /// Conditional status transition. Applies only if the task is currently in
    /// one of `from`; returns whether the update took effect. This is the
    /// compare-and-set primitive the whole task state machine rests on.
    pub fn cas_task_status(&self, id: Uuid, from: &[TaskStatus], to: TaskStatus) -> Result<bool> {
        let conn = self.conn()?;
        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE tasks
             SET status = ?1, updated_at_ms = ?2,
                 full_json = json_set(full_json, '$.status', ?1, '$.last_updated', ?3)
             WHERE id = ?{} AND status IN ({})",
            from.len() + 4,
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(to.as_str().to_string()),
            Box::new(Self::now_ms()),
            Box::new(now),
        ];
        for f in from {
            values.push(Box::new(f.as_str().to_string()));
        }
        values.push(Box::new(id.to_string()));
        // param order: ?1 to, ?2 ms, ?3 iso, ?4.. from list, last = id
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|v| v.as_ref()).collect();
        let n = stmt.execute(params_ref.as_slice())?;
        Ok(n > 0)
    }

    pub fn set_task_message(&self, id: Uuid, message: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET updated_at_ms = ?2,
                 full_json = json_set(full_json, '$.message', ?3)
             WHERE id = ?1",
            params![id.to_string(), Self::now_ms(), message],
        )?;
        Ok(())
    }

    pub fn set_task_result(&self, id: Uuid, result: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET updated_at_ms = ?2,
                 full_json = json_set(full_json, '$.result', json(?3))
             WHERE id = ?1",
            params![id.to_string(), Self::now_ms(), serde_json::to_string(result)?],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // EXPERIMENTS
    // -------------------------------------------------------------------------

    pub fn insert_experiment(&self, exp: &ExperimentRecord) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(exp)?;
        conn.execute(
            "INSERT INTO experiments (id, status, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![exp.id.to_string(), exp.status.as_str(), Self::now_ms(), json],
        )?;
        Ok(())
    }

    pub fn get_experiment(&self, id: Uuid) -> Result<ExperimentRecord> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM experiments WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(LabError::NotFound(format!("experiment {id}"))),
        }
    }

    pub fn experiments_with_status(&self, status: ExperimentStatus) -> Result<Vec<ExperimentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM experiments WHERE status = ?1 ORDER BY updated_at_ms ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    pub fn all_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT full_json FROM experiments ORDER BY updated_at_ms ASC")?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    pub fn update_experiment_status(
        &self,
        id: Uuid,
        status: ExperimentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        Self::update_experiment_status_with(&conn, id, status, message)
    }

    pub(crate) fn update_experiment_status_with(
        conn: &Connection,
        id: Uuid,
        status: ExperimentStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let n = conn.execute(
            "UPDATE experiments SET status = ?2, updated_at_ms = ?3,
                 full_json = json_set(full_json, '$.status', ?2,
                                      '$.message', coalesce(?4, json_extract(full_json, '$.message')),
                                      '$.last_updated', ?5)
             WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                Self::now_ms(),
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        if n == 0 {
            return Err(LabError::NotFound(format!("experiment {id}")));
        }
        Ok(())
    }

    /// Full-document rewrite, used by the compiler to write generated ids back.
    pub(crate) fn replace_experiment_with(conn: &Connection, exp: &ExperimentRecord) -> Result<()> {
        let json = serde_json::to_string(exp)?;
        let n = conn.execute(
            "UPDATE experiments SET status = ?2, updated_at_ms = ?3, full_json = ?4
             WHERE id = ?1",
            params![exp.id.to_string(), exp.status.as_str(), Self::now_ms(), json],
        )?;
        if n == 0 {
            return Err(LabError::NotFound(format!("experiment {}", exp.id)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SAMPLES
    // -------------------------------------------------------------------------

    pub fn insert_sample(&self, sample: &SampleRecord) -> Result<()> {
        Self::insert_sample_with(&self.conn()?, sample)
    }

    pub(crate) fn insert_sample_with(conn: &Connection, sample: &SampleRecord) -> Result<()> {
        let json = serde_json::to_string(sample)?;
        conn.execute(
            "INSERT INTO samples (id, name, position, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.id.to_string(),
                sample.name,
                sample.position,
                Self::now_ms(),
                json
            ],
        )?;
        Ok(())
    }

    pub fn get_sample(&self, id: Uuid) -> Result<SampleRecord> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM samples WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(LabError::NotFound(format!("sample {id}"))),
        }
    }

    pub fn sample_exists(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM samples WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn all_samples(&self) -> Result<Vec<SampleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT full_json FROM samples ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    pub(crate) fn set_sample_position(&self, id: Uuid, position: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE samples SET position = ?2, updated_at_ms = ?3,
                 full_json = json_set(full_json, '$.position', ?2, '$.last_updated', ?4)
             WHERE id = ?1",
            params![
                id.to_string(),
                position,
                Self::now_ms(),
                Utc::now().to_rfc3339()
            ],
        )?;
        if n == 0 {
            return Err(LabError::NotFound(format!("sample {id}")));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // OPERATOR INPUT REQUESTS
    // -------------------------------------------------------------------------

    pub fn insert_request(&self, request: &InputRequest) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(request)?;
        conn.execute(
            "INSERT INTO input_requests (id, status, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id.to_string(),
                request.status.as_str(),
                Self::now_ms(),
                json
            ],
        )?;
        Ok(())
    }

    pub fn get_request(&self, id: Uuid) -> Result<InputRequest> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT full_json FROM input_requests WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(LabError::NotFound(format!("input request {id}"))),
        }
    }

    pub fn pending_requests(&self) -> Result<Vec<InputRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM input_requests WHERE status = 'PENDING'
             ORDER BY updated_at_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(serde_json::from_str(&r?)?);
        }
        Ok(out)
    }

    /// Resolve a pending request. Applies only while the request is still
    /// PENDING; a second submission (or a submission racing a cancellation)
    /// reports false and leaves the stored response untouched.
    pub fn cas_request_resolution(
        &self,
        id: Uuid,
        to: RequestStatus,
        response: Option<&str>,
        note: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE input_requests SET status = ?2, updated_at_ms = ?3,
                 full_json = json_set(full_json, '$.status', ?2, '$.response', ?4,
                                      '$.note', ?5, '$.last_updated', ?6)
             WHERE id = ?1 AND status = 'PENDING'",
            params![
                id.to_string(),
                to.as_str(),
                Self::now_ms(),
                response,
                note,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskStatus;
    use serde_json::json;
    use std::collections::HashMap;

    fn temp_store() -> (tempfile::TempDir, LabStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        (dir, store)
    }

    fn sample_task(status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            type_name: "Heating".into(),
            parameters: json!({"setpoint_c": 600}),
            samples: HashMap::new(),
            status,
            prev_tasks: vec![],
            next_tasks: vec![],
            message: String::new(),
            result: None,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn task_roundtrip_and_cas() {
        let (_dir, store) = temp_store();
        let task = sample_task(TaskStatus::Pending);
        store.insert_task(&task).unwrap();

        let loaded = store.get_task(task.id).unwrap();
        assert_eq!(loaded.type_name, "Heating");
        assert_eq!(loaded.status, TaskStatus::Pending);

        // CAS from the right status applies...
        assert!(store
            .cas_task_status(task.id, &[TaskStatus::Pending], TaskStatus::Ready)
            .unwrap());
        // ...and is reflected both in the column and inside the JSON blob.
        assert_eq!(store.task_status(task.id).unwrap(), TaskStatus::Ready);
        assert_eq!(store.get_task(task.id).unwrap().status, TaskStatus::Ready);

        // CAS from a stale status is a no-op.
        assert!(!store
            .cas_task_status(task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .unwrap());
        assert_eq!(store.task_status(task.id).unwrap(), TaskStatus::Ready);
    }

    #[test]
    fn task_result_is_stored_as_json() {
        let (_dir, store) = temp_store();
        let task = sample_task(TaskStatus::Running);
        store.insert_task(&task).unwrap();

        store
            .set_task_result(task.id, &json!({"peak_temperature": 601.2}))
            .unwrap();
        let loaded = store.get_task(task.id).unwrap();
        assert_eq!(
            loaded.result.unwrap()["peak_temperature"],
            json!(601.2)
        );
    }

    #[test]
    fn request_resolution_is_single_shot() {
        let (_dir, store) = temp_store();
        let req = InputRequest {
            id: Uuid::new_v4(),
            prompt: "Furnace door open. Retry?".into(),
            options: vec!["retry".into(), "abort".into()],
            context: crate::core::RequestContext::Maintenance {
                device: "furnace_1".into(),
            },
            status: RequestStatus::Pending,
            response: None,
            note: String::new(),
            last_updated: Utc::now(),
        };
        store.insert_request(&req).unwrap();

        assert!(store
            .cas_request_resolution(req.id, RequestStatus::Fulfilled, Some("retry"), "")
            .unwrap());
        // Second resolution is rejected and the first answer survives.
        assert!(!store
            .cas_request_resolution(req.id, RequestStatus::Fulfilled, Some("abort"), "")
            .unwrap());
        let loaded = store.get_request(req.id).unwrap();
        assert_eq!(loaded.response.as_deref(), Some("retry"));
    }
}
