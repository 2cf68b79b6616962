// src/devices.rs
//
// =============================================================================
// LABFLOW: DEVICE STATE MACHINE
// =============================================================================
//
// Tracks availability, pause state and current task owner for every
// registered device. Occupy/release are conditional updates; the pause
// protocol is request/acknowledge:
//
//   IDLE --occupy--> OCCUPIED --release--> IDLE
//                                    \--release while pause requested--> PAUSED
//
// A pause request never interrupts the task currently holding the device.

use crate::core::{DeviceRecord, DeviceStatus, PauseStatus};
use crate::errors::{LabError, Result};
use crate::registry::LabRegistry;
use crate::store::LabStore;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct DeviceBoard {
    store: LabStore,
}

impl DeviceBoard {
    pub fn new(store: LabStore) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // BOOTSTRAP
    // -------------------------------------------------------------------------

    /// Insert every registered device. Duplicate names mean a stale database
    /// from a previous deployment and are refused.
    pub fn add_registered_devices(&self, registry: &LabRegistry) -> Result<()> {
        let conn = self.store.conn()?;
        for driver in registry.devices() {
            let n = conn.execute(
                "INSERT OR IGNORE INTO devices
                 (name, type_name, description, status, pause_status, task_id, message, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'IDLE', 'NONE', NULL, '', ?4)",
                params![
                    driver.name(),
                    driver.type_name(),
                    driver.description(),
                    LabStore::now_ms()
                ],
            )?;
            if n == 0 {
                return Err(LabError::validation(format!(
                    "device {} already exists in the database; clean up before setup",
                    driver.name()
                )));
            }
        }
        Ok(())
    }

    /// Seed device statuses at process start. A device still physically
    /// mid-run has no owning task left to release it, so it is parked PAUSED
    /// until an operator resumes it; OCCUPIED always carries an owner. Idle
    /// hardware keeps an operator pause that was in force before the restart.
    pub async fn sync_statuses(&self, registry: &LabRegistry) -> Result<()> {
        for driver in registry.devices() {
            let conn = self.store.conn()?;
            if driver.is_running().await {
                conn.execute(
                    "UPDATE devices SET
                         status = 'PAUSED', pause_status = 'PAUSED', task_id = NULL,
                         message = 'mid-run at startup; resume when the hardware is done',
                         updated_at_ms = ?2
                     WHERE name = ?1",
                    params![driver.name(), LabStore::now_ms()],
                )?;
                log::warn!("device {} is mid-run at startup, parked paused", driver.name());
            } else {
                // a pause requested against the previous owner is now in force
                conn.execute(
                    "UPDATE devices SET
                         status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'IDLE' END,
                         pause_status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'NONE' END,
                         task_id = NULL,
                         updated_at_ms = ?2
                     WHERE name = ?1",
                    params![driver.name(), LabStore::now_ms()],
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // QUERIES
    // -------------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Result<DeviceRecord> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM devices WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], read_device)?;
        match rows.next() {
            Some(row) => row.map_err(Into::into),
            None => Err(LabError::NotFound(format!("device {name}"))),
        }
    }

    /// All devices, sorted by name. The sort order is the global lock order
    /// the coordinator relies on for deadlock avoidance.
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM devices ORDER BY name ASC")?;
        let rows = stmt.query_map([], read_device)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn held_by(&self, task_id: Uuid) -> Result<Vec<String>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM devices WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // OCCUPANCY (coordinator only)
    // -------------------------------------------------------------------------

    /// CAS: IDLE + not pause-pending -> OCCUPIED by `task_id`.
    pub fn try_occupy(&self, name: &str, task_id: Uuid) -> Result<bool> {
        let conn = self.store.conn()?;
        let n = conn.execute(
            "UPDATE devices SET status = 'OCCUPIED', task_id = ?2, updated_at_ms = ?3
             WHERE name = ?1 AND status = 'IDLE' AND pause_status = 'NONE'",
            params![name, task_id.to_string(), LabStore::now_ms()],
        )?;
        Ok(n > 0)
    }

    /// Release a device held by `task_id`. A pause requested while the task
    /// ran takes effect here; otherwise the device returns to IDLE. Idempotent:
    /// releasing a device the task no longer holds is a no-op.
    pub fn release(&self, name: &str, task_id: Uuid) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE devices SET
                 status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'IDLE' END,
                 pause_status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'NONE' END,
                 task_id = NULL,
                 updated_at_ms = ?3
             WHERE name = ?1 AND task_id = ?2",
            params![name, task_id.to_string(), LabStore::now_ms()],
        )?;
        Ok(())
    }

    pub fn release_all(&self, task_id: Uuid) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE devices SET
                 status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'IDLE' END,
                 pause_status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'NONE' END,
                 task_id = NULL,
                 updated_at_ms = ?2
             WHERE task_id = ?1",
            params![task_id.to_string(), LabStore::now_ms()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PAUSE PROTOCOL (operator API)
    // -------------------------------------------------------------------------

    /// Record a pause request. Takes effect immediately if the device is idle,
    /// otherwise when the current task releases it. Requesting a pause on an
    /// already pausing/paused device is a no-op.
    pub fn request_pause(&self, name: &str) -> Result<()> {
        let conn = self.store.conn()?;
        let n = conn.execute(
            "UPDATE devices SET
                 pause_status = CASE WHEN status = 'IDLE' THEN 'PAUSED' ELSE 'REQUESTED' END,
                 status = CASE WHEN status = 'IDLE' THEN 'PAUSED' ELSE status END,
                 updated_at_ms = ?2
             WHERE name = ?1 AND pause_status = 'NONE'",
            params![name, LabStore::now_ms()],
        )?;
        if n == 0 {
            // distinguish "unknown device" from "already pausing"
            self.get(name)?;
        }
        Ok(())
    }

    /// Lift a pause in any stage (REQUESTED or PAUSED); the device becomes
    /// available again immediately.
    pub fn release_pause(&self, name: &str) -> Result<()> {
        let conn = self.store.conn()?;
        let n = conn.execute(
            "UPDATE devices SET
                 pause_status = 'NONE',
                 status = CASE WHEN status = 'PAUSED' THEN 'IDLE' ELSE status END,
                 updated_at_ms = ?2
             WHERE name = ?1",
            params![name, LabStore::now_ms()],
        )?;
        if n == 0 {
            return Err(LabError::NotFound(format!("device {name}")));
        }
        Ok(())
    }

    pub fn set_message(&self, name: &str, message: &str) -> Result<()> {
        let conn = self.store.conn()?;
        let n = conn.execute(
            "UPDATE devices SET message = ?2, updated_at_ms = ?3 WHERE name = ?1",
            params![name, message, LabStore::now_ms()],
        )?;
        if n == 0 {
            return Err(LabError::NotFound(format!("device {name}")));
        }
        Ok(())
    }
}

fn read_device(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let status: String = row.get("status")?;
    let pause: String = row.get("pause_status")?;
    let task_id: Option<String> = row.get("task_id")?;
    let updated_at_ms: i64 = row.get("updated_at_ms")?;
    Ok(DeviceRecord {
        name: row.get("name")?,
        type_name: row.get("type_name")?,
        description: row.get("description")?,
        status: DeviceStatus::parse(&status).unwrap_or(DeviceStatus::Idle),
        pause_status: PauseStatus::parse(&pause).unwrap_or(PauseStatus::None),
        task_id: task_id.and_then(|s| Uuid::parse_str(&s).ok()),
        message: row.get("message")?,
        last_updated: Utc
            .timestamp_millis_opt(updated_at_ms)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with_device(name: &str) -> (tempfile::TempDir, DeviceBoard) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let conn = store.conn().unwrap();
        conn.execute(
            "INSERT INTO devices
             (name, type_name, description, status, pause_status, task_id, message, updated_at_ms)
             VALUES (?1, 'Furnace', '', 'IDLE', 'NONE', NULL, '', 0)",
            params![name],
        )
        .unwrap();
        (dir, DeviceBoard::new(store))
    }

    #[test]
    fn occupy_is_exclusive() {
        let (_dir, board) = board_with_device("furnace_1");
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        assert!(board.try_occupy("furnace_1", t1).unwrap());
        assert!(!board.try_occupy("furnace_1", t2).unwrap());

        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Occupied);
        assert_eq!(dev.task_id, Some(t1));

        board.release("furnace_1", t1).unwrap();
        assert!(board.try_occupy("furnace_1", t2).unwrap());
    }

    #[test]
    fn release_by_non_owner_is_noop() {
        let (_dir, board) = board_with_device("furnace_1");
        let owner = Uuid::new_v4();
        assert!(board.try_occupy("furnace_1", owner).unwrap());

        board.release("furnace_1", Uuid::new_v4()).unwrap();
        assert_eq!(
            board.get("furnace_1").unwrap().status,
            DeviceStatus::Occupied
        );

        // releasing twice by the owner is also fine
        board.release("furnace_1", owner).unwrap();
        board.release("furnace_1", owner).unwrap();
        assert_eq!(board.get("furnace_1").unwrap().status, DeviceStatus::Idle);
    }

    #[test]
    fn pause_waits_for_running_task() {
        let (_dir, board) = board_with_device("furnace_1");
        let task = Uuid::new_v4();
        assert!(board.try_occupy("furnace_1", task).unwrap());

        // pause requested mid-task: recorded, but the device stays occupied
        board.request_pause("furnace_1").unwrap();
        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Occupied);
        assert_eq!(dev.pause_status, PauseStatus::Requested);

        // a paused-pending device is not available to anyone
        assert!(!board.try_occupy("furnace_1", Uuid::new_v4()).unwrap());

        // the pause takes effect on release, not before
        board.release("furnace_1", task).unwrap();
        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Paused);
        assert_eq!(dev.pause_status, PauseStatus::Paused);

        board.release_pause("furnace_1").unwrap();
        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Idle);
        assert_eq!(dev.pause_status, PauseStatus::None);
    }

    #[test]
    fn pause_on_idle_device_is_immediate() {
        let (_dir, board) = board_with_device("furnace_1");
        board.request_pause("furnace_1").unwrap();
        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Paused);
        assert_eq!(dev.pause_status, PauseStatus::Paused);
    }

    struct MidRunFurnace;

    #[async_trait::async_trait]
    impl crate::registry::DeviceDriver for MidRunFurnace {
        fn name(&self) -> &str {
            "furnace_1"
        }

        fn type_name(&self) -> &str {
            "Furnace"
        }

        fn sample_positions(&self) -> Vec<crate::core::SamplePositionDef> {
            vec![]
        }

        async fn is_running(&self) -> bool {
            true
        }

        async fn emergency_stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mid_run_device_at_boot_is_parked_paused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let board = DeviceBoard::new(store);
        let mut registry = LabRegistry::new();
        registry
            .register_device(std::sync::Arc::new(MidRunFurnace))
            .unwrap();
        board.add_registered_devices(&registry).unwrap();

        board.sync_statuses(&registry).await.unwrap();
        let dev = board.get("furnace_1").unwrap();
        assert_eq!(dev.status, DeviceStatus::Paused);
        assert_eq!(dev.pause_status, PauseStatus::Paused);
        assert_eq!(dev.task_id, None);

        // invisible to acquisition while the physical run winds down
        assert!(!board.try_occupy("furnace_1", Uuid::new_v4()).unwrap());

        // the operator lifts the pause once the hardware is done
        board.release_pause("furnace_1").unwrap();
        assert!(board.try_occupy("furnace_1", Uuid::new_v4()).unwrap());
    }
}
