// src/samples.rs
//
// =============================================================================
// LABFLOW: SAMPLE POSITIONS & SAMPLES
// =============================================================================
//
// Slots move EMPTY <-> LOCKED only through the coordinator's conditional
// updates; a sample's position is mutated only while the destination slot is
// held LOCKED by the task performing the move.

use crate::core::{SamplePositionDef, SampleRecord, SlotRecord, SlotStatus};
use crate::errors::{LabError, Result};
use crate::store::LabStore;
use rusqlite::{params, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct SampleBoard {
    store: LabStore,
}

impl SampleBoard {
    pub fn new(store: LabStore) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // BOOTSTRAP
    // -------------------------------------------------------------------------

    /// Insert sample positions and expand them into slots. Idempotent: names
    /// already present are kept untouched, so re-running setup never clobbers
    /// a live lab.
    pub fn add_positions(&self, positions: &[SamplePositionDef]) -> Result<()> {
        let conn = self.store.conn()?;
        for pos in positions {
            if pos.capacity == 0 {
                return Err(LabError::validation(format!(
                    "sample position {} must have capacity >= 1",
                    pos.name
                )));
            }
            if pos.name.contains('$') {
                return Err(LabError::validation(format!(
                    "unsupported sample position name: {}",
                    pos.name
                )));
            }
            conn.execute(
                "INSERT OR IGNORE INTO sample_positions (name, capacity, description)
                 VALUES (?1, ?2, ?3)",
                params![pos.name, pos.capacity as i64, pos.description],
            )?;
            for (i, slot) in pos.slot_names().iter().enumerate() {
                conn.execute(
                    "INSERT OR IGNORE INTO slots (name, position, idx, status, task_id)
                     VALUES (?1, ?2, ?3, 'EMPTY', NULL)",
                    params![slot, pos.name, (i + 1) as i64],
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SLOT QUERIES
    // -------------------------------------------------------------------------

    /// Every slot of the lab, ordered by (position name, slot index). This is
    /// the global lock order for positions.
    pub fn slots_sorted(&self) -> Result<Vec<SlotRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM slots ORDER BY position ASC, idx ASC")?;
        let rows = stmt.query_map([], read_slot)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_slot(&self, name: &str) -> Result<SlotRecord> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM slots WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], read_slot)?;
        match rows.next() {
            Some(row) => row.map_err(Into::into),
            None => Err(LabError::NotFound(format!("sample position slot {name}"))),
        }
    }

    pub fn slots_held_by(&self, task_id: Uuid) -> Result<Vec<String>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM slots WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // SLOT LOCKING (coordinator only)
    // -------------------------------------------------------------------------

    /// CAS: EMPTY -> LOCKED by `task_id`.
    pub fn try_lock_slot(&self, name: &str, task_id: Uuid) -> Result<bool> {
        let conn = self.store.conn()?;
        let n = conn.execute(
            "UPDATE slots SET status = 'LOCKED', task_id = ?2
             WHERE name = ?1 AND status = 'EMPTY'",
            params![name, task_id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Idempotent: unlocking a slot the task does not hold is a no-op.
    pub fn unlock_slot(&self, name: &str, task_id: Uuid) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE slots SET status = 'EMPTY', task_id = NULL
             WHERE name = ?1 AND task_id = ?2",
            params![name, task_id.to_string()],
        )?;
        Ok(())
    }

    pub fn unlock_all(&self, task_id: Uuid) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE slots SET status = 'EMPTY', task_id = NULL WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SAMPLE MOVEMENT
    // -------------------------------------------------------------------------

    /// Physically relocate a sample. Only valid while the destination slot is
    /// LOCKED by the calling task; at most one sample may sit in a slot.
    pub fn move_sample(&self, task_id: Uuid, sample_id: Uuid, destination: &str) -> Result<()> {
        let slot = self.get_slot(destination)?;
        if slot.status != SlotStatus::Locked || slot.task_id != Some(task_id) {
            return Err(LabError::InvalidTransition(format!(
                "destination {destination} is not reserved by the moving task"
            )));
        }
        if let Some(occupant) = self.sample_at(destination)? {
            if occupant.id != sample_id {
                return Err(LabError::InvalidTransition(format!(
                    "destination {destination} already holds sample {}",
                    occupant.name
                )));
            }
        }
        self.store.set_sample_position(sample_id, Some(destination))
    }

    /// Take a sample off-lab (e.g. after retrieval by an operator).
    pub fn remove_sample_from_lab(&self, sample_id: Uuid) -> Result<()> {
        self.store.set_sample_position(sample_id, None)
    }

    pub fn sample_at(&self, position: &str) -> Result<Option<SampleRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT full_json FROM samples WHERE position = ?1")?;
        let mut rows = stmt.query_map(params![position], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        match rows.next() {
            Some(json) => Ok(Some(serde_json::from_str(&json?)?)),
            None => Ok(None),
        }
    }
}

fn read_slot(row: &Row<'_>) -> rusqlite::Result<SlotRecord> {
    let status: String = row.get("status")?;
    let task_id: Option<String> = row.get("task_id")?;
    let idx: i64 = row.get("idx")?;
    Ok(SlotRecord {
        name: row.get("name")?,
        position: row.get("position")?,
        index: idx as usize,
        status: if status == "LOCKED" {
            SlotStatus::Locked
        } else {
            SlotStatus::Empty
        },
        task_id: task_id.and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn board() -> (tempfile::TempDir, LabStore, SampleBoard) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let board = SampleBoard::new(store.clone());
        board
            .add_positions(&[
                SamplePositionDef::new("furnace_1/inside", 4, "heating chamber"),
                SamplePositionDef::new("transfer_rack", 1, "hand-off point"),
            ])
            .unwrap();
        (dir, store, board)
    }

    #[test]
    fn positions_expand_into_slots() {
        let (_dir, _store, board) = board();
        let slots = board.slots_sorted().unwrap();
        let names: Vec<&str> = slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "furnace_1/inside/1",
                "furnace_1/inside/2",
                "furnace_1/inside/3",
                "furnace_1/inside/4",
                "transfer_rack",
            ]
        );

        // bootstrap is idempotent: re-adding keeps the existing rows
        board
            .add_positions(&[SamplePositionDef::new("transfer_rack", 1, "renamed")])
            .unwrap();
        assert_eq!(board.slots_sorted().unwrap().len(), 5);
    }

    #[test]
    fn slot_lock_is_exclusive_and_release_idempotent() {
        let (_dir, _store, board) = board();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        assert!(board.try_lock_slot("transfer_rack", t1).unwrap());
        assert!(!board.try_lock_slot("transfer_rack", t2).unwrap());

        board.unlock_slot("transfer_rack", t2).unwrap(); // not the owner: no-op
        assert_eq!(
            board.get_slot("transfer_rack").unwrap().status,
            SlotStatus::Locked
        );

        board.unlock_slot("transfer_rack", t1).unwrap();
        board.unlock_slot("transfer_rack", t1).unwrap(); // second release: no-op
        assert_eq!(
            board.get_slot("transfer_rack").unwrap().status,
            SlotStatus::Empty
        );
    }

    #[test]
    fn move_requires_destination_lock() {
        let (_dir, store, board) = board();
        let task = Uuid::new_v4();
        let sample = SampleRecord {
            id: Uuid::new_v4(),
            name: "pellet_a".into(),
            position: None,
            tags: vec![],
            metadata: HashMap::new(),
            last_updated: Utc::now(),
        };
        store.insert_sample(&sample).unwrap();

        // destination not locked -> refused
        assert!(matches!(
            board.move_sample(task, sample.id, "transfer_rack"),
            Err(LabError::InvalidTransition(_))
        ));

        assert!(board.try_lock_slot("transfer_rack", task).unwrap());
        board.move_sample(task, sample.id, "transfer_rack").unwrap();
        assert_eq!(
            store.get_sample(sample.id).unwrap().position.as_deref(),
            Some("transfer_rack")
        );

        // a second sample cannot move into the occupied slot
        let other = SampleRecord {
            id: Uuid::new_v4(),
            name: "pellet_b".into(),
            position: None,
            tags: vec![],
            metadata: HashMap::new(),
            last_updated: Utc::now(),
        };
        store.insert_sample(&other).unwrap();
        assert!(board.move_sample(task, other.id, "transfer_rack").is_err());
    }
}
