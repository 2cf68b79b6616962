// src/coordinator.rs
//
// =============================================================================
// LABFLOW: RESOURCE COORDINATOR
// =============================================================================
//
// The locking protocol.
//
// Responsibilities:
// 1. Atomically reserve a set of devices and sample-position slots for a task.
// 2. Block (bounded-backoff retry) until the request is satisfiable or the
//    caller's cancellation flag is set.
// 3. Guarantee release on every exit path, idempotently and all-or-nothing.
//
// Deadlock avoidance: each attempt walks candidates in one global order
// (devices by name, slots by position then index) and commits in that order,
// so two concurrent requesters can never hold-and-wait in opposite directions.
// A lost per-resource race rolls back the whole attempt and retries.

use crate::core::{DeviceStatus, PauseStatus, SlotStatus, DEVICE_PLACEHOLDER, POSITION_SEPARATOR};
use crate::devices::DeviceBoard;
use crate::errors::{LabError, Result};
use crate::samples::SampleBoard;
use crate::store::LabStore;
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// 1. REQUEST SHAPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Reserve one idle device instance of this class.
    ByType(String),
    /// Positions only; no device reserved for this requirement.
    NoDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionSpec {
    /// `count` free slots whose names fall under `prefix`. A `$` in the prefix
    /// expands to the name of the device acquired for the same requirement.
    Prefix { prefix: String, count: usize },
    /// Exactly these slots, by full name.
    Names(Vec<String>),
}

impl PositionSpec {
    pub fn prefix(prefix: impl Into<String>, count: usize) -> Self {
        PositionSpec::Prefix {
            prefix: prefix.into(),
            count,
        }
    }

    pub fn names<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        PositionSpec::Names(names.into_iter().map(Into::into).collect())
    }

    /// Key under which the granted slot names are reported back.
    fn key(&self) -> String {
        match self {
            PositionSpec::Prefix { prefix, .. } => prefix.clone(),
            PositionSpec::Names(names) => names.join(","),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Requirement {
    pub device: DeviceSpec,
    pub positions: Vec<PositionSpec>,
}

impl Requirement {
    pub fn device_of_type(type_name: impl Into<String>) -> Self {
        Self {
            device: DeviceSpec::ByType(type_name.into()),
            positions: Vec::new(),
        }
    }

    pub fn positions_only() -> Self {
        Self {
            device: DeviceSpec::NoDevice,
            positions: Vec::new(),
        }
    }

    pub fn with_position(mut self, spec: PositionSpec) -> Self {
        self.positions.push(spec);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub requirements: Vec<Requirement>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }
}

// ============================================================================
// 2. THE RESERVATION (the receipt)
// ============================================================================

/// What one requirement was granted: the literal device instance and the
/// literal slot names, keyed by the position spec as written (for a prefix
/// request the un-expanded prefix, `$` included).
#[derive(Debug, Clone)]
pub struct Grant {
    pub device: Option<String>,
    pub positions: HashMap<String, Vec<String>>,
}

impl Grant {
    pub fn slots_for(&self, key: &str) -> &[String] {
        self.positions.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A scoped, exclusive hold on a set of devices and slots. `release` is
/// idempotent; dropping an unreleased reservation releases it as a safety
/// net (forced task termination goes through `release_all` instead).
/// A task holds at most one live reservation: release returns everything
/// the owning task holds, by owner, not by grant list.
pub struct Reservation {
    task_id: Uuid,
    pub grants: Vec<Grant>,
    devices: Vec<String>,
    slots: Vec<String>,
    store: LabStore,
    released: bool,
}

impl Reservation {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn device_names(&self) -> &[String] {
        &self.devices
    }

    pub fn slot_names(&self) -> &[String] {
        &self.slots
    }

    /// Return every held resource to its free state in one transaction.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        release_resources(&self.store, self.task_id)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release_resources(&self.store, self.task_id) {
                log::error!(
                    "failed to release reservation of task {}: {e}",
                    self.task_id
                );
            }
        }
    }
}

/// Release everything `task_id` holds, atomically. Safe to call when the task
/// holds nothing; safe to call twice. Devices with a pending pause request
/// come back PAUSED instead of IDLE.
pub(crate) fn release_resources(store: &LabStore, task_id: Uuid) -> Result<()> {
    let mut conn = store.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE devices SET
             status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'IDLE' END,
             pause_status = CASE WHEN pause_status != 'NONE' THEN 'PAUSED' ELSE 'NONE' END,
             task_id = NULL,
             updated_at_ms = ?2
         WHERE task_id = ?1",
        params![task_id.to_string(), LabStore::now_ms()],
    )?;
    tx.execute(
        "UPDATE slots SET status = 'EMPTY', task_id = NULL WHERE task_id = ?1",
        params![task_id.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

// ============================================================================
// 3. THE COORDINATOR
// ============================================================================

#[derive(Clone)]
pub struct ResourceCoordinator {
    store: LabStore,
    devices: DeviceBoard,
    samples: SampleBoard,
    retry_base: Duration,
    retry_max: Duration,
}

impl ResourceCoordinator {
    pub fn new(store: LabStore) -> Self {
        Self {
            devices: DeviceBoard::new(store.clone()),
            samples: SampleBoard::new(store.clone()),
            store,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(3),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }

    /// Block until the request is granted or `cancel` is set. On cancellation
    /// returns `LabError::Cancelled` with nothing held. A request that cannot
    /// ever be satisfied (resources do not exist) fails fast with a
    /// validation error instead of spinning.
    pub async fn acquire(
        &self,
        task_id: Uuid,
        request: &ResourceRequest,
        cancel: &AtomicBool,
    ) -> Result<Reservation> {
        let mut backoff = self.retry_base;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(LabError::Cancelled);
            }
            if let Some(reservation) = self.try_acquire_once(task_id, request)? {
                return Ok(reservation);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.retry_max);
        }
    }

    /// One planning + commit attempt. `Ok(None)` means "exists but busy right
    /// now, retry later"; `Err(Validation)` means the request can never be
    /// satisfied against the registered resource set.
    fn try_acquire_once(
        &self,
        task_id: Uuid,
        request: &ResourceRequest,
    ) -> Result<Option<Reservation>> {
        // grants are keyed by the spec as written; a repeated key within one
        // requirement would fold two grants into one entry
        for req in &request.requirements {
            let mut keys: HashSet<String> = HashSet::new();
            for spec in &req.positions {
                if !keys.insert(spec.key()) {
                    return Err(LabError::validation(format!(
                        "position specifier `{}` appears twice in one requirement",
                        spec.key()
                    )));
                }
            }
        }

        let devices = self.devices.list()?; // sorted by name
        let slots = self.samples.slots_sorted()?; // sorted by (position, idx)

        let mut planned_devices: Vec<String> = Vec::new();
        let mut planned_slots: HashSet<String> = HashSet::new();
        let mut grants: Vec<Grant> = Vec::new();

        // Phase 1: choose one device per typed requirement, in the global
        // name order. A type with no registered instance is a hard error.
        for req in &request.requirements {
            let device = match &req.device {
                DeviceSpec::NoDevice => None,
                DeviceSpec::ByType(type_name) => {
                    let mut instances = devices
                        .iter()
                        .filter(|d| &d.type_name == type_name)
                        .filter(|d| !planned_devices.contains(&d.name))
                        .peekable();
                    if instances.peek().is_none() {
                        return Err(LabError::validation(format!(
                            "not enough devices of type {type_name} registered"
                        )));
                    }
                    let free = instances.find(|d| {
                        d.status == DeviceStatus::Idle && d.pause_status == PauseStatus::None
                    });
                    match free {
                        Some(d) => {
                            planned_devices.push(d.name.clone());
                            Some(d.name.clone())
                        }
                        None => return Ok(None),
                    }
                }
            };
            grants.push(Grant {
                device,
                positions: HashMap::new(),
            });
        }

        // Phase 2: pin explicitly named slots first so a prefix request in the
        // same call can never steal a slot that was asked for by name.
        for (req, grant) in request.requirements.iter().zip(grants.iter_mut()) {
            for spec in &req.positions {
                let PositionSpec::Names(names) = spec else {
                    continue;
                };
                let mut granted = Vec::with_capacity(names.len());
                for name in names {
                    let slot = slots.iter().find(|s| &s.name == name).ok_or_else(|| {
                        LabError::validation(format!("unknown sample position: {name}"))
                    })?;
                    if planned_slots.contains(name) {
                        return Err(LabError::validation(format!(
                            "sample position {name} requested twice in one call"
                        )));
                    }
                    if slot.status != SlotStatus::Empty {
                        return Ok(None);
                    }
                    planned_slots.insert(name.clone());
                    granted.push(name.clone());
                }
                grant.positions.insert(spec.key(), granted);
            }
        }

        // Phase 3: satisfy prefix requests from whatever is left, still in
        // the global slot order.
        for (req, grant) in request.requirements.iter().zip(grants.iter_mut()) {
            for spec in &req.positions {
                let PositionSpec::Prefix { prefix, count } = spec else {
                    continue;
                };
                let expanded = match &grant.device {
                    Some(device) => prefix.replace(DEVICE_PLACEHOLDER, device),
                    None => {
                        if prefix.contains(DEVICE_PLACEHOLDER) {
                            return Err(LabError::validation(format!(
                                "prefix {prefix} uses {DEVICE_PLACEHOLDER} but its requirement reserves no device"
                            )));
                        }
                        prefix.clone()
                    }
                };

                let matching: Vec<_> = slots
                    .iter()
                    .filter(|s| matches_prefix(&s.name, &expanded))
                    .collect();
                let distinct_unplanned = matching
                    .iter()
                    .filter(|s| !planned_slots.contains(&s.name))
                    .count();
                if distinct_unplanned < *count {
                    return Err(LabError::validation(format!(
                        "position prefix `{expanded}` has only {distinct_unplanned} \
                         slot(s) left to give, but {count} were requested"
                    )));
                }

                let free: Vec<String> = matching
                    .iter()
                    .filter(|s| s.status == SlotStatus::Empty && !planned_slots.contains(&s.name))
                    .take(*count)
                    .map(|s| s.name.clone())
                    .collect();
                if free.len() < *count {
                    return Ok(None);
                }
                for name in &free {
                    planned_slots.insert(name.clone());
                }
                grant.positions.insert(spec.key(), free);
            }
        }

        // Phase 4: commit, in the global order. Any lost race rolls the whole
        // attempt back and retries. Rollback goes by owner, so there is no
        // bookkeeping of what was already taken.
        let mut ordered_slots: Vec<String> = planned_slots.iter().cloned().collect();
        ordered_slots.sort();

        let commit = || -> Result<bool> {
            for name in &planned_devices {
                if !self.devices.try_occupy(name, task_id)? {
                    return Ok(false);
                }
            }
            for name in &ordered_slots {
                if !self.samples.try_lock_slot(name, task_id)? {
                    return Ok(false);
                }
            }
            Ok(true)
        };

        match commit() {
            Ok(true) => Ok(Some(Reservation {
                task_id,
                grants,
                devices: planned_devices,
                slots: ordered_slots,
                store: self.store.clone(),
                released: false,
            })),
            Ok(false) => {
                log::debug!("task {task_id} lost a resource race, rolling back attempt");
                release_resources(&self.store, task_id)?;
                Ok(None)
            }
            Err(e) => {
                release_resources(&self.store, task_id)?;
                Err(e)
            }
        }
    }

    /// Safety net used by the task supervisor after forced termination:
    /// returns everything `task_id` holds, whether or not a `Reservation`
    /// value survived the kill.
    pub fn release_all(&self, task_id: Uuid) -> Result<()> {
        release_resources(&self.store, task_id)
    }
}

/// `furnace_1/inside` matches `furnace_1/inside` and `furnace_1/inside/2`,
/// but never `furnace_10/inside`.
fn matches_prefix(slot_name: &str, prefix: &str) -> bool {
    slot_name == prefix
        || (slot_name.starts_with(prefix)
            && slot_name[prefix.len()..].starts_with(POSITION_SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SamplePositionDef;
    use rusqlite::params;

    fn lab() -> (tempfile::TempDir, LabStore, ResourceCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let conn = store.conn().unwrap();
        for (name, type_name) in [
            ("furnace_1", "Furnace"),
            ("furnace_2", "Furnace"),
            ("arm_1", "RobotArm"),
        ] {
            conn.execute(
                "INSERT INTO devices
                 (name, type_name, description, status, pause_status, task_id, message, updated_at_ms)
                 VALUES (?1, ?2, '', 'IDLE', 'NONE', NULL, '', 0)",
                params![name, type_name],
            )
            .unwrap();
        }
        let samples = SampleBoard::new(store.clone());
        samples
            .add_positions(&[
                SamplePositionDef::new("furnace_1/inside", 2, ""),
                SamplePositionDef::new("furnace_2/inside", 2, ""),
                SamplePositionDef::new("transfer_rack", 1, ""),
            ])
            .unwrap();
        let coordinator = ResourceCoordinator::new(store.clone())
            .with_retry(Duration::from_millis(5), Duration::from_millis(20));
        (dir, store, coordinator)
    }

    fn furnace_request() -> ResourceRequest {
        ResourceRequest::new().require(
            Requirement::device_of_type("Furnace")
                .with_position(PositionSpec::prefix("$/inside", 2)),
        )
    }

    #[test]
    fn grants_concrete_names_with_placeholder_expansion() {
        let (_dir, _store, coordinator) = lab();
        let task = Uuid::new_v4();

        let reservation = coordinator
            .try_acquire_once(task, &furnace_request())
            .unwrap()
            .unwrap();
        let grant = &reservation.grants[0];
        assert_eq!(grant.device.as_deref(), Some("furnace_1"));
        assert_eq!(
            grant.slots_for("$/inside"),
            &["furnace_1/inside/1", "furnace_1/inside/2"]
        );
    }

    #[test]
    fn disjoint_requests_never_block_each_other() {
        let (_dir, _store, coordinator) = lab();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        // both furnaces exist, so two concurrent furnace requests get one each
        let r1 = coordinator
            .try_acquire_once(t1, &furnace_request())
            .unwrap()
            .unwrap();
        let r2 = coordinator
            .try_acquire_once(t2, &furnace_request())
            .unwrap()
            .unwrap();
        assert_eq!(r1.grants[0].device.as_deref(), Some("furnace_1"));
        assert_eq!(r2.grants[0].device.as_deref(), Some("furnace_2"));
    }

    #[test]
    fn shared_resource_is_exclusive_until_release() {
        let (_dir, _store, coordinator) = lab();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let rack = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::names(["transfer_rack"])),
        );

        let mut held = coordinator.try_acquire_once(t1, &rack).unwrap().unwrap();
        // busy, not invalid: the second caller is told to retry
        assert!(coordinator.try_acquire_once(t2, &rack).unwrap().is_none());

        held.release().unwrap();
        held.release().unwrap(); // idempotent
        assert!(coordinator.try_acquire_once(t2, &rack).unwrap().is_some());
    }

    #[test]
    fn one_slot_never_satisfies_two_entries() {
        let (_dir, _store, coordinator) = lab();
        // both furnace_1 slots pinned by name AND one more asked by prefix in
        // the same call: no distinct slot is left, so this can never be
        // satisfied.
        let request = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::names([
                    "furnace_1/inside/1",
                    "furnace_1/inside/2",
                ]))
                .with_position(PositionSpec::prefix("furnace_1/inside", 1)),
        );
        assert!(matches!(
            coordinator.try_acquire_once(Uuid::new_v4(), &request),
            Err(LabError::Validation(_))
        ));
    }

    #[test]
    fn repeated_specifier_in_one_requirement_is_rejected() {
        let (_dir, _store, coordinator) = lab();
        // two slots exist under the prefix, but the second grant entry would
        // silently overwrite the first
        let request = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::prefix("furnace_1/inside", 1))
                .with_position(PositionSpec::prefix("furnace_1/inside", 1)),
        );
        assert!(matches!(
            coordinator.try_acquire_once(Uuid::new_v4(), &request),
            Err(LabError::Validation(_))
        ));
    }

    #[test]
    fn impossible_requests_fail_fast() {
        let (_dir, _store, coordinator) = lab();
        let request = ResourceRequest::new()
            .require(Requirement::device_of_type("MassSpectrometer"));
        assert!(matches!(
            coordinator.try_acquire_once(Uuid::new_v4(), &request),
            Err(LabError::Validation(_))
        ));

        let request = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::prefix("furnace_1/inside", 3)),
        );
        assert!(matches!(
            coordinator.try_acquire_once(Uuid::new_v4(), &request),
            Err(LabError::Validation(_))
        ));
    }

    #[test]
    fn paused_devices_are_invisible_to_requests() {
        let (_dir, store, coordinator) = lab();
        let devices = DeviceBoard::new(store);
        devices.request_pause("furnace_1").unwrap();
        devices.request_pause("furnace_2").unwrap();

        // both furnaces paused: the request is valid but must wait
        assert!(coordinator
            .try_acquire_once(Uuid::new_v4(), &furnace_request())
            .unwrap()
            .is_none());

        devices.release_pause("furnace_2").unwrap();
        let reservation = coordinator
            .try_acquire_once(Uuid::new_v4(), &furnace_request())
            .unwrap()
            .unwrap();
        assert_eq!(reservation.grants[0].device.as_deref(), Some("furnace_2"));
    }

    #[tokio::test]
    async fn cancelled_acquire_holds_nothing() {
        let (_dir, store, coordinator) = lab();
        let blocker = Uuid::new_v4();
        let rack = ResourceRequest::new().require(
            Requirement::positions_only()
                .with_position(PositionSpec::names(["transfer_rack"])),
        );
        let _held = coordinator
            .try_acquire_once(blocker, &rack)
            .unwrap()
            .unwrap();

        let cancel = AtomicBool::new(false);
        let waiter = Uuid::new_v4();
        let flag_setter = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.store(true, Ordering::SeqCst);
        };
        let (result, ()) = tokio::join!(coordinator.acquire(waiter, &rack, &cancel), flag_setter);
        assert!(matches!(result, Err(LabError::Cancelled)));

        // the cancelled waiter locked nothing
        let samples = SampleBoard::new(store);
        assert!(samples.slots_held_by(waiter).unwrap().is_empty());
    }
}
