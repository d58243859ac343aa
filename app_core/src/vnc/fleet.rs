//! The fleet: every live coordinator on this host, the port/display
//! allocator that keeps them disjoint, the durable session table used for
//! restart recovery, and the periodic cleanup sweep.

use crate::config::RuntimeConfig;
use crate::contracts::{EngineError, EngineResult};
use crate::data_models::session::{VncSessionRecord, VncSessionStatus};
use crate::utils::logger::log_fleet_event;
use crate::vnc::coordinator::{SlotAllocation, VncCoordinator};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fs2::FileExt;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SESSIONS_FILENAME: &str = "vnc_sessions_v1.json";

/// What the orchestrator gets back from the fleet for one session.
#[derive(Debug, Clone)]
pub struct FleetHandle {
    pub session_id: String,
    pub debug_port: u16,
    pub viewer_url: String,
    pub resume_path: Option<PathBuf>,
}

/// Seam between orchestration and the process-owning fleet, so job logic
/// tests against a stub.
#[async_trait]
pub trait FleetControl: Send + Sync {
    async fn create_session(
        &self,
        user_id: &str,
        job_url: &str,
        resume: Option<(String, Vec<u8>)>,
    ) -> EngineResult<FleetHandle>;
    async fn close_session(&self, session_id: &str) -> EngineResult<()>;
    async fn sessions_for_user(&self, user_id: &str) -> Vec<VncSessionRecord>;
    fn viewer_url(&self, session_id: &str) -> String;
}

/// Durable session rows behind an exclusive file lock.
#[derive(Debug, Clone)]
pub struct VncSessionStore {
    path: PathBuf,
}

impl VncSessionStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join(SESSIONS_FILENAME),
        }
    }

    fn with_rows<T>(
        &self,
        f: impl FnOnce(&mut Vec<VncSessionRecord>) -> T,
    ) -> EngineResult<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::internal(format!("session store mkdir failed: {e}")))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| EngineError::internal(format!("session store open failed: {e}")))?;
        file.lock_exclusive()
            .map_err(|e| EngineError::internal(format!("session store lock failed: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| EngineError::internal(format!("session store read failed: {e}")))?;
        let mut rows: Vec<VncSessionRecord> = if contents.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&contents)?
        };

        let result = f(&mut rows);

        let serialized = serde_json::to_string_pretty(&rows)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(serialized.as_bytes()))
            .map_err(|e| EngineError::internal(format!("session store write failed: {e}")))?;
        Ok(result)
    }

    pub fn upsert(&self, record: VncSessionRecord) -> EngineResult<()> {
        self.with_rows(|rows| {
            rows.retain(|r| r.id != record.id);
            rows.push(record);
        })
    }

    pub fn update_status(&self, session_id: &str, status: VncSessionStatus) -> EngineResult<()> {
        self.with_rows(|rows| {
            if let Some(row) = rows.iter_mut().find(|r| r.id == session_id) {
                row.status = status;
            }
        })
    }

    pub fn list(&self) -> EngineResult<Vec<VncSessionRecord>> {
        self.with_rows(|rows| rows.clone())
    }
}

/// # NDOC
/// component: `vnc::fleet`
/// purpose: Port allocation, concurrency cap, recovery, cleanup.
/// invariants:
///   - No two live sessions share a display number, VNC port, WebSocket
///     port, debug port, or sandbox home.
///   - A slot is freed only after the session's browser is known dead.
pub struct VncFleet {
    config: RuntimeConfig,
    used_slots: Mutex<BTreeSet<usize>>,
    sessions: tokio::sync::Mutex<HashMap<String, VncCoordinator>>,
    store: VncSessionStore,
}

impl VncFleet {
    pub fn new(config: RuntimeConfig) -> Self {
        let store = VncSessionStore::new(&config.state_root);
        Self {
            config,
            used_slots: Mutex::new(BTreeSet::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &VncSessionStore {
        &self.store
    }

    fn allocation_for(&self, index: usize) -> SlotAllocation {
        SlotAllocation {
            index,
            display_num: self.config.base_display_num + index as u16,
            vnc_port: self.config.base_vnc_port + index as u16,
            ws_port: self.config.base_ws_port + index as u16,
            debug_port: self.config.base_debug_port + index as u16,
        }
    }

    /// Smallest free slot; short critical section around the set only.
    pub(crate) fn allocate_slot(&self) -> EngineResult<SlotAllocation> {
        let mut used = self.used_slots.lock().expect("slot set poisoned");
        let index = (0..self.config.max_sessions).find(|i| !used.contains(i));
        match index {
            Some(index) => {
                used.insert(index);
                Ok(self.allocation_for(index))
            }
            None => Err(EngineError::resource(format!(
                "all {} fleet slots are in use",
                self.config.max_sessions
            ))),
        }
    }

    pub(crate) fn free_slot(&self, index: usize) {
        let mut used = self.used_slots.lock().expect("slot set poisoned");
        used.remove(&index);
    }

    fn reserve_specific_slot(&self, index: usize) -> bool {
        let mut used = self.used_slots.lock().expect("slot set poisoned");
        used.insert(index)
    }

    pub fn active_count(&self) -> usize {
        self.used_slots.lock().expect("slot set poisoned").len()
    }

    fn new_session_id() -> String {
        let noise: u64 = rand::thread_rng().gen();
        format!("sess_{}_{noise:012x}", Utc::now().timestamp_millis())
    }

    /// Recreate sessions recorded as active within the recovery window.
    /// Rows that cannot be recreated are marked `failed_recovery`.
    pub async fn recover(&self) -> EngineResult<usize> {
        let window = ChronoDuration::hours(self.config.recovery_window_hours);
        let cutoff = Utc::now() - window;
        let rows = self.store.list()?;
        let mut recovered = 0;

        for row in rows
            .into_iter()
            .filter(|r| r.status == VncSessionStatus::Active && r.created_at >= cutoff)
        {
            let index = (row.display_num.saturating_sub(self.config.base_display_num)) as usize;
            if index >= self.config.max_sessions || !self.reserve_specific_slot(index) {
                self.store
                    .update_status(&row.id, VncSessionStatus::FailedRecovery)?;
                continue;
            }
            let allocation = self.allocation_for(index);
            let result = async {
                let mut coordinator = VncCoordinator::prepare(
                    &self.config,
                    &row.id,
                    &row.user_id,
                    &row.job_url,
                    allocation,
                )?;
                coordinator.start(None).await?;
                Ok::<VncCoordinator, EngineError>(coordinator)
            }
            .await;

            match result {
                Ok(coordinator) => {
                    self.sessions.lock().await.insert(row.id.clone(), coordinator);
                    log_fleet_event(&row.id, "recovered", &row.job_url);
                    recovered += 1;
                }
                Err(err) => {
                    self.free_slot(index);
                    log_fleet_event(&row.id, "failed_recovery", &err.message);
                    self.store
                        .update_status(&row.id, VncSessionStatus::FailedRecovery)?;
                }
            }
        }
        Ok(recovered)
    }

    /// Close sessions older than the idle horizon and remove their homes.
    pub async fn cleanup_sweep(&self) -> EngineResult<usize> {
        let horizon = ChronoDuration::minutes(self.config.session_idle_horizon_minutes);
        let cutoff = Utc::now() - horizon;
        let stale: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.status == VncSessionStatus::Active && r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        let mut closed = 0;
        for session_id in stale {
            if self.close_session(&session_id).await.is_ok() {
                closed += 1;
            }
        }
        Ok(closed)
    }
}

#[async_trait]
impl FleetControl for VncFleet {
    async fn create_session(
        &self,
        user_id: &str,
        job_url: &str,
        resume: Option<(String, Vec<u8>)>,
    ) -> EngineResult<FleetHandle> {
        let allocation = self.allocate_slot()?;
        let session_id = Self::new_session_id();

        let startup = async {
            let mut coordinator = VncCoordinator::prepare(
                &self.config,
                &session_id,
                user_id,
                job_url,
                allocation,
            )?;
            coordinator.start(resume).await?;
            Ok::<VncCoordinator, EngineError>(coordinator)
        }
        .await;

        let coordinator = match startup {
            Ok(coordinator) => coordinator,
            Err(err) => {
                self.free_slot(allocation.index);
                return Err(err);
            }
        };

        let record = VncSessionRecord {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            job_url: job_url.to_string(),
            display_num: allocation.display_num,
            vnc_port: allocation.vnc_port,
            ws_port: allocation.ws_port,
            status: VncSessionStatus::Active,
            created_at: Utc::now(),
            allocated_host: self.config.public_host.clone(),
        };
        self.store.upsert(record)?;

        let handle = FleetHandle {
            session_id: session_id.clone(),
            debug_port: coordinator.debug_port(),
            viewer_url: coordinator.viewer_url(&self.config.public_host),
            resume_path: coordinator.resume_path.clone(),
        };
        self.sessions.lock().await.insert(session_id, coordinator);
        Ok(handle)
    }

    async fn close_session(&self, session_id: &str) -> EngineResult<()> {
        let coordinator = self.sessions.lock().await.remove(session_id);
        let Some(mut coordinator) = coordinator else {
            // Row-only session (e.g. from a previous process): mark closed.
            self.store.update_status(session_id, VncSessionStatus::Closed)?;
            return Ok(());
        };
        let index = coordinator.allocation.index;
        coordinator.stop_and_remove_home().await;
        // The browser is known dead after stop; only now free the slot.
        self.free_slot(index);
        self.store.update_status(session_id, VncSessionStatus::Closed)?;
        Ok(())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Vec<VncSessionRecord> {
        self.store
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.user_id == user_id && r.status == VncSessionStatus::Active)
            .collect()
    }

    fn viewer_url(&self, session_id: &str) -> String {
        format!(
            "ws://{}/vnc-stream/{session_id}",
            self.config.public_host
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fleet_with(root: &Path, max_sessions: usize) -> VncFleet {
        VncFleet::new(RuntimeConfig {
            max_sessions,
            sandbox_root: root.join("sessions"),
            state_root: root.join("state"),
            xvfb_binary: "/nonexistent/xvfb".to_string(),
            x11vnc_binary: "/nonexistent/x11vnc".to_string(),
            websockify_binary: "/nonexistent/websockify".to_string(),
            browser_binary: "/nonexistent/browser".to_string(),
            ..RuntimeConfig::default()
        })
    }

    fn record(id: &str, display_num: u16, status: VncSessionStatus) -> VncSessionRecord {
        VncSessionRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            job_url: "https://jobs.example.com/apply/1".to_string(),
            display_num,
            vnc_port: 5900 + (display_num - 99),
            ws_port: 6080 + (display_num - 99),
            status,
            created_at: Utc::now(),
            allocated_host: "localhost".to_string(),
        }
    }

    #[test]
    fn allocator_hands_out_smallest_free_slot() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 3);

        let a = fleet.allocate_slot().expect("slot 0");
        let b = fleet.allocate_slot().expect("slot 1");
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(a.display_num, 99);
        assert_eq!(b.display_num, 100);
        assert_eq!(b.vnc_port, 5901);
        assert_eq!(b.ws_port, 6081);
        assert_eq!(b.debug_port, 9223);

        fleet.free_slot(0);
        let again = fleet.allocate_slot().expect("slot 0 again");
        assert_eq!(again.index, 0);
    }

    #[test]
    fn allocator_denies_past_the_session_cap() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 2);
        fleet.allocate_slot().expect("slot 0");
        fleet.allocate_slot().expect("slot 1");

        let err = fleet.allocate_slot().expect_err("cap reached");
        assert_eq!(err.kind, crate::contracts::EngineErrorKind::ResourceError);
    }

    #[test]
    fn no_two_live_allocations_overlap() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 10);
        let allocations: Vec<_> = (0..10).map(|_| fleet.allocate_slot().expect("slot")).collect();

        let mut displays: Vec<_> = allocations.iter().map(|a| a.display_num).collect();
        let mut vnc_ports: Vec<_> = allocations.iter().map(|a| a.vnc_port).collect();
        let mut ws_ports: Vec<_> = allocations.iter().map(|a| a.ws_port).collect();
        for list in [&mut displays, &mut vnc_ports, &mut ws_ports] {
            let before = list.len();
            list.sort_unstable();
            list.dedup();
            assert_eq!(list.len(), before);
        }
    }

    #[test]
    fn store_round_trips_and_updates_status() {
        let dir = tempdir().expect("tempdir");
        let store = VncSessionStore::new(dir.path());
        store
            .upsert(record("sess-1", 99, VncSessionStatus::Active))
            .expect("upsert");
        store
            .update_status("sess-1", VncSessionStatus::Closed)
            .expect("update");

        let rows = store.list().expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, VncSessionStatus::Closed);
    }

    #[tokio::test]
    async fn failed_session_creation_frees_its_slot() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 1);

        let err = fleet
            .create_session("u1", "https://jobs.example.com/apply/1", None)
            .await
            .expect_err("binaries missing");
        assert_eq!(err.kind, crate::contracts::EngineErrorKind::ResourceError);
        assert_eq!(fleet.active_count(), 0);
        // No active row was persisted for the failed session.
        assert!(fleet.store().list().expect("list").is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_rows_are_marked_failed_recovery() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 3);
        fleet
            .store()
            .upsert(record("sess-old", 99, VncSessionStatus::Active))
            .expect("seed");

        let recovered = fleet.recover().await.expect("recover");
        assert_eq!(recovered, 0);
        let rows = fleet.store().list().expect("list");
        assert_eq!(rows[0].status, VncSessionStatus::FailedRecovery);
        // The reserved slot was released again.
        assert_eq!(fleet.active_count(), 0);
    }

    #[tokio::test]
    async fn recovery_ignores_rows_outside_the_window() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 3);
        let mut old = record("sess-ancient", 99, VncSessionStatus::Active);
        old.created_at = Utc::now() - ChronoDuration::hours(48);
        fleet.store().upsert(old).expect("seed");

        fleet.recover().await.expect("recover");
        let rows = fleet.store().list().expect("list");
        // Untouched: outside the recovery window.
        assert_eq!(rows[0].status, VncSessionStatus::Active);
    }

    #[tokio::test]
    async fn closing_an_unknown_session_only_updates_the_row() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 3);
        fleet
            .store()
            .upsert(record("sess-ghost", 100, VncSessionStatus::Active))
            .expect("seed");

        fleet.close_session("sess-ghost").await.expect("close");
        let rows = fleet.store().list().expect("list");
        assert_eq!(rows[0].status, VncSessionStatus::Closed);
    }

    #[tokio::test]
    async fn cleanup_sweep_closes_only_stale_sessions() {
        let dir = tempdir().expect("tempdir");
        let fleet = fleet_with(dir.path(), 3);
        let mut stale = record("sess-stale", 99, VncSessionStatus::Active);
        stale.created_at = Utc::now() - ChronoDuration::minutes(500);
        fleet.store().upsert(stale).expect("seed");
        fleet
            .store()
            .upsert(record("sess-fresh", 100, VncSessionStatus::Active))
            .expect("seed");

        let closed = fleet.cleanup_sweep().await.expect("sweep");
        assert_eq!(closed, 1);
        let rows = fleet.store().list().expect("list");
        let stale_row = rows.iter().find(|r| r.id == "sess-stale").expect("stale row");
        let fresh_row = rows.iter().find(|r| r.id == "sess-fresh").expect("fresh row");
        assert_eq!(stale_row.status, VncSessionStatus::Closed);
        assert_eq!(fresh_row.status, VncSessionStatus::Active);
    }
}
