//! In-memory container runtime for unit tests

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::{ContainerRuntime, CreateRequest, RuntimeError, SandboxId};
use crate::types::{ExitStatus, SandboxFile};

/// Runtime operation a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Create,
    Upload,
    Start,
    Wait,
    Logs,
    Stop,
}

#[derive(Debug, Default)]
struct State {
    live: HashSet<SandboxId>,
    files: HashMap<SandboxId, Vec<SandboxFile>>,
    starts: HashMap<SandboxId, usize>,
    removes: HashMap<SandboxId, usize>,
    faults: HashMap<Fault, usize>,
    last_request: Option<CreateRequest>,
    created: usize,
    peak_live: usize,
}

/// Fake runtime: a "run" echoes the uploaded file names, and exits with
/// code 1 when any file contains `FAIL`
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    next_id: AtomicU64,
    run_time_ms: AtomicU64,
    create_time_ms: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` calls of `fault`'s operation
    pub fn inject(&self, fault: Fault, count: usize) {
        *self.state().faults.entry(fault).or_default() += count;
    }

    /// Make every run take `duration`
    pub fn set_run_time(&self, duration: Duration) {
        self.run_time_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every create take `duration`
    pub fn set_create_time(&self, duration: Duration) {
        self.create_time_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop an instance behind the lifecycle's back
    pub fn forget(&self, id: &SandboxId) {
        self.state().live.remove(id);
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn peak_live(&self) -> usize {
        self.state().peak_live
    }

    pub fn created_count(&self) -> usize {
        self.state().created
    }

    pub fn remove_calls(&self, id: &SandboxId) -> usize {
        self.state().removes.get(id).copied().unwrap_or_default()
    }

    pub fn total_removes(&self) -> usize {
        self.state().removes.values().sum()
    }

    pub fn starts(&self, id: &SandboxId) -> usize {
        self.state().starts.get(id).copied().unwrap_or_default()
    }

    pub fn last_request(&self) -> Option<CreateRequest> {
        self.state().last_request.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check(&self, fault: Fault) -> Result<(), RuntimeError> {
        let mut state = self.state();
        match state.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RuntimeError::Api {
                    operation: "fake",
                    message: format!("injected {fault:?} failure"),
                })
            }
            _ => Ok(()),
        }
    }

    fn ensure_live(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        if self.state().live.contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }
}

fn unpack(archive: &[u8]) -> Vec<SandboxFile> {
    let mut archive = tar::Archive::new(archive);
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let name = path.split_once('/').map_or(path.clone(), |(_, rest)| rest.to_string());
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        files.push(SandboxFile::new(name, content));
    }
    files
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, request: &CreateRequest) -> Result<SandboxId, RuntimeError> {
        let delay = self.create_time_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check(Fault::Create)?;

        let id = SandboxId::new(format!(
            "fake{:012}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        let mut state = self.state();
        state.live.insert(id.clone());
        state.created += 1;
        state.peak_live = state.peak_live.max(state.live.len());
        state.last_request = Some(request.clone());
        Ok(id)
    }

    async fn copy_files_in(&self, id: &SandboxId, archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.ensure_live(id)?;
        self.check(Fault::Upload)?;
        self.state().files.insert(id.clone(), unpack(&archive));
        Ok(())
    }

    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.ensure_live(id)?;
        self.check(Fault::Start)?;
        *self.state().starts.entry(id.clone()).or_default() += 1;
        Ok(())
    }

    async fn wait_until_not_running(&self, id: &SandboxId) -> Result<ExitStatus, RuntimeError> {
        let delay = self.run_time_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.ensure_live(id)?;
        self.check(Fault::Wait)?;

        let state = self.state();
        let failed = state
            .files
            .get(id)
            .is_some_and(|files| files.iter().any(|f| f.content.contains("FAIL")));
        Ok(ExitStatus::new(i64::from(failed)))
    }

    async fn logs_since(&self, id: &SandboxId, _since: i64) -> Result<Vec<u8>, RuntimeError> {
        self.ensure_live(id)?;
        self.check(Fault::Logs)?;

        let state = self.state();
        let names: Vec<&str> = state
            .files
            .get(id)
            .map(|files| files.iter().map(|f| f.name.as_str()).collect())
            .unwrap_or_default();
        Ok(format!("ran {}\n", names.join(" ")).into_bytes())
    }

    async fn stop(&self, id: &SandboxId, _grace: Duration) -> Result<(), RuntimeError> {
        self.ensure_live(id)?;
        self.check(Fault::Stop)
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let mut state = self.state();
        *state.removes.entry(id.clone()).or_default() += 1;
        if state.live.remove(id) {
            state.files.remove(id);
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }
}
