//! Local-process runtime backend.
//!
//! Spawns the worker binary as a child process with the injected
//! environment. Used for single-host deployments and smoke runs; the
//! container-service backend lives behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use vantage_core::ScanError;

use crate::{TaskHandle, TaskRuntime, TaskSpec, TaskState};

pub struct ProcessRuntime {
    worker_binary: PathBuf,
    children: Mutex<HashMap<String, Child>>,
    exited: Mutex<HashMap<String, i32>>,
}

impl ProcessRuntime {
    pub fn new(worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            worker_binary: worker_binary.into(),
            children: Mutex::new(HashMap::new()),
            exited: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskRuntime for ProcessRuntime {
    async fn launch(&self, spec: &TaskSpec) -> Result<TaskHandle, ScanError> {
        let mut command = Command::new(&self.worker_binary);
        for (k, v) in &spec.env {
            command.env(k, v);
        }
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ScanError::Runtime(format!("spawn {}: {e}", spec.module)))?;

        let handle = format!("proc-{}-{}", spec.module, Uuid::new_v4());
        info!(
            handle = handle.as_str(),
            module = spec.module.as_str(),
            pid = child.id(),
            "launched worker process"
        );
        self.children.lock().await.insert(handle.clone(), child);
        Ok(TaskHandle(handle))
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState, ScanError> {
        if let Some(code) = self.exited.lock().await.get(&handle.0) {
            return Ok(TaskState::Stopped { exit_code: *code });
        }

        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.0) else {
            return Err(ScanError::Runtime(format!("unknown task handle {handle}")));
        };

        match child
            .try_wait()
            .map_err(|e| ScanError::Runtime(e.to_string()))?
        {
            Some(status) => {
                let exit_code = status.code().unwrap_or(-1);
                children.remove(&handle.0);
                self.exited.lock().await.insert(handle.0.clone(), exit_code);
                Ok(TaskState::Stopped { exit_code })
            }
            None => Ok(TaskState::Running),
        }
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<(), ScanError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&handle.0) {
            if let Err(e) = child.kill().await {
                warn!(handle = %handle, error = %e, "failed to kill worker process");
            }
            children.remove(&handle.0);
            self.exited.lock().await.insert(handle.0.clone(), 137);
        }
        Ok(())
    }
}
