//! Task-runtime adapter.
//!
//! The orchestrator talks to whatever runs worker containers through the
//! [`TaskRuntime`] trait: a real container service in production, a local
//! process spawner for single-host runs, and an in-memory runtime for
//! tests. Handles are opaque strings; nobody holds object references
//! across the seam.

pub mod env;
pub mod memory;
pub mod process;

pub use env::WorkerEnv;
pub use memory::MemoryRuntime;
pub use process::ProcessRuntime;

use async_trait::async_trait;

use vantage_core::ScanError;

/// Opaque handle to a launched task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal-or-not state of a task as the runtime reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Stopped { exit_code: i32 },
}

impl TaskState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskState::Stopped { .. })
    }
}

/// What to launch: image, shape, and the injected environment.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub module: String,
    pub image: String,
    pub name: String,
    pub cpu_units: u32,
    pub memory_mb: u32,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Launch a task; returns its opaque handle.
    async fn launch(&self, spec: &TaskSpec) -> Result<TaskHandle, ScanError>;

    /// Current state of a previously launched task.
    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState, ScanError>;

    /// Best-effort stop. Stopped tasks report `Stopped` on the next poll.
    async fn stop(&self, handle: &TaskHandle) -> Result<(), ScanError>;
}
