//! In-memory runtime backend for hermetic pipeline tests.
//!
//! Tasks are registered async behaviors keyed by module name; launching
//! runs the behavior on the tokio runtime and records its exit code.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use vantage_core::ScanError;

use crate::{TaskHandle, TaskRuntime, TaskSpec, TaskState};

type TaskBehavior = Arc<dyn Fn(TaskSpec) -> BoxFuture<'static, i32> + Send + Sync>;

struct TaskSlot {
    state: TaskState,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    behaviors: Mutex<HashMap<String, TaskBehavior>>,
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskSlot>>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behavior run for every launch of `module`. The future
    /// resolves to the task's exit code.
    pub fn register<F>(&self, module: &str, behavior: F)
    where
        F: Fn(TaskSpec) -> BoxFuture<'static, i32> + Send + Sync + 'static,
    {
        self.behaviors
            .lock()
            .unwrap()
            .insert(module.to_string(), Arc::new(behavior));
    }

    /// Tasks launched and not yet stopped. E2E assertions use this to
    /// prove no orphan handles survive a timeout.
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|slot| !slot.lock().unwrap().state.is_stopped())
            .count()
    }

    pub fn launched_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskRuntime for MemoryRuntime {
    async fn launch(&self, spec: &TaskSpec) -> Result<TaskHandle, ScanError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&spec.module)
            .cloned()
            .ok_or_else(|| {
                ScanError::Runtime(format!("no task behavior registered for '{}'", spec.module))
            })?;

        let handle = format!("mem-{}-{}", spec.module, Uuid::new_v4());
        let slot = Arc::new(Mutex::new(TaskSlot {
            state: TaskState::Running,
            join: None,
        }));

        let future = behavior(spec.clone());
        let task_slot = slot.clone();
        let join = tokio::spawn(async move {
            let exit_code = future.await;
            let mut slot = task_slot.lock().unwrap();
            if !slot.state.is_stopped() {
                slot.state = TaskState::Stopped { exit_code };
            }
        });
        slot.lock().unwrap().join = Some(join);

        self.tasks.lock().unwrap().insert(handle.clone(), slot);
        Ok(TaskHandle(handle))
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState, ScanError> {
        let slot = self
            .tasks
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| ScanError::Runtime(format!("unknown task handle {handle}")))?;
        let state = slot.lock().unwrap().state;
        Ok(state)
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<(), ScanError> {
        let slot = self.tasks.lock().unwrap().get(&handle.0).cloned();
        if let Some(slot) = slot {
            let mut slot = slot.lock().unwrap();
            if let Some(join) = slot.join.take() {
                join.abort();
            }
            if !slot.state.is_stopped() {
                slot.state = TaskState::Stopped { exit_code: 137 };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn spec(module: &str) -> TaskSpec {
        TaskSpec {
            module: module.to_string(),
            image: "img".to_string(),
            name: "task".to_string(),
            cpu_units: 256,
            memory_mb: 512,
            env: vec![],
        }
    }

    #[tokio::test]
    async fn task_runs_to_completion_with_exit_code() {
        let runtime = MemoryRuntime::new();
        runtime.register("fast", |_spec| async { 0 }.boxed());

        let handle = runtime.launch(&spec("fast")).await.unwrap();
        for _ in 0..100 {
            if runtime.poll(&handle).await.unwrap().is_stopped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            runtime.poll(&handle).await.unwrap(),
            TaskState::Stopped { exit_code: 0 }
        );
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn stop_aborts_a_sleeping_task() {
        let runtime = MemoryRuntime::new();
        runtime.register("slow", |_spec| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                0
            }
            .boxed()
        });

        let handle = runtime.launch(&spec("slow")).await.unwrap();
        assert_eq!(runtime.poll(&handle).await.unwrap(), TaskState::Running);
        runtime.stop(&handle).await.unwrap();
        assert_eq!(
            runtime.poll(&handle).await.unwrap(),
            TaskState::Stopped { exit_code: 137 }
        );
    }

    #[tokio::test]
    async fn unregistered_module_fails_to_launch() {
        let runtime = MemoryRuntime::new();
        assert!(runtime.launch(&spec("ghost")).await.is_err());
    }
}
