//! Bounded sub-agent pool.
//!
//! An attempt may delegate named parallel tasks, but only one level deep
//! and only up to `max_sub_agents` concurrently non-terminal. Spawning
//! beyond the cap fails with a typed error rather than queueing silently,
//! so scheduling pressure stays visible to the caller. Spawning from a
//! sub-agent is refused via the same depth rule dispatch enforces.

use std::fmt;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::io::dispatch::{DepthExceededError, MAX_DISPATCH_DEPTH};

/// Raised when the pool is at capacity. The caller must join a task before
/// retrying.
#[derive(Debug, Clone, Copy)]
pub struct PoolExhaustedError {
    pub max_sub_agents: usize,
}

impl fmt::Display for PoolExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-agent pool at capacity ({})", self.max_sub_agents)
    }
}

impl std::error::Error for PoolExhaustedError {}

struct Task<T> {
    name: String,
    goal: String,
    handle: thread::JoinHandle<Result<T>>,
}

/// Pool of named delegated tasks running on worker threads.
pub struct SubAgentPool<T> {
    max_sub_agents: usize,
    depth: u8,
    tasks: Vec<Task<T>>,
}

impl<T: Send + 'static> SubAgentPool<T> {
    /// `depth` is the caller's recursion depth; the root session is 0.
    pub fn new(max_sub_agents: usize, depth: u8) -> Self {
        Self {
            max_sub_agents,
            depth,
            tasks: Vec::new(),
        }
    }

    /// Tasks spawned and not yet joined, finished or not.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks still executing.
    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Spawn a named task, enforcing the depth rule, name uniqueness, and
    /// the concurrency cap.
    pub fn spawn<F>(&mut self, name: &str, goal: &str, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.depth >= MAX_DISPATCH_DEPTH {
            return Err(anyhow!(DepthExceededError { depth: self.depth }));
        }
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(anyhow!("sub-agent '{name}' already exists"));
        }
        if self.running() >= self.max_sub_agents {
            return Err(anyhow!(PoolExhaustedError {
                max_sub_agents: self.max_sub_agents,
            }));
        }
        self.tasks.push(Task {
            name: name.to_string(),
            goal: goal.to_string(),
            handle: thread::spawn(work),
        });
        debug!(name, goal, running = self.running(), "sub-agent spawned");
        Ok(())
    }

    /// Join one task by name, blocking until it finishes. A panicked task
    /// surfaces as an error for that task only.
    pub fn join(&mut self, name: &str) -> Result<T> {
        let idx = self
            .tasks
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| anyhow!("no sub-agent named '{name}'"))?;
        let task = self.tasks.remove(idx);
        join_task(task)
    }

    /// Join every spawned task in spawn order.
    pub fn join_all(&mut self) -> Vec<(String, Result<T>)> {
        self.tasks
            .drain(..)
            .map(|task| {
                let name = task.name.clone();
                (name, join_task(task))
            })
            .collect()
    }
}

fn join_task<T>(task: Task<T>) -> Result<T> {
    debug!(name = %task.name, goal = %task.goal, "joining sub-agent");
    match task.handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("sub-agent '{}' panicked", task.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn tasks_run_and_join_by_name() {
        let mut pool: SubAgentPool<u32> = SubAgentPool::new(4, 0);
        for n in 0..3u32 {
            pool.spawn(&format!("task-{n}"), "compute", move || Ok(n * 10))
                .expect("spawn");
        }
        assert_eq!(pool.join("task-1").expect("join"), 10);
        let rest = pool.join_all();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].0, "task-0");
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(4, 0);
        pool.spawn("dup", "g", || Ok(())).expect("spawn");
        assert!(pool.spawn("dup", "g", || Ok(())).is_err());
        pool.join_all();
    }

    #[test]
    fn cap_refuses_spawn_while_full() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(2, 0);
        let release = Arc::new(AtomicBool::new(false));
        for n in 0..2 {
            let release = release.clone();
            pool.spawn(&format!("busy-{n}"), "wait", move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
            .expect("spawn");
        }

        let err = pool.spawn("overflow", "g", || Ok(())).unwrap_err();
        assert!(err.downcast_ref::<PoolExhaustedError>().is_some());

        release.store(true, Ordering::SeqCst);
        pool.join_all();
    }

    #[test]
    fn finished_tasks_free_capacity() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(1, 0);
        pool.spawn("first", "g", || Ok(())).expect("spawn");
        // Wait for the first task to finish, then capacity is available again.
        for _ in 0..100 {
            if pool.running() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pool.spawn("second", "g", || Ok(())).expect("second spawn");
        pool.join_all();
    }

    #[test]
    fn sub_agents_may_not_spawn_sub_agents() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(4, 1);
        let err = pool.spawn("nested", "g", || Ok(())).unwrap_err();
        assert!(err.downcast_ref::<DepthExceededError>().is_some());
    }

    #[test]
    fn spawn_at_maximum_depth_value_is_refused() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(4, u8::MAX);
        let err = pool.spawn("deep", "g", || Ok(())).unwrap_err();
        assert!(err.downcast_ref::<DepthExceededError>().is_some());
    }

    #[test]
    fn panicked_task_is_an_error_not_a_crash() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(2, 0);
        pool.spawn("boom", "g", || panic!("boom")).expect("spawn");
        pool.spawn("fine", "g", || Ok(())).expect("spawn");
        let results = pool.join_all();
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
    }

    #[test]
    fn joining_unknown_name_is_an_error() {
        let mut pool: SubAgentPool<()> = SubAgentPool::new(2, 0);
        assert!(pool.join("ghost").is_err());
    }
}
