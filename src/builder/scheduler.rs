/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Worker pool and dependency-aware job graphs
//!
//! A [`JobGraph`] is a list of jobs where each job may depend on jobs added
//! before it, so every graph is acyclic by construction. Running a graph on a
//! [`WorkerPool`] submits the jobs whose dependencies are satisfied; finishing a
//! job releases its dependents. The returned [`GraphHandle`] blocks on completion
//! with or without a timeout. The first failing job cancels the rest.

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::error::BuildError;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub type JobResult = Result<(), BuildError>;
type Job = Box<dyn FnOnce() -> JobResult + Send + 'static>;

/// Fixed set of worker threads fed through an unbounded channel.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.workers.len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `num_threads` workers; `0` means one per logical CPU.
    pub fn new(num_threads: usize) -> std::io::Result<Self> {
        let num_threads = if num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            num_threads
        };

        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("motiondb-worker-{}", index))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })?;
            workers.push(worker);
        }

        debug!("🧵 Worker pool started with {} threads", num_threads);
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Runs `graph`, returning immediately with a handle to its completion.
    pub fn run(&self, graph: JobGraph) -> GraphHandle {
        let total = graph.nodes.len();
        let mut dependents = vec![Vec::new(); total];
        let mut remaining = Vec::with_capacity(total);
        let mut jobs = Vec::with_capacity(total);
        for (index, node) in graph.nodes.into_iter().enumerate() {
            for dependency in &node.dependencies {
                dependents[*dependency].push(index);
            }
            remaining.push(AtomicUsize::new(node.dependencies.len()));
            jobs.push(Mutex::new(Some(node.job)));
        }

        let state = Arc::new(GraphState {
            sender: Mutex::new(self.sender.clone()),
            jobs,
            remaining,
            dependents,
            unfinished: AtomicUsize::new(total),
            done: Mutex::new(total == 0),
            finished: Condvar::new(),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });

        let ready: Vec<usize> = (0..total)
            .filter(|&i| state.remaining[i].load(Ordering::Acquire) == 0)
            .collect();
        for index in ready {
            GraphState::submit(&state, index);
        }

        GraphHandle { state, total }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

/// Opaque reference to a job inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(usize);

struct JobNode {
    job: Job,
    dependencies: Vec<usize>,
}

#[derive(Default)]
pub struct JobGraph {
    nodes: Vec<JobNode>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add<F>(&mut self, job: F) -> JobHandle
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        self.add_after(&[], job)
    }

    /// Adds a job that starts only after every job in `dependencies` finished.
    pub fn add_after<F>(&mut self, dependencies: &[JobHandle], job: F) -> JobHandle
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let index = self.nodes.len();
        let mut dependencies: Vec<usize> = dependencies
            .iter()
            .map(|handle| handle.0)
            .filter(|&dependency| dependency < index)
            .collect();
        dependencies.sort_unstable();
        dependencies.dedup();
        self.nodes.push(JobNode {
            job: Box::new(job),
            dependencies,
        });
        JobHandle(index)
    }
}

struct GraphState {
    // Released once the graph finishes so the pool can shut down.
    sender: Mutex<Option<Sender<Task>>>,
    jobs: Vec<Mutex<Option<Job>>>,
    remaining: Vec<AtomicUsize>,
    dependents: Vec<Vec<usize>>,
    unfinished: AtomicUsize,
    done: Mutex<bool>,
    finished: Condvar,
    error: Mutex<Option<BuildError>>,
    cancelled: AtomicBool,
}

impl GraphState {
    fn submit(state: &Arc<GraphState>, index: usize) {
        let task_state = Arc::clone(state);
        let task: Task = Box::new(move || GraphState::execute(&task_state, index));
        let sender = state.sender.lock().clone();
        let sent = sender.map_or(false, |sender| sender.send(task).is_ok());
        if !sent {
            state.fail(BuildError::Internal("worker pool is shut down".to_string()));
            GraphState::complete(state, index);
        }
    }

    fn execute(state: &Arc<GraphState>, index: usize) {
        let job = state.jobs[index].lock().take();
        if let Some(job) = job {
            if !state.cancelled.load(Ordering::Acquire) {
                match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => state.fail(error),
                    Err(_) => state.fail(BuildError::Internal(format!("job {} panicked", index))),
                }
            }
        }
        GraphState::complete(state, index);
    }

    fn fail(&self, error: BuildError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.cancelled.store(true, Ordering::Release);
    }

    fn complete(state: &Arc<GraphState>, index: usize) {
        for &dependent in &state.dependents[index] {
            if state.remaining[dependent].fetch_sub(1, Ordering::AcqRel) == 1 {
                GraphState::submit(state, dependent);
            }
        }
        if state.unfinished.fetch_sub(1, Ordering::AcqRel) == 1 {
            state.sender.lock().take();
            let mut done = state.done.lock();
            *done = true;
            state.finished.notify_all();
        }
    }
}

/// Completion handle of a running graph.
pub struct GraphHandle {
    state: Arc<GraphState>,
    total: usize,
}

impl GraphHandle {
    pub fn is_done(&self) -> bool {
        *self.state.done.lock()
    }

    /// Blocks until every job has finished or been skipped.
    pub fn wait(&self) -> JobResult {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.finished.wait(&mut done);
        }
        drop(done);
        self.outcome()
    }

    /// Waits at most `timeout`; returns whether the graph finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.done.lock();
        while !*done {
            if self.state.finished.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }

    /// Skips every job that has not started yet.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn take_error(&self) -> Option<BuildError> {
        self.state.error.lock().take()
    }

    /// `(finished, total)` job counts.
    pub fn progress(&self) -> (usize, usize) {
        let unfinished = self.state.unfinished.load(Ordering::Acquire);
        (self.total - unfinished, self.total)
    }

    fn outcome(&self) -> JobResult {
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        if self.state.cancelled.load(Ordering::Acquire) {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    /// Result of a finished graph; `Internal` when called before completion.
    pub fn result(&self) -> JobResult {
        if !self.is_done() {
            return Err(BuildError::Internal("job graph still running".to_string()));
        }
        self.outcome()
    }
}

/// Write-once output slots shared between jobs of a graph.
#[derive(Debug)]
pub struct Slots<T> {
    slots: Vec<Mutex<Option<T>>>,
}

impl<T> Slots<T> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn put(&self, index: usize, value: T) {
        if let Some(slot) = self.slots.get(index) {
            *slot.lock() = Some(value);
        }
    }

    pub fn take(&self, index: usize) -> Option<T> {
        self.slots.get(index)?.lock().take()
    }

    /// Applies `f` to a filled slot without removing it.
    pub fn read<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.slots.get(index)?.lock();
        slot.as_ref().map(f)
    }

    /// Takes every slot in order; `None` if any slot was never filled.
    pub fn take_all(&self) -> Option<Vec<T>> {
        (0..self.slots.len()).map(|i| self.take(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_run_in_order() {
        let pool = WorkerPool::new(4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = JobGraph::new();

        let mut firsts = Vec::new();
        for i in 0..8 {
            let log = Arc::clone(&log);
            firsts.push(graph.add(move || {
                log.lock().push(i);
                Ok(())
            }));
        }
        let tail_log = Arc::clone(&log);
        graph.add_after(&firsts, move || {
            let log = tail_log.lock();
            assert_eq!(log.len(), 8);
            drop(log);
            tail_log.lock().push(100);
            Ok(())
        });

        let handle = pool.run(graph);
        handle.wait().unwrap();
        let log = log.lock();
        assert_eq!(log.len(), 9);
        assert_eq!(*log.last().unwrap(), 100);
        assert_eq!(handle.progress(), (9, 9));
    }

    #[test]
    fn test_failure_skips_dependents() {
        let pool = WorkerPool::new(2).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let mut graph = JobGraph::new();
        let failing = graph.add(|| Err(BuildError::KMeans("boom".to_string())));
        let flag = Arc::clone(&ran);
        graph.add_after(&[failing], move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let handle = pool.run(graph);
        assert!(matches!(handle.wait(), Err(BuildError::KMeans(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_reports_internal_error() {
        let pool = WorkerPool::new(1).unwrap();
        let mut graph = JobGraph::new();
        graph.add(|| panic!("worker job exploded"));
        let handle = pool.run(graph);
        assert!(matches!(handle.wait(), Err(BuildError::Internal(_))));

        // The worker survives and keeps serving graphs.
        let mut graph = JobGraph::new();
        graph.add(|| Ok(()));
        assert!(pool.run(graph).wait().is_ok());
    }

    #[test]
    fn test_empty_graph_and_timeout() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.run(JobGraph::new());
        assert!(handle.is_done());
        assert!(handle.wait_timeout(Duration::ZERO));

        let (release, gate) = crossbeam::channel::bounded::<()>(0);
        let mut graph = JobGraph::new();
        graph.add(move || {
            let _ = gate.recv();
            Ok(())
        });
        let handle = pool.run(graph);
        assert!(!handle.wait_timeout(Duration::from_millis(10)));
        release.send(()).unwrap();
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn test_cancel_skips_pending_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let (release, gate) = crossbeam::channel::bounded::<()>(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut graph = JobGraph::new();
        let first = graph.add(move || {
            let _ = gate.recv();
            Ok(())
        });
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            graph.add_after(&[first], move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let handle = pool.run(graph);
        handle.cancel();
        // The gated job may already have been skipped, dropping its receiver.
        let _ = release.send(());
        assert!(matches!(handle.wait(), Err(BuildError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slots() {
        let slots = Slots::new(3);
        slots.put(0, "a");
        slots.put(2, "c");
        assert_eq!(slots.read(0, |v| v.len()), Some(1));
        assert!(slots.take_all().is_none());

        let slots = Slots::new(2);
        slots.put(0, 1);
        slots.put(1, 2);
        assert_eq!(slots.take_all(), Some(vec![1, 2]));
    }
}
