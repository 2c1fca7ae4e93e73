//! Single-threaded task queue owning per-repo state.
//!
//! A [`RunLoop`] owns a value of type `S` on a dedicated thread and runs
//! queued closures against it one at a time, in submission order. Handles
//! are cheap to clone and may be used from any thread.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A unit of work run against the loop's state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Command<S> {
    Run(Task<S>),
    Delayed(Duration, Task<S>),
    Resume,
    Shutdown,
}

struct Shared<S> {
    name: String,
    sender: mpsc::UnboundedSender<Command<S>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    pending: Mutex<usize>,
    idle: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Handle to a running loop.
pub struct RunLoop<S: 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: 'static> Clone for RunLoop<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Send + 'static> RunLoop<S> {
    /// Starts a loop on a new thread named `name`.
    ///
    /// `init` runs on the loop thread and builds the state; it receives a
    /// handle to the loop so the state can schedule follow-up work.
    pub fn start<F>(name: impl Into<String>, init: F) -> CoreResult<Self>
    where
        F: FnOnce(RunLoop<S>) -> S + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let run_loop = RunLoop {
            shared: Arc::new(Shared {
                name: name.clone(),
                sender,
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
            }),
        };

        let worker = run_loop.clone();
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            *worker.shared.thread_id.lock() = Some(std::thread::current().id());
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(name = %worker.shared.name, error = %e, "failed to build run loop runtime");
                    worker.mark_stopped();
                    return;
                }
            };
            let state = init(worker.clone());
            runtime.block_on(worker.clone().drive(state, receiver));
        })?;
        *run_loop.shared.thread.lock() = Some(handle);
        Ok(run_loop)
    }

    /// Name of the loop thread.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues a task.
    pub fn schedule<F>(&self, task: F) -> CoreResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.send(Command::Run(Box::new(task)))
    }

    /// Queues a task to run once `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> CoreResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if delay.is_zero() {
            return self.schedule(task);
        }
        self.send(Command::Delayed(delay, Box::new(task)))
    }

    fn send(&self, command: Command<S>) -> CoreResult<()> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        *self.shared.pending.lock() += 1;
        if self.shared.sender.send(command).is_err() {
            self.finish_one();
            return Err(self.stopped_error());
        }
        Ok(())
    }

    /// Pauses the loop. Tasks scheduled from now on are held until
    /// [`RunLoop::resume`].
    pub fn interrupt(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!(name = %self.shared.name, "run loop interrupted");
        }
    }

    /// Resumes the loop and runs held tasks in submission order.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            debug!(name = %self.shared.name, "run loop resumed");
            let _ = self.shared.sender.send(Command::Resume);
        }
    }

    /// Returns true while the loop is paused.
    pub fn is_interrupted(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Returns true once the loop no longer runs tasks.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Returns true when called from the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        *self.shared.thread_id.lock() == Some(std::thread::current().id())
    }

    /// Blocks until every scheduled task, including delayed ones, has run.
    ///
    /// Must not be called from the loop thread.
    pub fn wait_idle(&self, timeout: Duration) -> CoreResult<()> {
        if self.is_loop_thread() {
            return Err(CoreError::invalid_argument(
                "wait_idle called from the run loop thread",
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self.is_stopped() {
                return Err(self.stopped_error());
            }
            if self.shared.idle.wait_until(&mut pending, deadline).timed_out() && *pending > 0 {
                return Err(CoreError::Timeout);
            }
        }
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        Ok(())
    }

    /// Stops the loop. Tasks that have not started are dropped.
    ///
    /// When called from another thread this waits for the loop thread to
    /// exit.
    pub fn shutdown(&self) {
        let _ = self.shared.sender.send(Command::Shutdown);
        if self.is_loop_thread() {
            return;
        }
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(name = %self.shared.name, "run loop thread panicked");
            }
        }
        self.mark_stopped();
    }

    async fn drive(self, mut state: S, mut receiver: mpsc::UnboundedReceiver<Command<S>>) {
        debug!(name = %self.shared.name, "run loop started");
        let mut held: VecDeque<Task<S>> = VecDeque::new();
        while let Some(command) = receiver.recv().await {
            let runnable = match command {
                Command::Run(task) => {
                    if self.is_interrupted() {
                        held.push_back(task);
                        continue;
                    }
                    Some(task)
                }
                Command::Delayed(delay, task) => {
                    let sender = self.shared.sender.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender.send(Command::Run(task));
                    });
                    // Stays counted as pending until it runs.
                    None
                }
                Command::Resume => None,
                Command::Shutdown => break,
            };
            if self.is_interrupted() {
                continue;
            }
            while let Some(task) = held.pop_front() {
                if !self.execute(&mut state, task) {
                    self.mark_stopped();
                    return;
                }
            }
            if let Some(task) = runnable {
                if !self.execute(&mut state, task) {
                    self.mark_stopped();
                    return;
                }
            }
        }
        debug!(name = %self.shared.name, "run loop stopped");
        self.mark_stopped();
    }

    fn execute(&self, state: &mut S, task: Task<S>) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| task(state)));
        self.finish_one();
        match outcome {
            Ok(()) => true,
            Err(panic) => {
                error!(
                    name = %self.shared.name,
                    panic = %panic_message(panic.as_ref()),
                    "task panicked; stopping run loop"
                );
                false
            }
        }
    }

    fn finish_one(&self) {
        let mut pending = self.shared.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.shared.idle.notify_all();
        }
    }

    fn mark_stopped(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        *self.shared.pending.lock() = 0;
        self.shared.idle.notify_all();
    }

    fn stopped_error(&self) -> CoreError {
        CoreError::RunLoopStopped {
            name: self.shared.name.clone(),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn start() -> RunLoop<Vec<u32>> {
        RunLoop::start("test-loop", |_| Vec::new()).unwrap()
    }

    fn snapshot(run_loop: &RunLoop<Vec<u32>>) -> Vec<u32> {
        let (tx, rx) = std::sync::mpsc::channel();
        run_loop
            .schedule(move |state| {
                tx.send(state.clone()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn tasks_run_in_order() {
        let run_loop = start();
        for i in 0..100 {
            run_loop.schedule(move |state| state.push(i)).unwrap();
        }
        run_loop.wait_idle(WAIT).unwrap();
        assert_eq!(snapshot(&run_loop), (0..100).collect::<Vec<_>>());
        run_loop.shutdown();
    }

    #[test]
    fn tasks_can_schedule_more_tasks() {
        let run_loop = start();
        run_loop
            .schedule(|state| {
                state.push(1);
            })
            .unwrap();
        let handle = run_loop.clone();
        run_loop
            .schedule(move |state| {
                state.push(2);
                handle.schedule(|state| state.push(3)).unwrap();
            })
            .unwrap();
        run_loop.wait_idle(WAIT).unwrap();
        assert_eq!(snapshot(&run_loop), vec![1, 2, 3]);
        run_loop.shutdown();
    }

    #[test]
    fn interrupt_holds_tasks_until_resume() {
        let run_loop = start();
        run_loop.interrupt();
        run_loop.schedule(|state| state.push(1)).unwrap();
        run_loop.schedule(|state| state.push(2)).unwrap();
        assert!(matches!(
            run_loop.wait_idle(Duration::from_millis(50)),
            Err(CoreError::Timeout)
        ));
        run_loop.resume();
        run_loop.schedule(|state| state.push(3)).unwrap();
        run_loop.wait_idle(WAIT).unwrap();
        assert_eq!(snapshot(&run_loop), vec![1, 2, 3]);
        run_loop.shutdown();
    }

    #[test]
    fn delayed_tasks_run_after_delay() {
        let run_loop = start();
        let started = Instant::now();
        run_loop
            .schedule_after(Duration::from_millis(30), |state| state.push(2))
            .unwrap();
        run_loop.schedule(|state| state.push(1)).unwrap();
        run_loop.wait_idle(WAIT).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(snapshot(&run_loop), vec![1, 2]);
        run_loop.shutdown();
    }

    #[test]
    fn panicking_task_stops_the_loop() {
        let run_loop = start();
        run_loop.schedule(|_| panic!("boom")).unwrap();
        let deadline = Instant::now() + WAIT;
        while !run_loop.is_stopped() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(run_loop.is_stopped());
        assert!(matches!(
            run_loop.schedule(|state| state.push(1)),
            Err(CoreError::RunLoopStopped { .. })
        ));
    }

    #[test]
    fn schedule_after_shutdown_fails() {
        let run_loop = start();
        run_loop.shutdown();
        assert!(run_loop.is_stopped());
        assert!(run_loop.schedule(|state| state.push(1)).is_err());
    }

    #[test]
    fn loop_thread_detection() {
        let run_loop = start();
        assert!(!run_loop.is_loop_thread());
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = run_loop.clone();
        run_loop
            .schedule(move |_| tx.send(handle.is_loop_thread()).unwrap())
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());
        run_loop.shutdown();
    }
}
