//! Worker thread driving one transfer engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    EventSink, Quantum, StreamKind, StreamParams, TaskCounters, TaskKind, TaskStats,
    TransferEngine,
};
use crate::error::Uac2Error;
use crate::event::DeviceEvent;

/// Lifecycle of an audio task.
///
/// ```text
/// Created --start--> Started --stop--> Stopped --start--> Started ...
///    any state --drop--> Exiting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Thread running, never started.
    Created = 0,
    /// Streaming.
    Started = 1,
    /// Idle after a stop.
    Stopped = 2,
    /// Thread asked to exit.
    Exiting = 3,
}

impl TaskState {
    fn load(state: &AtomicU8) -> Self {
        match state.load(Ordering::Acquire) {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Exiting,
        }
    }

    fn store(self, state: &AtomicU8) {
        state.store(self as u8, Ordering::Release);
    }
}

/// Worker thread settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskOptions {
    /// Sleep between polls while idle or after an error.
    pub idle_sleep: Duration,
    /// How long drop waits for the thread before detaching it.
    pub shutdown_timeout: Duration,
    /// Try to raise the thread to realtime priority.
    pub realtime: bool,
}

/// One stream running on its own OS thread.
///
/// The thread repeats work quanta while the task is started. Each quantum
/// runs under the engine lock, so [`stop`](Self::stop) waits for an
/// in-progress quantum before cancelling outstanding transfers.
pub(crate) struct AudioTask<K: StreamKind> {
    kind: TaskKind,
    state: Arc<AtomicU8>,
    engine: Arc<Mutex<TransferEngine<K>>>,
    counters: Arc<TaskCounters>,
    params: StreamParams,
    events: EventSink,
    thread: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl<K: StreamKind> AudioTask<K> {
    /// Starts the worker thread in the `Created` state.
    pub fn spawn(
        engine: TransferEngine<K>,
        options: TaskOptions,
        events: EventSink,
    ) -> Result<Self, Uac2Error> {
        let kind = engine.task();
        let counters = engine.counters();
        let params = *engine.params();
        let state = Arc::new(AtomicU8::new(TaskState::Created as u8));
        let engine = Arc::new(Mutex::new(engine));

        let thread = {
            let state = Arc::clone(&state);
            let engine = Arc::clone(&engine);
            let events = events.clone();
            thread::Builder::new()
                .name(kind.name().to_string())
                .spawn(move || run(kind, &state, &engine, &events, options))
                .map_err(|source| Uac2Error::ThreadSpawn {
                    task: kind.to_string(),
                    source,
                })?
        };

        Ok(Self {
            kind,
            state,
            engine,
            counters,
            params,
            events,
            thread: Some(thread),
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn state(&self) -> TaskState {
        TaskState::load(&self.state)
    }

    pub fn is_started(&self) -> bool {
        self.state() == TaskState::Started
    }

    /// Resets the ring and begins streaming. A no-op if already started.
    pub fn start(&self) -> Result<(), Uac2Error> {
        if self.is_started() {
            return Ok(());
        }
        {
            let mut engine = self.engine.lock();
            engine.prepare_start()?;
            TaskState::Started.store(&self.state);
        }
        info!(task = %self.kind, endpoint = self.params.endpoint, "task started");
        self.events.emit(DeviceEvent::TaskStarted { task: self.kind });
        Ok(())
    }

    /// Stops streaming and cancels outstanding transfers. Buffers are kept.
    pub fn stop(&self) {
        if !self.is_started() {
            return;
        }
        TaskState::Stopped.store(&self.state);
        // Waits for the current quantum
        let cancelled = self.engine.lock().shutdown();
        let completed = self.counters.completed();
        info!(task = %self.kind, completed, cancelled, "task stopped");
        self.events.emit(DeviceEvent::TaskStopped {
            task: self.kind,
            completed,
        });
    }

    /// Sizes the buffers for a new rate. Refused while started.
    pub fn resize(&self, sample_rate: u32) -> Result<(), Uac2Error> {
        if self.is_started() {
            return Err(Uac2Error::TaskRunning {
                task: self.kind.to_string(),
            });
        }
        self.engine.lock().resize(sample_rate)
    }

    /// Runs `f` on the stream specialization under the engine lock.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut K) -> R) -> R {
        let mut engine = self.engine.lock();
        f(engine.stream())
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            kind: self.kind,
            state: self.state(),
            submitted_transfers: self.counters.submitted(),
            completed_transfers: self.counters.completed(),
            last_start_frame: self.counters.last_start_frame(),
        }
    }
}

impl<K: StreamKind> Drop for AudioTask<K> {
    fn drop(&mut self) {
        self.stop();
        TaskState::Exiting.store(&self.state);

        if let Some(handle) = self.thread.take() {
            let deadline = Instant::now() + self.shutdown_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(task = %self.kind, "worker thread panicked");
                }
            } else {
                error!(
                    task = %self.kind,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "worker thread did not exit, detaching"
                );
            }
        }

        match self.engine.try_lock_for(self.shutdown_timeout) {
            Some(mut engine) => engine.release_buffers(),
            None => warn!(task = %self.kind, "engine still busy, buffers not released"),
        }
        debug!(task = %self.kind, "task dropped");
    }
}

fn run<K: StreamKind>(
    kind: TaskKind,
    state: &AtomicU8,
    engine: &Mutex<TransferEngine<K>>,
    events: &EventSink,
    options: TaskOptions,
) {
    if options.realtime {
        promote_to_realtime(kind);
    }
    debug!(task = %kind, "worker thread running");

    loop {
        match TaskState::load(state) {
            TaskState::Exiting => break,
            TaskState::Started => {
                let outcome = {
                    let mut engine = engine.lock();
                    // Stopped while waiting for the lock
                    if TaskState::load(state) != TaskState::Started {
                        continue;
                    }
                    match panic::catch_unwind(AssertUnwindSafe(|| engine.work())) {
                        Ok(quantum) => Some(quantum),
                        Err(payload) => {
                            engine.recover();
                            let message = panic_message(&*payload);
                            warn!(task = %kind, %message, "work quantum panicked");
                            events.emit(DeviceEvent::QuantumPanicked {
                                task: kind,
                                message,
                            });
                            None
                        }
                    }
                };
                match outcome {
                    Some(Quantum::Completed | Quantum::TimedOut) => thread::yield_now(),
                    _ => thread::sleep(options.idle_sleep),
                }
            }
            TaskState::Created | TaskState::Stopped => {
                thread::sleep(options.idle_sleep);
                thread::yield_now();
            }
        }
    }
    debug!(task = %kind, "worker thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(all(unix, feature = "realtime"))]
#[allow(unsafe_code)]
fn promote_to_realtime(kind: TaskKind) {
    // SAFETY: sched_param is plain data, and pthread_self() is always a valid
    // handle for the calling thread.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if result == 0 {
        debug!(task = %kind, "running with SCHED_FIFO priority");
    } else {
        warn!(
            task = %kind,
            error = %std::io::Error::from_raw_os_error(result),
            "could not raise worker to realtime priority"
        );
    }
}

#[cfg(not(all(unix, feature = "realtime")))]
fn promote_to_realtime(kind: TaskKind) {
    debug!(task = %kind, "realtime scheduling not available");
}
