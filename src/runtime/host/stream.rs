//! Streams and events of the host device
//!
//! Every stream owns one worker thread that drains a FIFO of jobs, which gives
//! the in-order-per-stream, unordered-across-streams guarantee of a real
//! device. Jobs receive the context's fault status so that work enqueued after a
//! device fault is skipped and callbacks observe the fault.

use super::CallbackGuard;
use crate::runtime::{DriverResult, EventFlags, RawContext, RawStream, Status, StreamCallback};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

/// Unit of stream work. Receives the context status at execution time.
pub(crate) type Job = Box<dyn FnOnce(DriverResult<()>) -> DriverResult<()> + Send + 'static>;

// ============================================================================
// Context fault
// ============================================================================

/// First execution error raised in a context. Once set, the context is
/// unusable and every later synchronization reports it.
#[derive(Debug, Default)]
pub(crate) struct Fault(Mutex<Option<Status>>);

impl Fault {
    pub fn check(&self) -> DriverResult<()> {
        match *self.0.lock() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    pub fn raise(&self, status: Status) {
        self.0.lock().get_or_insert(status);
    }
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    idle: Condvar,
}

/// An in-order work queue backed by a worker thread.
#[derive(Debug)]
pub(crate) struct HostStream {
    pub context: RawContext,
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    fault: Arc<Fault>,
}

impl HostStream {
    /// Spawn the worker for a new stream.
    pub fn spawn(handle: RawStream, context: RawContext, fault: Arc<Fault>) -> DriverResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());

        let worker_shared = Arc::clone(&shared);
        let worker_fault = Arc::clone(&fault);
        thread::Builder::new()
            .name(format!("segdrv-stream-{:x}", handle.0))
            .spawn(move || {
                for job in receiver {
                    let status = worker_fault.check();
                    match panic::catch_unwind(AssertUnwindSafe(move || job(status))) {
                        Ok(Ok(())) => {}
                        Ok(Err(status)) => worker_fault.raise(status),
                        Err(_) => {
                            tracing::error!(
                                backend = "host",
                                context = ?context,
                                "job on stream {:?} panicked; context poisoned with {}",
                                handle,
                                Status::LAUNCH_FAILED.name()
                            );
                            worker_fault.raise(Status::LAUNCH_FAILED);
                        }
                    }
                    let mut progress = worker_shared.progress.lock();
                    progress.completed += 1;
                    worker_shared.idle.notify_all();
                }
            })
            .map_err(|_| Status::OUT_OF_MEMORY)?;

        Ok(Self {
            context,
            shared,
            sender: Mutex::new(Some(sender)),
            fault,
        })
    }

    /// Append a job to the stream.
    pub fn enqueue(&self, job: Job) -> DriverResult<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(Status::INVALID_HANDLE)?;
        self.shared.progress.lock().submitted += 1;
        if sender.send(job).is_err() {
            self.shared.progress.lock().submitted -= 1;
            return Err(Status::INVALID_HANDLE);
        }
        Ok(())
    }

    /// Append a callback; it runs on the worker with driver calls forbidden.
    pub fn enqueue_callback(&self, callback: StreamCallback) -> DriverResult<()> {
        self.enqueue(Box::new(move |status: DriverResult<()>| {
            let _guard = CallbackGuard::enter();
            callback(status);
            Ok(())
        }))
    }

    /// Block until everything submitted so far has run.
    pub fn synchronize(&self) -> DriverResult<()> {
        let mut progress = self.shared.progress.lock();
        let target = progress.submitted;
        while progress.completed < target {
            self.shared.idle.wait(&mut progress);
        }
        drop(progress);
        self.fault.check()
    }

    /// `Ok` when idle, `NOT_READY` while work is pending.
    pub fn query(&self) -> DriverResult<()> {
        self.fault.check()?;
        let progress = self.shared.progress.lock();
        if progress.completed < progress.submitted {
            Err(Status::NOT_READY)
        } else {
            Ok(())
        }
    }

    /// Stop accepting work. Already queued jobs still run.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Default)]
struct EventState {
    recorded: u64,
    completed: u64,
    timestamp: Option<Instant>,
}

/// A completion marker. Each record bumps a ticket; the event is complete when
/// the latest recorded ticket has executed.
#[derive(Debug)]
pub(crate) struct HostEvent {
    pub context: RawContext,
    pub flags: EventFlags,
    state: Mutex<EventState>,
    cond: Condvar,
}

impl HostEvent {
    pub fn new(context: RawContext, flags: EventFlags) -> Self {
        Self {
            context,
            flags,
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
        }
    }

    /// Reserve the ticket for a new record.
    pub fn next_ticket(&self) -> u64 {
        let mut state = self.state.lock();
        state.recorded += 1;
        state.recorded
    }

    /// Latest recorded ticket
    pub fn recorded(&self) -> u64 {
        self.state.lock().recorded
    }

    /// Mark `ticket` as executed.
    pub fn complete(&self, ticket: u64) {
        let mut state = self.state.lock();
        if ticket > state.completed {
            state.completed = ticket;
            if self.flags == EventFlags::Default {
                state.timestamp = Some(Instant::now());
            }
        }
        self.cond.notify_all();
    }

    /// Block until `ticket` has executed.
    pub fn wait_for(&self, ticket: u64) {
        let mut state = self.state.lock();
        while state.completed < ticket {
            self.cond.wait(&mut state);
        }
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.completed >= state.recorded
    }

    /// Completion time of the latest record, if timing is enabled and it has run.
    pub fn timestamp(&self) -> DriverResult<Instant> {
        if self.flags == EventFlags::DisableTiming {
            return Err(Status::INVALID_HANDLE);
        }
        let state = self.state.lock();
        if state.recorded == 0 || state.completed < state.recorded {
            return Err(Status::NOT_READY);
        }
        state.timestamp.ok_or(Status::NOT_READY)
    }
}
