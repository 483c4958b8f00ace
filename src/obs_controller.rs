//! Serial execution pipeline for observer callbacks.
//!
//! Many observers share one controller. Submitted jobs run strictly one at
//! a time in submission order on background tasks, raced against a
//! per-handler timeout; handlers that overrun are reported through a
//! bounded warning channel and, below the blocking cap, left to finish on
//! their own so the pipeline keeps moving.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{trace, warn};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{sleep, Duration, Instant};

use crate::state_machine::StateID;

/// What a [`Warning`] is about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WarnKind {
  EnterTimeout,
  ExitTimeout,
  PickTimeout,
  UpdateTimeout,
  FrameTimeout,
  FrameSkip,
  MaxBlocking,
}

/// Timestamped notice emitted on the controller's bounded warning channel.
/// Sends never block; when the channel is full the warning is dropped.
#[derive(Clone, Debug)]
pub struct Warning {
  pub kind: WarnKind,
  pub at: Instant,
  pub state_id: StateID,
}

/// Controller tuning. Zero fields fall back to their defaults.
#[derive(Copy, Clone, Debug, Default)]
pub struct ObsControlCfg {
  /// Per-handler deadline; zero waits on every handler without one.
  pub timeout: Duration,
  /// How many handlers may be in flight before an overrunning one blocks
  /// the pipeline. Zero means 1.
  pub max_block: usize,
  /// Job queue capacity. Zero means 5.
  pub queue_size: usize,
  /// Warning channel capacity. Zero means 3.
  pub warn_size: usize,
}

const DEFAULT_QUEUE_SIZE: usize = 5;
const DEFAULT_WARN_SIZE: usize = 3;

pub(crate) type RunHook = Box<dyn FnOnce() + Send>;
pub(crate) type RetHook = Box<dyn FnOnce(bool) + Send>;

/// One packaged handler execution.
pub(crate) struct Job {
  pub(crate) state_id: StateID,
  pub(crate) kind: WarnKind,
  pub(crate) run_hook: Option<RunHook>,
  pub(crate) ret_hook: Option<RetHook>,
  pub(crate) payload: BoxFuture<'static, ()>,
}

struct CtrlShared {
  /// Job queue sender; absent in synchronous mode.
  queue: Option<Sender<Job>>,
  warn_tx: Sender<Warning>,
  warn_rx: Mutex<Option<Receiver<Warning>>>,
  in_flight: AtomicI64,
  max_block: i64,
  timeout: Duration,
}

impl CtrlShared {
  fn send_warning(&self, kind: WarnKind, state_id: StateID) {
    warn!("observer controller: {:?} on state {:?}", kind, state_id);
    let _ = self.warn_tx.try_send(Warning { kind, at: Instant::now(), state_id });
  }
}

/// Shared handle to one dispatch pipeline. Cloning is cheap; every clone
/// feeds the same queue and the same warning channel.
pub struct ObsController {
  shared: Arc<CtrlShared>,
}

impl Clone for ObsController {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

impl ObsController {
  /// Asynchronous controller: one dispatcher task drains the bounded job
  /// queue and runs each job on a fresh task, strictly serialised through a
  /// one-slot return token. Must be called inside a tokio runtime.
  pub fn new(cfg: ObsControlCfg) -> Self {
    let queue_size = if cfg.queue_size == 0 { DEFAULT_QUEUE_SIZE } else { cfg.queue_size };
    let warn_size = if cfg.warn_size == 0 { DEFAULT_WARN_SIZE } else { cfg.warn_size };
    let max_block = if cfg.max_block == 0 { 1 } else { cfg.max_block } as i64;
    let (job_tx, job_rx) = mpsc::channel(queue_size);
    let (warn_tx, warn_rx) = mpsc::channel(warn_size);
    let (token_tx, token_rx) = mpsc::channel(1);
    token_tx.try_send(()).expect("fresh token slot");
    let shared = Arc::new(CtrlShared {
      queue: Some(job_tx),
      warn_tx,
      warn_rx: Mutex::new(Some(warn_rx)),
      in_flight: AtomicI64::new(0),
      max_block,
      timeout: cfg.timeout,
    });
    tokio::spawn(run_dispatcher(
      Arc::downgrade(&shared),
      job_rx,
      token_tx,
      token_rx,
    ));
    Self { shared }
  }

  /// Synchronous controller: jobs run inline on the submitter's task with
  /// no timeout measurement. Minimal latency, no isolation from the caller.
  pub fn new_sync(warn_size: usize) -> Self {
    let warn_size = if warn_size == 0 { DEFAULT_WARN_SIZE } else { warn_size };
    let (warn_tx, warn_rx) = mpsc::channel(warn_size);
    Self {
      shared: Arc::new(CtrlShared {
        queue: None,
        warn_tx,
        warn_rx: Mutex::new(Some(warn_rx)),
        in_flight: AtomicI64::new(0),
        max_block: 1,
        timeout: Duration::ZERO,
      }),
    }
  }

  /// Hand over the warning receiver. May be taken once; a second call is a
  /// programmer error and panics.
  pub fn warnings(&self) -> Receiver<Warning> {
    self
      .shared
      .warn_rx
      .lock()
      .unwrap()
      .take()
      .expect("warning receiver already taken")
  }

  /// Enqueue a packaged job. Blocks for queue space in asynchronous mode —
  /// this is the back-pressure felt by whoever drove the state machine
  /// event — or runs the job inline in synchronous mode.
  pub(crate) async fn submit(&self, job: Job) {
    match &self.shared.queue {
      Some(tx) => {
        let _ = tx.send(job).await;
      }
      None => run_inline(job).await,
    }
  }

  pub(crate) fn warn(&self, kind: WarnKind, state_id: StateID) {
    self.shared.send_warning(kind, state_id);
  }
}

async fn run_inline(job: Job) {
  let Job { run_hook, ret_hook, payload, .. } = job;
  if let Some(hook) = run_hook {
    hook();
  }
  let _ = AssertUnwindSafe(payload).catch_unwind().await;
  if let Some(hook) = ret_hook {
    hook(false);
  }
}

async fn run_dispatcher(
  shared: Weak<CtrlShared>,
  mut jobs: Receiver<Job>,
  token_tx: Sender<()>,
  mut token_rx: Receiver<()>,
) {
  // The queue sender lives in CtrlShared; once every controller handle is
  // gone recv returns None and the task winds down.
  while let Some(job) = jobs.recv().await {
    if token_rx.recv().await.is_none() {
      return;
    }
    let Some(shared) = shared.upgrade() else { return };
    shared.in_flight.fetch_add(1, Ordering::AcqRel);
    trace!("observer controller: dispatching {:?} job", job.kind);
    tokio::spawn(run_packed(shared, token_tx.clone(), job));
  }
}

/// Releases the return token and fires the job's completion hook exactly
/// once, no matter how the job body unwinds.
struct JobGuard {
  shared: Arc<CtrlShared>,
  token_tx: Sender<()>,
  ret_hook: Option<RetHook>,
  dec_in_flight: bool,
  timed_out: bool,
}

impl Drop for JobGuard {
  fn drop(&mut self) {
    if self.dec_in_flight {
      self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    if let Some(hook) = self.ret_hook.take() {
      hook(self.timed_out);
    }
    let _ = self.token_tx.try_send(());
  }
}

async fn run_packed(shared: Arc<CtrlShared>, token_tx: Sender<()>, job: Job) {
  let Job { state_id, kind, run_hook, ret_hook, payload } = job;
  let mut guard = JobGuard {
    shared: shared.clone(),
    token_tx,
    ret_hook,
    dec_in_flight: true,
    timed_out: false,
  };
  if let Some(hook) = run_hook {
    hook();
  }
  if shared.timeout.is_zero() {
    let _ = AssertUnwindSafe(payload).catch_unwind().await;
    drop(guard);
    return;
  }
  let mut handle = tokio::spawn(payload);
  tokio::select! {
    _ = &mut handle => {
      drop(guard);
    }
    _ = sleep(shared.timeout) => {
      shared.send_warning(kind, state_id);
      if shared.in_flight.load(Ordering::Acquire) >= shared.max_block {
        // Too many stragglers already: report it and hold the pipeline
        // until this handler comes back.
        shared.send_warning(WarnKind::MaxBlocking, state_id);
        let _ = handle.await;
        guard.timed_out = true;
        drop(guard);
      } else {
        // Leave the handler running; it settles the in-flight count
        // whenever it finally returns.
        guard.dec_in_flight = false;
        guard.timed_out = true;
        drop(guard);
        let straggler = shared.clone();
        tokio::spawn(async move {
          let _ = handle.await;
          straggler.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
      }
    }
  }
}
