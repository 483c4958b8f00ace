//! Shared periodic pulse that drives frame observers, multiplexed over the
//! currently active state of every machine that registered one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use log::{debug, trace};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::error::Error;
use crate::obs_controller::{RetHook, RunHook};
use crate::state_machine::StateID;

pub const MIN_FRAME_RATE: f32 = 0.01;
pub const MAX_FRAME_RATE: f32 = 200.0;

/// The ticker-facing side of a frame observer.
pub(crate) trait Tickable: Send + Sync {
  /// Deliver one frame. `run_hook` is the ticker's frame accounting and
  /// must run ahead of the user payload; `ret_hook` is its completion
  /// accounting and fires when the controller is done with the job.
  fn tick(&self, run_hook: RunHook, ret_hook: RetHook) -> BoxFuture<'_, ()>;

  /// Report a frame that could not be delivered because the previous one
  /// is still in flight.
  fn skip_warn(&self);
}

enum PulseCtl {
  Rebind(Duration),
  Halt,
}

struct TickerShared {
  /// Active tickable per machine serial. Weak so a dropped observer
  /// expires instead of being kept alive by its ticker.
  tickables: RwLock<HashMap<u32, Weak<dyn Tickable>>>,
  in_progress: AtomicI64,
  tick_count: AtomicI64,
  total_frames: AtomicI64,
  skipped: AtomicI64,
  total_skipped: AtomicI64,
  rate: Mutex<f32>,
  pulse: Mutex<Option<UnboundedSender<PulseCtl>>>,
}

/// Shared frame pulse at a fixed rate within `[0.01, 200]` frames per
/// second. Cloning is cheap; all clones drive the same pulse.
///
/// The pulse task starts lazily with the first registered observer. A tick
/// that finds the previous tick's handlers still running delivers nothing
/// and is counted as skipped.
pub struct FrameTicker {
  shared: Arc<TickerShared>,
}

impl Clone for FrameTicker {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

fn period_of(rate: f32) -> Duration {
  Duration::from_millis((1000.0 / rate).round() as u64)
}

impl FrameTicker {
  pub fn new(rate: f32) -> Result<Self, Error> {
    if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&rate) {
      return Err(Error::InvalidFrameRate);
    }
    Ok(Self {
      shared: Arc::new(TickerShared {
        tickables: RwLock::new(HashMap::new()),
        in_progress: AtomicI64::new(0),
        tick_count: AtomicI64::new(0),
        total_frames: AtomicI64::new(0),
        skipped: AtomicI64::new(0),
        total_skipped: AtomicI64::new(0),
        rate: Mutex::new(rate),
        pulse: Mutex::new(None),
      }),
    })
  }

  /// Halt the pulse. Counters keep their last values and in-flight frame
  /// jobs are left alone; [`reset`](Self::reset) revives the pulse.
  pub fn stop(&self) {
    if let Some(tx) = self.shared.pulse.lock().unwrap().as_ref() {
      debug!("frame ticker: halting pulse");
      let _ = tx.send(PulseCtl::Halt);
    }
  }

  /// Rebind the pulse period, using `rate` when nonzero or the current
  /// rate otherwise. Fails with [`Error::NoBound`] when the ticker has
  /// never started.
  pub fn reset(&self, rate: f32) -> Result<(), Error> {
    let pulse = self.shared.pulse.lock().unwrap();
    let Some(tx) = pulse.as_ref() else {
      return Err(Error::NoBound);
    };
    let mut cur = self.shared.rate.lock().unwrap();
    let rate = if rate == 0.0 { *cur } else { rate };
    if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&rate) {
      return Err(Error::InvalidFrameRate);
    }
    *cur = rate;
    debug!("frame ticker: rebinding at {} fps", rate);
    let _ = tx.send(PulseCtl::Rebind(period_of(rate)));
    Ok(())
  }

  /// Frames skipped since the last fully delivered frame.
  pub fn skipped_frames(&self) -> i64 {
    self.shared.skipped.load(Ordering::Acquire)
  }

  pub fn total_skipped(&self) -> i64 {
    self.shared.total_skipped.load(Ordering::Acquire)
  }

  pub fn total_frames(&self) -> i64 {
    self.shared.total_frames.load(Ordering::Acquire)
  }

  pub fn tick_count(&self) -> i64 {
    self.shared.tick_count.load(Ordering::Acquire)
  }

  /// Make `tickable` the active frame target for the machine that owns
  /// `id`, replacing whatever was active for that machine before. The
  /// first call starts the pulse.
  pub(crate) async fn switch_to(&self, tickable: Arc<dyn Tickable>, id: StateID) {
    {
      let mut map = self.shared.tickables.write().await;
      map.retain(|_, t| t.upgrade().is_some());
      map.insert(id.sm_serial, Arc::downgrade(&tickable));
    }
    self.ensure_started();
  }

  fn ensure_started(&self) {
    let mut pulse = self.shared.pulse.lock().unwrap();
    if pulse.is_some() {
      return;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let period = period_of(*self.shared.rate.lock().unwrap());
    debug!("frame ticker: starting pulse every {:?}", period);
    tokio::spawn(run_pulse(Arc::downgrade(&self.shared), period, rx));
    *pulse = Some(tx);
  }
}

async fn run_pulse(
  shared: Weak<TickerShared>,
  period: Duration,
  mut ctl: UnboundedReceiver<PulseCtl>,
) {
  let mut timer = interval_at(Instant::now() + period, period);
  timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
  let mut running = true;
  loop {
    tokio::select! {
      _ = timer.tick(), if running => {
        let Some(shared) = shared.upgrade() else { return };
        process_tick(&shared).await;
      }
      msg = ctl.recv() => match msg {
        Some(PulseCtl::Rebind(period)) => {
          timer = interval_at(Instant::now() + period, period);
          timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
          running = true;
        }
        Some(PulseCtl::Halt) => {
          running = false;
        }
        // every ticker handle is gone
        None => return,
      },
    }
  }
}

async fn process_tick(shared: &Arc<TickerShared>) {
  shared.tick_count.fetch_add(1, Ordering::AcqRel);
  let map = shared.tickables.read().await;
  let alive: Vec<Arc<dyn Tickable>> = map.values().filter_map(Weak::upgrade).collect();
  if alive.is_empty() {
    return;
  }
  let frame_width = alive.len() as i64;
  if shared
    .in_progress
    .compare_exchange(0, frame_width, Ordering::AcqRel, Ordering::Acquire)
    .is_ok()
  {
    // One countdown across the whole frame: the tickable that runs last
    // closes the frame, counting it and clearing the skip counter.
    let remaining = Arc::new(AtomicI64::new(frame_width));
    for tickable in &alive {
      let acct = shared.clone();
      let countdown = remaining.clone();
      let run_hook: RunHook = Box::new(move || {
        if countdown.fetch_sub(1, Ordering::AcqRel) == 1 {
          acct.total_frames.fetch_add(1, Ordering::AcqRel);
          acct.skipped.store(0, Ordering::Release);
        }
      });
      let acct = shared.clone();
      let ret_hook: RetHook = Box::new(move |_timed_out| {
        acct.in_progress.fetch_sub(1, Ordering::AcqRel);
      });
      tickable.tick(run_hook, ret_hook).await;
    }
  } else {
    trace!("frame ticker: previous frame still in flight, skipping");
    shared.skipped.fetch_add(1, Ordering::AcqRel);
    shared.total_skipped.fetch_add(1, Ordering::AcqRel);
    for tickable in &alive {
      tickable.skip_warn();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex as StdMutex;

  use tokio::time::sleep;

  use super::*;

  /// Test tickable that accounts immediately, optionally parking its
  /// completion hooks so a frame can be held open on purpose.
  struct ImmediateTickable {
    ticks: AtomicI64,
    skips: AtomicI64,
    parked: StdMutex<Vec<RetHook>>,
    park: bool,
  }

  impl ImmediateTickable {
    fn new(park: bool) -> Arc<Self> {
      Arc::new(Self {
        ticks: AtomicI64::new(0),
        skips: AtomicI64::new(0),
        parked: StdMutex::new(Vec::new()),
        park,
      })
    }

    fn release_parked(&self) {
      for hook in self.parked.lock().unwrap().drain(..) {
        hook(false);
      }
    }
  }

  impl Tickable for ImmediateTickable {
    fn tick(&self, run_hook: RunHook, ret_hook: RetHook) -> BoxFuture<'_, ()> {
      Box::pin(async move {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        run_hook();
        if self.park {
          self.parked.lock().unwrap().push(ret_hook);
        } else {
          ret_hook(false);
        }
      })
    }

    fn skip_warn(&self) {
      self.skips.fetch_add(1, Ordering::AcqRel);
    }
  }

  #[test]
  fn rejects_out_of_range_rates() {
    assert!(matches!(FrameTicker::new(0.001), Err(Error::InvalidFrameRate)));
    assert!(matches!(FrameTicker::new(500.0), Err(Error::InvalidFrameRate)));
    assert!(matches!(FrameTicker::new(-1.0), Err(Error::InvalidFrameRate)));
    assert!(FrameTicker::new(MIN_FRAME_RATE).is_ok());
    assert!(FrameTicker::new(MAX_FRAME_RATE).is_ok());
  }

  #[test]
  fn period_rounds_to_milliseconds() {
    assert_eq!(period_of(10.0), Duration::from_millis(100));
    assert_eq!(period_of(200.0), Duration::from_millis(5));
    assert_eq!(period_of(3.0), Duration::from_millis(333));
  }

  #[tokio::test(start_paused = true)]
  async fn ticks_at_the_requested_rate() {
    let ticker = FrameTicker::new(10.0).unwrap();
    let tickable = ImmediateTickable::new(false);
    let id = StateID { sm_serial: 1, reg_index: 0 };
    ticker.switch_to(tickable.clone(), id).await;

    sleep(Duration::from_millis(1050)).await;
    let ticks = ticker.tick_count();
    assert!((9..=11).contains(&ticks), "tick count was {ticks}");
    assert_eq!(ticker.total_frames(), ticks);
    assert_eq!(ticker.total_skipped(), 0);
    assert_eq!(tickable.ticks.load(Ordering::Acquire), ticks);
  }

  #[tokio::test(start_paused = true)]
  async fn held_frames_are_skipped_and_reported() {
    let ticker = FrameTicker::new(10.0).unwrap();
    let tickable = ImmediateTickable::new(true);
    let id = StateID { sm_serial: 1, reg_index: 0 };
    ticker.switch_to(tickable.clone(), id).await;

    // first tick parks its completion; the rest of the window skips
    sleep(Duration::from_millis(450)).await;
    assert_eq!(tickable.ticks.load(Ordering::Acquire), 1);
    let skipped = ticker.skipped_frames();
    assert_eq!(skipped, 3);
    assert_eq!(ticker.total_skipped(), skipped);
    assert_eq!(tickable.skips.load(Ordering::Acquire), skipped);

    // releasing the frame lets the next tick deliver and clear the
    // per-cycle counter
    tickable.release_parked();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(tickable.ticks.load(Ordering::Acquire), 2);
    assert_eq!(ticker.skipped_frames(), 0);
    assert_eq!(ticker.total_skipped(), skipped);
  }

  #[tokio::test(start_paused = true)]
  async fn stop_freezes_and_reset_revives() {
    let ticker = FrameTicker::new(10.0).unwrap();
    let tickable = ImmediateTickable::new(false);
    let id = StateID { sm_serial: 1, reg_index: 0 };
    ticker.switch_to(tickable.clone(), id).await;

    sleep(Duration::from_millis(550)).await;
    ticker.stop();
    // let the halt land before sampling
    tokio::task::yield_now().await;
    let frozen = ticker.total_frames();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ticker.total_frames(), frozen);

    let before = ticker.tick_count();
    ticker.reset(20.0).unwrap();
    sleep(Duration::from_millis(1025)).await;
    let advanced = ticker.tick_count() - before;
    assert!((19..=21).contains(&advanced), "advanced by {advanced}");
  }

  #[tokio::test]
  async fn reset_before_start_is_an_error() {
    let ticker = FrameTicker::new(10.0).unwrap();
    assert!(matches!(ticker.reset(20.0), Err(Error::NoBound)));
  }

  #[tokio::test(start_paused = true)]
  async fn one_ticker_multiplexes_many_machines() {
    let ticker = FrameTicker::new(10.0).unwrap();
    let first = ImmediateTickable::new(false);
    let second = ImmediateTickable::new(false);
    ticker
      .switch_to(first.clone(), StateID { sm_serial: 1, reg_index: 0 })
      .await;
    ticker
      .switch_to(second.clone(), StateID { sm_serial: 2, reg_index: 0 })
      .await;

    sleep(Duration::from_millis(1050)).await;
    let ticks = ticker.tick_count();
    // both machines get every frame, the frame itself is counted once
    assert_eq!(first.ticks.load(Ordering::Acquire), ticks);
    assert_eq!(second.ticks.load(Ordering::Acquire), ticks);
    assert_eq!(ticker.total_frames(), ticks);
  }

  #[tokio::test(start_paused = true)]
  async fn replacing_a_machines_tickable_stops_the_old_one() {
    let ticker = FrameTicker::new(10.0).unwrap();
    let old = ImmediateTickable::new(false);
    let new = ImmediateTickable::new(false);
    let serial = 1u32;
    ticker
      .switch_to(old.clone(), StateID { sm_serial: serial, reg_index: 0 })
      .await;
    sleep(Duration::from_millis(250)).await;
    let old_ticks = old.ticks.load(Ordering::Acquire);
    assert!(old_ticks >= 2);

    ticker
      .switch_to(new.clone(), StateID { sm_serial: serial, reg_index: 1 })
      .await;
    sleep(Duration::from_millis(250)).await;
    assert_eq!(old.ticks.load(Ordering::Acquire), old_ticks);
    assert!(new.ticks.load(Ordering::Acquire) >= 2);
  }
}
