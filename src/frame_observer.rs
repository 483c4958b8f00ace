use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures::future::BoxFuture;

use crate::error::Error;
use crate::frame_ticker::{FrameTicker, Tickable};
use crate::obs_controller::{Job, ObsController, RetHook, RunHook, WarnKind};
use crate::observer::{FrameEvent, FrameFn, ObEvent, ProtectedHook, StateObserver};
use crate::state_machine::StateID;

struct FrameCache<O, T> {
  owner: Option<O>,
  val: Option<T>,
  fev: FrameEvent,
}

/// Observer whose value is sampled on each ticker pulse instead of being
/// streamed per event.
///
/// Lifecycle events only refresh a small cached snapshot and classify the
/// next frame (`Enter` after selection, `Update` after a set, `Idle`
/// otherwise); the ticker drives the actual delivery through the
/// controller, one frame per pulse for the machine's active state.
pub struct FrameObserver<O, T> {
  ctrl: ObsController,
  ticker: FrameTicker,
  handler: FrameFn<O, T>,
  hook: Option<ProtectedHook<O, T>>,
  bound: OnceLock<StateID>,
  cache: Mutex<FrameCache<O, T>>,
  self_ref: Weak<FrameObserver<O, T>>,
}

impl<O, T> FrameObserver<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn create<F, Fut>(
    ctrl: &ObsController,
    ticker: &FrameTicker,
    handler: F,
    hook: Option<ProtectedHook<O, T>>,
  ) -> Arc<Self>
  where
    F: Fn(O, FrameEvent, StateID, i64, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let handler: FrameFn<O, T> =
      Arc::new(move |o, ev, id, skipped, v| Box::pin(handler(o, ev, id, skipped, v)));
    Arc::new_cyclic(|weak| Self {
      ctrl: ctrl.clone(),
      ticker: ticker.clone(),
      handler,
      hook,
      bound: OnceLock::new(),
      cache: Mutex::new(FrameCache { owner: None, val: None, fev: FrameEvent::Free }),
      self_ref: weak.clone(),
    })
  }

  /// Run the lifecycle hook for `which`; `None` means the event was
  /// skipped and the cache must stay untouched.
  fn apply_hook(&self, which: ObEvent, owner: &O, id: StateID, val: T) -> Option<T> {
    match &self.hook {
      Some(hook) => {
        let (val, skip) = hook.apply(which, owner.clone(), id, val);
        if skip {
          None
        } else {
          Some(val)
        }
      }
      None => Some(val),
    }
  }

  fn store(&self, owner: O, val: T, fev: Option<FrameEvent>) {
    let mut cache = self.cache.lock().unwrap();
    cache.owner = Some(owner);
    cache.val = Some(val);
    if let Some(fev) = fev {
      cache.fev = fev;
    }
  }
}

impl<O, T> StateObserver<O, T> for FrameObserver<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn start_ob(
    &self,
    owner: O,
    id: StateID,
    val: T,
    selected: bool,
  ) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
      if self.bound.set(id).is_err() {
        return Err(Error::AlreadyBound);
      }
      let val = match (&self.hook, selected) {
        (Some(hook), true) => hook.apply_init(owner.clone(), id, val),
        _ => val,
      };
      self.store(owner, val, selected.then_some(FrameEvent::Enter));
      if selected {
        if let Some(me) = self.self_ref.upgrade() {
          self.ticker.switch_to(me, id).await;
        }
      }
      Ok(())
    })
  }

  fn enter(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(val) = self.apply_hook(ObEvent::Enter, &owner, id, val) else {
        return;
      };
      self.store(owner, val, Some(FrameEvent::Enter));
      if let Some(me) = self.self_ref.upgrade() {
        self.ticker.switch_to(me, id).await;
      }
    })
  }

  fn exit(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(val) = self.apply_hook(ObEvent::Exit, &owner, id, val) else {
        return;
      };
      // no ticker change: the entering state's observer takes the slot
      self.store(owner, val, None);
    })
  }

  fn pick(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(val) = self.apply_hook(ObEvent::Pick, &owner, id, val) else {
        return;
      };
      self.store(owner, val, None);
    })
  }

  fn update(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(val) = self.apply_hook(ObEvent::Update, &owner, id, val) else {
        return;
      };
      self.store(owner, val, Some(FrameEvent::Update));
    })
  }
}

impl<O, T> Tickable for FrameObserver<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn tick(&self, run_hook: RunHook, ret_hook: RetHook) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(&id) = self.bound.get() else {
        // never attached; settle the ticker's accounting and bail
        run_hook();
        ret_hook(false);
        return;
      };
      let Some(me) = self.self_ref.upgrade() else {
        run_hook();
        ret_hook(false);
        return;
      };

      // The sample is taken inside the job, right before the payload: the
      // pre-payload hook reads the skip counter, takes the pending frame
      // classification and runs the ticker's frame accounting; the payload
      // then delivers what was sampled.
      type Sample<O, T> = (O, FrameEvent, i64, T);
      let slot: Arc<Mutex<Option<Sample<O, T>>>> = Arc::new(Mutex::new(None));

      let fill = slot.clone();
      let sampler = me.clone();
      let composed: RunHook = Box::new(move || {
        let skipped = sampler.ticker.skipped_frames();
        let mut cache = sampler.cache.lock().unwrap();
        let fev = std::mem::replace(&mut cache.fev, FrameEvent::Idle);
        if let (Some(owner), Some(val)) = (cache.owner.clone(), cache.val.clone()) {
          *fill.lock().unwrap() = Some((owner, fev, skipped, val));
        }
        drop(cache);
        run_hook();
      });

      let payload = {
        let me = me.clone();
        Box::pin(async move {
          let sample = slot.lock().unwrap().take();
          if let Some((owner, fev, skipped, val)) = sample {
            (me.handler)(owner, fev, id, skipped, val).await;
          }
        })
      };

      self
        .ctrl
        .submit(Job {
          state_id: id,
          kind: WarnKind::FrameTimeout,
          run_hook: Some(composed),
          ret_hook: Some(ret_hook),
          payload,
        })
        .await;
    })
  }

  fn skip_warn(&self) {
    if let Some(id) = self.bound.get() {
      self.ctrl.warn(WarnKind::FrameSkip, *id);
    }
  }
}
