use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;

use crate::error::Error;
use crate::obs_controller::{Job, ObsController, WarnKind};
use crate::observer::{EventHandlers, ObEvent, ProtectedHook, StateObserver};
use crate::state_machine::StateID;

/// Observer that forwards each lifecycle event of one state to user
/// callbacks through a controller.
///
/// The hook runs synchronously at the fan-out site; the callback itself is
/// packaged and delivered asynchronously, so a slow callback never stalls
/// the machine that produced the event.
pub struct EventObserver<O, T> {
  ctrl: ObsController,
  handlers: EventHandlers<O, T>,
  hook: Option<ProtectedHook<O, T>>,
  bound: OnceLock<StateID>,
}

impl<O, T> EventObserver<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn create(
    ctrl: &ObsController,
    handlers: EventHandlers<O, T>,
    hook: Option<ProtectedHook<O, T>>,
  ) -> Arc<Self> {
    Arc::new(Self {
      ctrl: ctrl.clone(),
      handlers,
      hook,
      bound: OnceLock::new(),
    })
  }

  fn deliver(&self, which: ObEvent, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      let Some(handler) = self.handlers.get(which) else {
        return;
      };
      let val = match &self.hook {
        Some(hook) => {
          let (val, skip) = hook.apply(which, owner.clone(), id, val);
          if skip {
            return;
          }
          val
        }
        None => val,
      };
      let kind = match which {
        ObEvent::Enter => WarnKind::EnterTimeout,
        ObEvent::Exit => WarnKind::ExitTimeout,
        ObEvent::Pick => WarnKind::PickTimeout,
        ObEvent::Update => WarnKind::UpdateTimeout,
      };
      self
        .ctrl
        .submit(Job {
          state_id: id,
          kind,
          run_hook: None,
          ret_hook: None,
          payload: handler(owner, id, val),
        })
        .await;
    })
  }
}

impl<O, T> StateObserver<O, T> for EventObserver<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn start_ob(
    &self,
    _owner: O,
    id: StateID,
    _val: T,
    _selected: bool,
  ) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move { self.bound.set(id).map_err(|_| Error::AlreadyBound) })
  }

  fn enter(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    self.deliver(ObEvent::Enter, owner, id, val)
  }

  fn exit(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    self.deliver(ObEvent::Exit, owner, id, val)
  }

  fn pick(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    self.deliver(ObEvent::Pick, owner, id, val)
  }

  fn update(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()> {
    self.deliver(ObEvent::Update, owner, id, val)
  }
}
