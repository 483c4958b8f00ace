use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Error;
use crate::state_machine::StateID;

/// Classification attached to each frame delivered to a frame observer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
  /// State is not in use. Reserved; never delivered by normal dispatch.
  Free,
  /// State selected but unchanged since the previous frame.
  Idle,
  /// First frame after the state became selected.
  Enter,
  /// First frame after the state value was updated.
  Update,
}

/// The four lifecycle moments a binding announces to its observers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ObEvent {
  Enter,
  Exit,
  Pick,
  Update,
}

/// A consumer of per-state lifecycle callbacks, attached to exactly one
/// binding for its whole life.
///
/// All methods are called by the binding with its lock held; `start_ob`
/// once at attach time, the rest on each lifecycle event. Implementations
/// must therefore stay lock-cheap and push real work through a controller.
pub trait StateObserver<O, T>: Send + Sync {
  fn start_ob(
    &self,
    owner: O,
    id: StateID,
    val: T,
    selected: bool,
  ) -> BoxFuture<'_, Result<(), Error>>;

  fn enter(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()>;
  fn exit(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()>;
  fn pick(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()>;
  fn update(&self, owner: O, id: StateID, val: T) -> BoxFuture<'_, ()>;
}

type InitFn<O, T> = Box<dyn Fn(O, StateID, T) -> T + Send + Sync>;
type TransformFn<O, T> = Box<dyn Fn(O, StateID, T) -> (T, bool) + Send + Sync>;

/// Synchronous per-event callbacks run under the binding lock, ahead of the
/// asynchronous hand-off.
///
/// Each may rewrite the payload about to be delivered, and the four
/// lifecycle ones may cancel the delivery altogether by answering
/// `skip = true`. Keep them cheap: they run inside the lock.
pub struct ProtectedHook<O, T> {
  init: Option<InitFn<O, T>>,
  enter: Option<TransformFn<O, T>>,
  exit: Option<TransformFn<O, T>>,
  pick: Option<TransformFn<O, T>>,
  update: Option<TransformFn<O, T>>,
}

impl<O, T> Default for ProtectedHook<O, T> {
  fn default() -> Self {
    Self { init: None, enter: None, exit: None, pick: None, update: None }
  }
}

impl<O, T> ProtectedHook<O, T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rewrite the value an observer latches when it attaches to an already
  /// selected state.
  pub fn init<F>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> T + Send + Sync + 'static,
  {
    self.init = Some(Box::new(f));
    self
  }

  pub fn enter<F>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> (T, bool) + Send + Sync + 'static,
  {
    self.enter = Some(Box::new(f));
    self
  }

  pub fn exit<F>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> (T, bool) + Send + Sync + 'static,
  {
    self.exit = Some(Box::new(f));
    self
  }

  pub fn pick<F>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> (T, bool) + Send + Sync + 'static,
  {
    self.pick = Some(Box::new(f));
    self
  }

  pub fn update<F>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> (T, bool) + Send + Sync + 'static,
  {
    self.update = Some(Box::new(f));
    self
  }

  pub(crate) fn apply_init(&self, owner: O, id: StateID, val: T) -> T {
    match &self.init {
      Some(f) => f(owner, id, val),
      None => val,
    }
  }

  pub(crate) fn apply(&self, which: ObEvent, owner: O, id: StateID, val: T) -> (T, bool) {
    let hook = match which {
      ObEvent::Enter => &self.enter,
      ObEvent::Exit => &self.exit,
      ObEvent::Pick => &self.pick,
      ObEvent::Update => &self.update,
    };
    match hook {
      Some(f) => f(owner, id, val),
      None => (val, false),
    }
  }
}

pub(crate) type EventFn<O, T> =
  Arc<dyn Fn(O, StateID, T) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) type FrameFn<O, T> =
  Arc<dyn Fn(O, FrameEvent, StateID, i64, T) -> BoxFuture<'static, ()> + Send + Sync>;

/// The user callbacks an [`EventObserver`](crate::event_observer::EventObserver)
/// delivers to. Any subset may be present; lifecycle events without a
/// callback are simply not submitted.
pub struct EventHandlers<O, T> {
  enter: Option<EventFn<O, T>>,
  exit: Option<EventFn<O, T>>,
  pick: Option<EventFn<O, T>>,
  update: Option<EventFn<O, T>>,
}

impl<O, T> Default for EventHandlers<O, T> {
  fn default() -> Self {
    Self { enter: None, exit: None, pick: None, update: None }
  }
}

impl<O, T> EventHandlers<O, T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_enter<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.enter = Some(Arc::new(move |o, id, v| Box::pin(f(o, id, v))));
    self
  }

  pub fn on_exit<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.exit = Some(Arc::new(move |o, id, v| Box::pin(f(o, id, v))));
    self
  }

  pub fn on_pick<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.pick = Some(Arc::new(move |o, id, v| Box::pin(f(o, id, v))));
    self
  }

  pub fn on_update<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(O, StateID, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.update = Some(Arc::new(move |o, id, v| Box::pin(f(o, id, v))));
    self
  }

  pub(crate) fn get(&self, which: ObEvent) -> Option<EventFn<O, T>> {
    match which {
      ObEvent::Enter => self.enter.clone(),
      ObEvent::Exit => self.exit.clone(),
      ObEvent::Pick => self.pick.clone(),
      ObEvent::Update => self.update.clone(),
    }
  }
}
