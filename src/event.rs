use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::error::Error;
use crate::state_binding::StateBinding;
use crate::state_machine::StateMachine;

type EventHook<O, A, B> = Arc<dyn Fn(O, A, B) -> anyhow::Result<()> + Send + Sync>;

/// Anything that can be triggered: a single [`Event`] or a whole
/// [`EventGroup`].
pub trait Trigger: Send + Sync {
  fn trigger(&self) -> BoxFuture<'_, Result<(), Error>>;
}

struct EventShared<O, A, B> {
  sm: StateMachine<O>,
  a: StateBinding<O, A>,
  b: StateBinding<O, B>,
  hook: Mutex<Option<EventHook<O, A, B>>>,
}

/// A registered transition rule from state `A` to state `B`.
///
/// Triggering checks that `A` is the current state, runs the optional
/// guard hook over both payloads inside the machine lock, and performs the
/// exit/enter pair atomically.
pub struct Event<O, A, B> {
  shared: Arc<EventShared<O, A, B>>,
}

impl<O, A, B> Clone for Event<O, A, B> {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

/// Register a transition rule from `a` to `b` on `sm`.
///
/// Panics if either binding belongs to a different machine; that is a
/// wiring bug, not a runtime condition.
pub fn register_event<O, A, B>(
  sm: &StateMachine<O>,
  a: &StateBinding<O, A>,
  b: &StateBinding<O, B>,
) -> Event<O, A, B>
where
  O: Clone + Send + Sync + 'static,
  A: Clone + Send + Sync + 'static,
  B: Clone + Send + Sync + 'static,
{
  assert!(
    Arc::ptr_eq(&a.parent().shared, &sm.shared),
    "source state is not owned by this state machine"
  );
  assert!(
    Arc::ptr_eq(&b.parent().shared, &sm.shared),
    "destination state is not owned by this state machine"
  );
  Event {
    shared: Arc::new(EventShared {
      sm: sm.clone(),
      a: a.clone(),
      b: b.clone(),
      hook: Mutex::new(None),
    }),
  }
}

impl<O, A, B> Event<O, A, B>
where
  O: Clone + Send + Sync + 'static,
  A: Clone + Send + Sync + 'static,
  B: Clone + Send + Sync + 'static,
{
  /// Install a guard hook checked ahead of the transition. It runs under
  /// the machine lock with a consistent view of both payloads; returning an
  /// error cancels the event and hands that error to the trigger caller.
  pub fn set_hook<F>(&self, hook: F)
  where
    F: Fn(O, A, B) -> anyhow::Result<()> + Send + Sync + 'static,
  {
    *self.shared.hook.lock().unwrap() = Some(Arc::new(hook));
  }

  pub async fn trigger(&self) -> Result<(), Error> {
    let shared = self.shared.clone();
    let res = self
      .shared
      .sm
      .transform(move |cur, owner| {
        Box::pin(async move {
          if cur != shared.a.id() {
            return Err(if cur == shared.b.id() {
              Error::AlreadyChanged
            } else {
              Error::UnexpectedState
            });
          }
          let hook = shared.hook.lock().unwrap().clone();
          if let Some(hook) = hook {
            let a_val = shared.a.get().await;
            let b_val = shared.b.get().await;
            hook(owner, a_val, b_val).map_err(Error::HookRejected)?;
          }
          Ok(shared.b.id())
        })
      })
      .await;
    match res {
      // Cannot happen for an event between two distinct states; swallowed
      // so a source-equals-destination rule degrades to a no-op.
      Err(Error::NothingToDo) => Ok(()),
      other => other,
    }
  }
}

impl<O, A, B> Trigger for Event<O, A, B>
where
  O: Clone + Send + Sync + 'static,
  A: Clone + Send + Sync + 'static,
  B: Clone + Send + Sync + 'static,
{
  fn trigger(&self) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(self.trigger())
  }
}

/// An ordered fallback over several events: triggering tries each member in
/// turn and stops at the first that fires.
pub struct EventGroup {
  events: Vec<Arc<dyn Trigger>>,
}

impl EventGroup {
  pub fn new() -> Self {
    Self { events: Vec::new() }
  }

  pub fn with<E: Trigger + 'static>(mut self, event: E) -> Self {
    self.events.push(Arc::new(event));
    self
  }

  pub async fn trigger(&self) -> Result<(), Error> {
    if self.events.is_empty() {
      return Err(Error::EmptyGroup);
    }
    for event in &self.events {
      if event.trigger().await.is_ok() {
        return Ok(());
      }
    }
    Err(Error::GroupFailure)
  }
}

impl Default for EventGroup {
  fn default() -> Self {
    Self::new()
  }
}

impl Trigger for EventGroup {
  fn trigger(&self) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(self.trigger())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex as StdMutex;

  use anyhow::anyhow;

  use super::*;
  use crate::event_observer::EventObserver;
  use crate::obs_controller::ObsController;
  use crate::observer::EventHandlers;
  use crate::state_binding::register_state;

  #[tokio::test]
  async fn linear_transitions() {
    let sm = StateMachine::new(String::from("owner"));
    let a = register_state(&sm, 10i32).await;
    let b = register_state(&sm, String::from("s")).await;
    let c = register_state(&sm, 100i32).await;
    let a2b = register_event(&sm, &a, &b);
    let b2c = register_event(&sm, &b, &c);

    assert!(a2b.trigger().await.is_ok());
    assert_eq!(sm.current_state_id().await, b.id());
    assert!(matches!(a2b.trigger().await, Err(Error::AlreadyChanged)));
    assert!(b2c.trigger().await.is_ok());
    assert_eq!(sm.current_state_id().await, c.id());
    assert!(!a.is_selected().await);
    assert!(!b.is_selected().await);
    assert!(c.is_selected().await);
  }

  #[tokio::test]
  async fn trigger_from_wrong_state_is_rejected() {
    let sm = StateMachine::new(());
    let a = register_state(&sm, 1i32).await;
    let b = register_state(&sm, 2i32).await;
    let c = register_state(&sm, 3i32).await;
    let b2c = register_event(&sm, &b, &c);
    assert!(matches!(b2c.trigger().await, Err(Error::UnexpectedState)));
    assert_eq!(sm.current_state_id().await, a.id());
  }

  #[tokio::test]
  async fn hook_sees_owner_and_payloads() {
    let sm = StateMachine::new(String::from("owner-xyz"));
    let a = register_state(&sm, 10i32).await;
    let b = register_state(&sm, String::from("state-b")).await;
    let a2b = register_event(&sm, &a, &b);

    let hooked = Arc::new(AtomicBool::new(false));
    let seen = hooked.clone();
    a2b.set_hook(move |owner, av, bv| {
      assert_eq!(owner, "owner-xyz");
      assert_eq!(av, 10);
      assert_eq!(bv, "state-b");
      seen.store(true, Ordering::Release);
      Ok(())
    });
    assert!(a2b.trigger().await.is_ok());
    assert!(hooked.load(Ordering::Acquire));
    assert_eq!(sm.current_state_id().await, b.id());
  }

  #[tokio::test]
  async fn failing_hook_cancels_without_callbacks() {
    let sm = StateMachine::new(());
    let a = register_state(&sm, 1i32).await;
    let b = register_state(&sm, 2i32).await;
    let a2b = register_event(&sm, &a, &b);
    a2b.set_hook(|_, _, _| Err(anyhow!("payload not ready")));

    let seen: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
    let ctrl = ObsController::new_sync(0);
    let exits = seen.clone();
    let ob_a = EventObserver::create(
      &ctrl,
      EventHandlers::<(), i32>::new().on_exit(move |_, _, _| {
        let exits = exits.clone();
        async move {
          exits.lock().unwrap().push("exit-a");
        }
      }),
      None,
    );
    let enters = seen.clone();
    let ob_b = EventObserver::create(
      &ctrl,
      EventHandlers::<(), i32>::new().on_enter(move |_, _, _| {
        let enters = enters.clone();
        async move {
          enters.lock().unwrap().push("enter-b");
        }
      }),
      None,
    );
    a.add_observer(ob_a).await.unwrap();
    b.add_observer(ob_b).await.unwrap();

    let res = a2b.trigger().await;
    assert!(matches!(res, Err(Error::HookRejected(_))));
    assert_eq!(sm.current_state_id().await, a.id());
    assert!(a.is_selected().await);
    assert!(seen.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn group_falls_back_in_order() {
    let sm = StateMachine::new(());
    let a = register_state(&sm, 1i32).await;
    let b = register_state(&sm, 2i32).await;
    let c = register_state(&sm, 3i32).await;
    let a2b = register_event(&sm, &a, &b);
    let b2c = register_event(&sm, &b, &c);

    // move to B so the first group member cannot fire
    assert!(a2b.trigger().await.is_ok());

    let group = EventGroup::new().with(a2b.clone()).with(b2c.clone());
    assert!(group.trigger().await.is_ok());
    assert_eq!(sm.current_state_id().await, c.id());
    // in C neither member applies
    assert!(matches!(group.trigger().await, Err(Error::GroupFailure)));
  }

  #[tokio::test]
  async fn empty_group_reports_as_such() {
    let group = EventGroup::new();
    assert!(matches!(group.trigger().await, Err(Error::EmptyGroup)));
  }

  #[tokio::test]
  #[should_panic(expected = "not owned by this state machine")]
  async fn cross_machine_event_panics() {
    let sm1 = StateMachine::new(());
    let sm2 = StateMachine::new(());
    let a = register_state(&sm1, 1i32).await;
    let b = register_state(&sm2, 2i32).await;
    let _ = register_event(&sm1, &a, &b);
  }
}
