use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Error;
use crate::observer::StateObserver;
use crate::state_machine::{SmShared, StateAgent, StateID, StateMachine};

pub(crate) struct BindCell<O, T> {
  val: T,
  updated_at: Instant,
  selected: bool,
  obs: Vec<Arc<dyn StateObserver<O, T>>>,
}

// Lock order: when both the machine lock and a binding lock are needed,
// the machine lock MUST be taken first. Never the other way around.
pub(crate) struct BindShared<O, T> {
  id: StateID,
  parent: Weak<SmShared<O>>,
  cell: RwLock<BindCell<O, T>>,
}

/// Typed handle to one registered state.
///
/// The machine owns the underlying record; handles are cheap to clone and
/// look the machine up through a non-owning back-reference. Using a handle
/// after its machine has been dropped is a programmer error and panics.
pub struct StateBinding<O, T> {
  shared: Arc<BindShared<O, T>>,
}

impl<O, T> Clone for StateBinding<O, T> {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

/// Register a state carrying `value` and hand back its typed binding.
///
/// The first state registered into a machine becomes the selection.
pub async fn register_state<O, T>(sm: &StateMachine<O>, value: T) -> StateBinding<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  let parent = Arc::downgrade(&sm.shared);
  let mut binding = None;
  sm.reg_state(|id| {
    let shared = Arc::new(BindShared {
      id,
      parent,
      cell: RwLock::new(BindCell {
        val: value,
        updated_at: Instant::now(),
        selected: false,
        obs: Vec::new(),
      }),
    });
    binding = Some(StateBinding { shared: shared.clone() });
    shared as Arc<dyn StateAgent<O>>
  })
  .await;
  binding.unwrap()
}

impl<O, T> StateBinding<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn id(&self) -> StateID {
    self.shared.id
  }

  pub fn parent(&self) -> StateMachine<O> {
    StateMachine {
      shared: self
        .shared
        .parent
        .upgrade()
        .expect("parent state machine dropped"),
    }
  }

  pub async fn is_selected(&self) -> bool {
    self.shared.cell.read().await.selected
  }

  pub async fn get(&self) -> T {
    self.shared.cell.read().await.val.clone()
  }

  /// Instant of the most recent [`set`](Self::set); monotonically
  /// non-decreasing.
  pub async fn updated_at(&self) -> Instant {
    self.shared.cell.read().await.updated_at
  }

  /// Store a new value and announce `update` to every observer of this
  /// state. The binding lock is held across the fan-out, so updates from
  /// concurrent callers reach each observer in a single total order.
  pub async fn set(&self, val: T) {
    // Owner is snapshotted first; taking the machine lock while holding the
    // binding lock would invert the lock order.
    let owner = self.parent().owner().await;
    let mut cell = self.shared.cell.write().await;
    cell.val = val.clone();
    cell.updated_at = Instant::now();
    for ob in &cell.obs {
      ob.update(owner.clone(), self.shared.id, val.clone()).await;
    }
  }

  /// Run `f` over the owner, the state value and the selection flag as one
  /// race-free snapshot (machine read lock, then binding read lock).
  pub async fn protect<R>(&self, f: impl FnOnce(&O, &T, bool) -> R) -> R {
    let sm = self.parent();
    let core = sm.shared.core.read().await;
    let cell = self.shared.cell.read().await;
    f(&core.owner, &cell.val, cell.selected)
  }

  /// Attach an observer to this state.
  ///
  /// The observer latches this state's ID for good; attaching the same
  /// observer anywhere a second time fails with [`Error::AlreadyBound`].
  pub async fn add_observer(&self, ob: Arc<dyn StateObserver<O, T>>) -> Result<(), Error> {
    let owner = self.parent().owner().await;
    let mut cell = self.shared.cell.write().await;
    ob.start_ob(owner, self.shared.id, cell.val.clone(), cell.selected)
      .await?;
    cell.obs.push(ob);
    Ok(())
  }
}

impl<O, T> StateAgent<O> for BindShared<O, T>
where
  O: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn on_enter<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()> {
    Box::pin(async move {
      let mut cell = self.cell.write().await;
      cell.selected = true;
      let val = cell.val.clone();
      for ob in &cell.obs {
        ob.enter(owner.clone(), self.id, val.clone()).await;
      }
    })
  }

  fn on_exit<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()> {
    Box::pin(async move {
      let mut cell = self.cell.write().await;
      cell.selected = false;
      let val = cell.val.clone();
      for ob in &cell.obs {
        ob.exit(owner.clone(), self.id, val.clone()).await;
      }
    })
  }

  fn on_pick<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()> {
    Box::pin(async move {
      let cell = self.cell.read().await;
      for ob in &cell.obs {
        ob.pick(owner.clone(), self.id, cell.val.clone()).await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::event_observer::EventObserver;
  use crate::obs_controller::ObsController;
  use crate::observer::EventHandlers;

  #[tokio::test]
  async fn first_registered_state_is_selected() {
    let sm = StateMachine::new(String::from("owner"));
    let a = register_state(&sm, 10i32).await;
    let b = register_state(&sm, String::from("idle")).await;
    assert!(a.is_selected().await);
    assert!(!b.is_selected().await);
    assert_eq!(sm.current_state_id().await, a.id());
    assert_eq!(a.id().sm_serial, sm.serial());
    assert_eq!(a.id().reg_index, 0);
    assert_eq!(b.id().reg_index, 1);
  }

  #[tokio::test]
  async fn set_replaces_value_and_bumps_timestamp() {
    let sm = StateMachine::new(());
    let bind = register_state(&sm, 1i32).await;
    let before = bind.updated_at().await;
    bind.set(2).await;
    assert_eq!(bind.get().await, 2);
    assert!(bind.updated_at().await >= before);
  }

  #[tokio::test]
  async fn protect_sees_owner_value_and_selection() {
    let sm = StateMachine::new(String::from("owner-x"));
    let a = register_state(&sm, 10i32).await;
    let b = register_state(&sm, 20i32).await;
    a.protect(|owner, v, selected| {
      assert_eq!(owner, "owner-x");
      assert_eq!(*v, 10);
      assert!(selected);
    })
    .await;
    b.protect(|_, v, selected| {
      assert_eq!(*v, 20);
      assert!(!selected);
    })
    .await;
  }

  #[tokio::test]
  async fn update_fans_out_in_order() {
    let sm = StateMachine::new(());
    let bind = register_state(&sm, 0i32).await;
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let ctrl = ObsController::new_sync(0);
    let record = seen.clone();
    let ob = EventObserver::create(
      &ctrl,
      EventHandlers::<(), i32>::new().on_update(move |_, _, v| {
        let record = record.clone();
        async move {
          record.lock().unwrap().push(v);
        }
      }),
      None,
    );
    bind.add_observer(ob).await.unwrap();
    bind.set(1).await;
    bind.set(2).await;
    bind.set(3).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn observer_cannot_bind_twice() {
    let sm = StateMachine::new(());
    let a = register_state(&sm, 1i32).await;
    let b = register_state(&sm, 2i32).await;
    let ctrl = ObsController::new_sync(0);
    let ob = EventObserver::create(&ctrl, EventHandlers::<(), i32>::new(), None);
    assert!(a.add_observer(ob.clone()).await.is_ok());
    assert!(matches!(
      b.add_observer(ob).await,
      Err(Error::AlreadyBound)
    ));
  }
}
