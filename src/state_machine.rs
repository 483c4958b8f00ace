use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use log::trace;
use tokio::sync::RwLock;

use crate::error::Error;

/// Identity of a registered state: the owning machine's serial number plus
/// the state's registration index within that machine.
///
/// StateIDs are plain values; they own nothing and are cheap to copy and
/// compare.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateID {
  pub sm_serial: u32,
  pub reg_index: i32,
}

impl StateID {
  /// The sentinel that represents "no valid state".
  pub fn invalid() -> StateID {
    StateID { sm_serial: 0, reg_index: -1 }
  }

  pub fn is_invalid(&self) -> bool {
    self.sm_serial == 0 || self.reg_index < 0
  }
}

/// Hand out the next process-wide machine serial.
///
/// Seeded once from a coarse clock so serials from separate runs rarely
/// collide; callers may assume uniqueness within a process, never specific
/// values.
fn next_serial() -> u32 {
  static SERIAL: OnceLock<AtomicU32> = OnceLock::new();
  let counter = SERIAL.get_or_init(|| {
    let seed = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos() as u32 & 0x7fff_ffff)
      .unwrap_or(1);
    AtomicU32::new(seed)
  });
  counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// The payload-erased face a registered state shows to its machine.
///
/// Only the machine calls these, always with its own lock held, so the
/// selection flag flip and the observer fan-out happen inside the same
/// critical section as the transition itself.
pub(crate) trait StateAgent<O>: Send + Sync {
  fn on_enter<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()>;
  fn on_exit<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()>;
  fn on_pick<'a>(&'a self, owner: &'a O) -> BoxFuture<'a, ()>;
}

pub(crate) struct Core<O> {
  pub(crate) owner: O,
  pub(crate) state_tab: Vec<Arc<dyn StateAgent<O>>>,
  pub(crate) state_on: StateID,
}

pub(crate) struct SmShared<O> {
  pub(crate) serial: u32,
  pub(crate) core: RwLock<Core<O>>,
}

/// A deterministic finite automaton over a table of typed states.
///
/// The machine owns the registered state bindings and the currently
/// selected index. All methods are safe for concurrent use; transitions
/// serialise on the machine's write lock so no observer ever sees two
/// states selected at once.
///
/// Handles are cheap to clone and all refer to the same machine.
pub struct StateMachine<O> {
  pub(crate) shared: Arc<SmShared<O>>,
}

impl<O> Clone for StateMachine<O> {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

impl<O: Clone + Send + Sync + 'static> StateMachine<O> {
  pub fn new(owner: O) -> Self {
    let serial = next_serial();
    Self {
      shared: Arc::new(SmShared {
        serial,
        core: RwLock::new(Core {
          owner,
          state_tab: Vec::new(),
          state_on: StateID { sm_serial: serial, reg_index: 0 },
        }),
      }),
    }
  }

  /// Serial number assigned at creation; never changes.
  pub fn serial(&self) -> u32 {
    self.shared.serial
  }

  pub async fn owner(&self) -> O {
    self.shared.core.read().await.owner.clone()
  }

  pub async fn set_owner(&self, owner: O) {
    self.shared.core.write().await.owner = owner;
  }

  /// ID of the selected state, or the invalid sentinel while no states are
  /// registered.
  pub async fn current_state_id(&self) -> StateID {
    let core = self.shared.core.read().await;
    if core.state_tab.is_empty() {
      return StateID::invalid();
    }
    core.state_on
  }

  /// Re-announce the current state to its observers without changing it.
  pub async fn pick_state(&self) -> Result<(), Error> {
    let core = self.shared.core.read().await;
    if core.state_tab.is_empty() {
      return Err(Error::NoState);
    }
    core.state_tab[core.state_on.reg_index as usize]
      .on_pick(&core.owner)
      .await;
    Ok(())
  }

  /// Append a state agent built by `make` under the write lock.
  ///
  /// The first registered state becomes the selection and receives a single
  /// enter dispatch right away, so "exactly one state is selected" holds
  /// from the moment any state exists.
  pub(crate) async fn reg_state<F>(&self, make: F)
  where
    F: FnOnce(StateID) -> Arc<dyn StateAgent<O>>,
  {
    let mut core = self.shared.core.write().await;
    let id = StateID {
      sm_serial: self.shared.serial,
      reg_index: core.state_tab.len() as i32,
    };
    let agent = make(id);
    core.state_tab.push(agent.clone());
    if id.reg_index == 0 {
      agent.on_enter(&core.owner).await;
    }
  }

  /// Run one guarded transition under the write lock.
  ///
  /// `decision` receives the current StateID and a clone of the owner and
  /// answers with the next StateID:
  ///
  /// - `Err(e)` cancels with that error and no side effect;
  /// - the invalid sentinel cancels silently (the caller already recorded
  ///   its own reason);
  /// - the current ID is reported as [`Error::NothingToDo`];
  /// - an index outside the table is [`Error::InvalidChange`];
  /// - anything else fires exit on the old state, moves the selection and
  ///   fires enter on the new one, all without releasing the lock.
  pub(crate) async fn transform<F>(&self, decision: F) -> Result<(), Error>
  where
    F: FnOnce(StateID, O) -> BoxFuture<'static, Result<StateID, Error>> + Send,
  {
    let mut core = self.shared.core.write().await;
    let cur = core.state_on;
    let next = decision(cur, core.owner.clone()).await?;
    if next == cur {
      return Err(Error::NothingToDo);
    }
    if next.is_invalid() {
      return Ok(());
    }
    if next.reg_index < 0 || next.reg_index as usize >= core.state_tab.len() {
      return Err(Error::InvalidChange);
    }
    trace!(
      "machine {}: state {} => {}",
      self.shared.serial,
      cur.reg_index,
      next.reg_index
    );
    let core = &mut *core;
    core.state_tab[cur.reg_index as usize].on_exit(&core.owner).await;
    core.state_on = next;
    core.state_tab[next.reg_index as usize].on_enter(&core.owner).await;
    Ok(())
  }
}
