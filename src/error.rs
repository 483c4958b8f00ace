use thiserror::Error;

/// Recoverable failures surfaced by state machines, events, observers and
/// frame tickers.
///
/// Programmer errors (registering an event across two machines, using a
/// binding after its machine was dropped) panic instead; they are bugs,
/// not conditions to branch on.
#[derive(Error, Debug)]
pub enum Error {
  #[error("already on target state")]
  AlreadyChanged,

  #[error("invalid target state to change")]
  InvalidChange,

  #[error("nothing to change")]
  NothingToDo,

  #[error("unexpected current state")]
  UnexpectedState,

  #[error("no states registered in state machine")]
  NoState,

  #[error("event group is empty")]
  EmptyGroup,

  #[error("no event in the group could fire")]
  GroupFailure,

  #[error("frame rate out of range")]
  InvalidFrameRate,

  #[error("ticker has never been started")]
  NoBound,

  #[error("observer is already bound to a state")]
  AlreadyBound,

  #[error("event hook rejected the transition: {0}")]
  HookRejected(anyhow::Error),
}
