//! Generic observable finite-state-machine runtime.
//!
//! A [`state_machine::StateMachine`] owns typed states registered through
//! [`state_binding::register_state`]; [`event::register_event`] wires
//! guarded transitions between them. Observers attached to a binding are
//! told about enter/exit/pick/update moments through a shared
//! [`obs_controller::ObsController`], and
//! [`frame_observer::FrameObserver`]s sample the active state on each
//! pulse of a shared [`frame_ticker::FrameTicker`] instead.

pub mod error;
pub mod event;
pub mod event_observer;
pub mod frame_observer;
pub mod frame_ticker;
pub mod obs_controller;
pub mod observer;
pub mod state_binding;
pub mod state_machine;
