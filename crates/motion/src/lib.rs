//! Real-time core of a three-axis CNC motion controller.
//!
//! Four cooperating components, leaves-first:
//!
//! - [`block`] — the planner ring buffer (component A): queues linear
//!   motion blocks and continuously replans junction entry velocities.
//! - [`prep`] — the segment preparer (component B): slices the head
//!   planner block into constant-rate segments following a trapezoidal
//!   velocity profile.
//! - [`stepper`] — the stepper core (component C): two interrupt-level
//!   entry points that replay segments via a multi-axis Bresenham line
//!   algorithm with AMASS oversampling.
//! - [`realtime`] — the realtime supervisor (component D): owns machine
//!   state and turns asynchronous events into pipeline control, including
//!   the homing and probing cycles.
//!
//! [`inputs`] is the thin adapter (component E) translating limit/probe
//! pin edges into sys_position/alarm/flag-word effects. [`settings`] and
//! [`hal`] are the persistence layer and hardware boundary the rest of the
//! crate is built on.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod block;
pub mod error;
pub mod hal;
pub mod inputs;
pub mod kinematics;
mod mathf;
pub mod prep;
pub mod realtime;
pub mod settings;
pub mod stepper;

pub use error::{AlarmCode, PlannerError, SettingsError};

/// Number of logical machine axes. The core is fixed to three by design
/// (Non-goal: rotational/4th axes).
pub const N_AXIS: usize = 3;

/// A machine position expressed as signed step counts, one per axis.
pub type StepPosition = [i32; N_AXIS];
