//! In-process simulation of the motion pipeline against a fake HAL.
//!
//! Drives [`motion::block::Planner`], [`motion::prep::Preparer`] and
//! [`motion::stepper::Core`] by hand-ticking the same two entry points a
//! real backend would call from interrupt context, so the scenarios in
//! `tests/` exercise the actual pipeline rather than a model of it.

pub mod fake_hal;
pub mod harness;

pub use fake_hal::FakeHal;
pub use harness::Harness;
