//! Error and alarm types shared across the motion pipeline.

/// Errors returned synchronously by planner operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PlannerError {
    /// The planner ring is full; the block was not enqueued.
    QueueFull,
    /// The move has a zero step-event count and was not enqueued.
    EmptyBlock,
}

/// Errors from the settings/persistence layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SettingsError {
    /// The record's trailing checksum did not match its payload.
    ChecksumMismatch,
}

/// Latched alarm codes. Unlike `PlannerError`, an alarm is machine *state*:
/// it is read via [`crate::realtime::Supervisor::alarm`], not returned from a call.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum AlarmCode {
    HardLimit,
    SoftLimit,
    HomingFailReset,
    HomingFailDoor,
    HomingFailPulloff,
    HomingFailApproach,
    AbortCycle,
    ProbeFailInitial,
    ProbeFailContact,
}
