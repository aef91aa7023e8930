//! Inputs adapter (component E, §2, §4.4 boundary).
//!
//! Thin translation layer meant to be wired directly to a backend's pin-edge
//! callbacks: limit-switch transitions become alarm + reset (hard-limit
//! path, §4.4), control-pin transitions become the same realtime events the
//! serial realtime-byte path raises (§6), and probe transitions become a
//! latched `sys_position` snapshot (§4.3 step 6). Kept separate from
//! [`crate::realtime`] because these are the entry points a GPIO interrupt
//! calls directly, not the main loop.

use crate::hal::Hal;
use crate::realtime::Supervisor;
use crate::stepper::Core as StepperCore;

/// Decoded state of the four realtime control pins (§6), as delivered by
/// the HAL's `SystemControlHal` state-change callback. The backend owns the
/// bit layout of its own `get_state()`; this struct is what it decodes into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPinState {
    pub reset: bool,
    pub feed_hold: bool,
    pub cycle_start: bool,
    pub safety_door: bool,
}

/// Limit-switch pin-change callback (§4.4 hard limits). Call this from the
/// HAL's `LimitsHal` state-change callback whenever `HARD_LIMIT_ENABLE` is
/// set; the supervisor itself no-ops while homing, since homing reads the
/// limit state directly rather than through this path.
pub fn on_limit_pin_change(supervisor: &Supervisor, stepper: &StepperCore, hal: &mut impl Hal) {
    supervisor.hard_limit_triggered(stepper, hal);
}

/// Control-pin-change callback: reset / feed-hold / cycle-start / safety-door
/// lines wired directly to GPIO rather than arriving as realtime bytes over
/// serial (§6). Produces the same flag-word effects either path would.
pub fn on_control_pin_change(supervisor: &Supervisor, state: ControlPinState) {
    if state.reset {
        supervisor.reset();
    }
    if state.feed_hold {
        supervisor.request_feed_hold();
    }
    if state.cycle_start {
        supervisor.request_cycle_start();
    }
    supervisor.safety_door(state.safety_door);
}

/// Probe pin-change callback (§4.3 step 6, §4.4 probing cycle). The stepper
/// ISR samples the probe itself at interrupt priority during a real base
/// timer tick; this wraps the same latch-once semantics for callers driving
/// the pipeline without real timer interrupts (simulation, tests, or a
/// backend that polls the probe pin from the main loop instead).
pub fn on_probe_sample(supervisor: &mut Supervisor, probe_triggered: bool, stepper: &StepperCore, hal: &mut impl Hal) {
    supervisor.poll_probe(probe_triggered, stepper, hal);
}
