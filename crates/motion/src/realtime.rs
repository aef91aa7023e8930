//! Realtime supervisor (component D, §4.4): machine state and the
//! asynchronous event handlers that drive the rest of the pipeline.
//!
//! Unlike [`crate::block`]/[`crate::prep`], several entry points here
//! (the ones fielding a pin-change event) are meant to be called from
//! interrupt context, so flag/state mutation goes through
//! `critical_section`.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::block::{ConditionFlags, LineData, Planner};
use crate::error::AlarmCode;
use crate::hal::{axis_bit, AxisMask, Hal, LimitsHal};
use crate::kinematics::Kinematics;
use crate::mathf::sqrtf;
use crate::prep::Preparer;
use crate::settings::Settings;
use crate::stepper::Core as StepperCore;
use crate::{N_AXIS, StepPosition};

/// Coarse machine state (§4.4). Finer detail (which alarm, which override
/// percentages) lives alongside it in [`Supervisor`] rather than as extra
/// enum variants, matching the upstream split between `sys.state` and the
/// separate `exec_*` flag words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum MachineState {
    Idle,
    Cycle,
    Hold,
    Jog,
    Homing,
    Alarm,
    CheckMode,
    SafetyDoor,
    Sleep,
}

const HOMING_AXIS_SEARCH_SCALAR: f32 = 1.5;
const HOMING_AXIS_LOCATE_SCALAR: f32 = 5.0;

/// Per-step delay, in whole milliseconds, that paces a bit-banged homing
/// move at `rate` mm/min: the fastest axis in `axes` sets the step rate in
/// Hz, which the delay is the reciprocal of.
fn homing_step_delay_ms(axes: &[usize], rate: f32, settings: &Settings) -> u16 {
    let steps_per_mm_max = axes.iter().map(|&a| settings.steps_per_mm[a]).fold(1.0f32, f32::max);
    let step_rate_hz = (rate.max(1.0) / 60.0 * steps_per_mm_max).max(1.0);
    (1000.0 / step_rate_hz).max(1.0) as u16
}

/// Read-only snapshot handed to the external status reporter (§6).
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub state: MachineState,
    pub alarm: Option<AlarmCode>,
    pub position: StepPosition,
    pub feed_override_pct: u8,
    pub rapid_override_pct: u8,
    pub spindle_override_pct: u8,
    pub planner_blocks_queued: usize,
}

struct Flags {
    state: MachineState,
    alarm: Option<AlarmCode>,
    cycle_start_pending: bool,
    feed_hold_pending: bool,
    safety_door_open: bool,
    reset_pending: bool,
    motion_cancel_pending: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            state: MachineState::Idle,
            alarm: None,
            cycle_start_pending: false,
            feed_hold_pending: false,
            safety_door_open: false,
            reset_pending: false,
            motion_cancel_pending: false,
        }
    }
}

/// Owns machine state and coordinates the planner, preparer, and stepper
/// core in response to realtime events. `sys_position` itself lives on
/// [`StepperCore`] (it is only ever mutated synchronously with a step
/// pulse, per §3 invariant 3) — methods here that need it take the
/// stepper core as a parameter rather than keeping a second copy that
/// could drift from what was actually stepped.
pub struct Supervisor {
    flags: Mutex<RefCell<Flags>>,
    probe_position: Option<StepPosition>,
    /// `sys_probe_state == PROBE_ACTIVE`: only set while a probing move
    /// (§4.4 `probe`) is in flight, so [`Self::poll_probe`] ignores probe-pin
    /// activity outside of it.
    probe_armed: bool,
    /// Set while a jog cancel (§4.4 `motion_cancel`) is ramping down;
    /// main-loop-only (unlike the flag word above) since it is only ever
    /// read and written from [`Self::service`].
    canceling_jog: bool,
    feed_override_pct: u8,
    rapid_override_pct: u8,
    spindle_override_pct: u8,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            flags: Mutex::new(RefCell::new(Flags::default())),
            probe_position: None,
            probe_armed: false,
            canceling_jog: false,
            feed_override_pct: 100,
            rapid_override_pct: 100,
            spindle_override_pct: 100,
        }
    }

    pub fn state(&self) -> MachineState {
        critical_section::with(|cs| self.flags.borrow(cs).borrow().state)
    }

    pub fn alarm(&self) -> Option<AlarmCode> {
        critical_section::with(|cs| self.flags.borrow(cs).borrow().alarm)
    }

    fn set_state(&self, state: MachineState) {
        critical_section::with(|cs| self.flags.borrow(cs).borrow_mut().state = state);
    }

    fn set_alarm(&self, code: AlarmCode) {
        #[cfg(feature = "defmt-logging")]
        defmt::error!("alarm raised: {}", code);
        critical_section::with(|cs| {
            let mut f = self.flags.borrow(cs).borrow_mut();
            f.alarm = Some(code);
            f.state = MachineState::Alarm;
        });
    }

    /// Clears the alarm/reset condition and returns the machine to idle.
    /// Does not touch settings or the planner ring's contents; the caller
    /// is expected to have already cleared those via [`Self::reset`].
    pub fn clear_alarm(&self) {
        #[cfg(feature = "defmt-logging")]
        defmt::debug!("alarm cleared, returning to idle");
        critical_section::with(|cs| {
            let mut f = self.flags.borrow(cs).borrow_mut();
            f.alarm = None;
            f.state = MachineState::Idle;
            f.reset_pending = false;
        });
    }

    /// Soft reset: interrupt-safe, may be called from any context. Actually
    /// stopping motion happens on the next main-loop pass via
    /// [`Self::service`], mirroring the upstream two-phase reset.
    pub fn reset(&self) {
        critical_section::with(|cs| self.flags.borrow(cs).borrow_mut().reset_pending = true);
    }

    pub fn request_cycle_start(&self) {
        critical_section::with(|cs| self.flags.borrow(cs).borrow_mut().cycle_start_pending = true);
    }

    pub fn request_feed_hold(&self) {
        critical_section::with(|cs| self.flags.borrow(cs).borrow_mut().feed_hold_pending = true);
    }

    /// Jog-cancel byte (`0x85`, §6): ramps the in-flight jog move down like
    /// a feed hold, but purges it (and any still-queued jog blocks) instead
    /// of parking in `Hold` once it stops (§4.4 `motion_cancel`).
    pub fn request_motion_cancel(&self) {
        critical_section::with(|cs| self.flags.borrow(cs).borrow_mut().motion_cancel_pending = true);
    }

    /// Safety door pin edge. `open = true` forces an immediate feed hold
    /// and transitions to `SafetyDoor`; `open = false` just clears the
    /// latch; resuming motion still requires a cycle-start.
    pub fn safety_door(&self, open: bool) {
        critical_section::with(|cs| {
            let mut f = self.flags.borrow(cs).borrow_mut();
            f.safety_door_open = open;
            if open {
                f.state = MachineState::SafetyDoor;
                f.feed_hold_pending = true;
            }
        });
    }

    /// Main-loop housekeeping: drains pending realtime flags and drives the
    /// corresponding state transition. Call once per main-loop iteration.
    pub fn service(
        &mut self,
        stepper: &StepperCore,
        hal: &mut impl Hal,
        planner: &mut Planner,
        prep: &mut Preparer,
        settings: &Settings,
    ) {
        let (reset, hold, cycle_start, door_open, motion_cancel) = critical_section::with(|cs| {
            let mut f = self.flags.borrow(cs).borrow_mut();
            let out = (
                f.reset_pending,
                f.feed_hold_pending,
                f.cycle_start_pending,
                f.safety_door_open,
                f.motion_cancel_pending,
            );
            f.reset_pending = false;
            f.feed_hold_pending = false;
            f.cycle_start_pending = false;
            f.motion_cancel_pending = false;
            out
        });

        if reset {
            #[cfg(feature = "defmt-logging")]
            defmt::debug!("reset: tearing down pipeline");
            stepper.stop(hal);
            planner.clear();
            prep.reset();
            self.canceling_jog = false;
            self.probe_armed = false;
            self.set_state(MachineState::Idle);
            return;
        }

        if motion_cancel && self.state() == MachineState::Jog {
            #[cfg(feature = "defmt-logging")]
            defmt::debug!("motion cancel: ramping down jog");
            prep.begin_hold();
            self.canceling_jog = true;
        }

        if hold {
            if self.state() == MachineState::SafetyDoor {
                // Door escalation: a full, immediate stop stands in for the
                // optional parking retract (§4.4/§9 Parking) this core does
                // not generate; `save_partial`/`restore_partial` preserve the
                // interrupted program move across it.
                stepper.stop(hal);
                prep.save_partial();
            } else if self.state() != MachineState::Jog {
                // Plain feed hold (§4.2 "Hold mode"): the in-flight block
                // decelerates to zero under its own acceleration limit rather
                // than stopping instantly, so the stepper keeps running
                // whatever is already queued and simply runs out of segments
                // once the ramp reaches zero.
                self.set_state(MachineState::Hold);
                prep.begin_hold();
            }
        }

        if cycle_start && matches!(self.state(), MachineState::Hold | MachineState::SafetyDoor | MachineState::Idle) {
            if self.state() == MachineState::SafetyDoor {
                if door_open {
                    return;
                }
                prep.restore_partial();
            } else if self.state() == MachineState::Hold {
                prep.resume_hold(planner);
            }
            self.set_state(MachineState::Cycle);
        }

        // §4.4 `cycle_stop`: posted by the stepper core once the segment
        // ring runs dry. A plain cycle retires to `Idle`; a jog cancel
        // additionally purges whatever jog blocks were still queued instead
        // of parking in `Hold`; a hold in progress just stays parked there
        // until the next `cycle_start`.
        if stepper.take_cycle_stop() {
            if self.canceling_jog {
                planner.clear();
                prep.reset();
                self.canceling_jog = false;
                self.set_state(MachineState::Idle);
            } else if matches!(self.state(), MachineState::Cycle | MachineState::Jog) {
                // A probe move that drains the ring without ever tripping
                // (§4.4 "if probe never triggered ... posts an alarm") is a
                // contact failure, not a clean cycle stop.
                if self.probe_armed {
                    self.probe_armed = false;
                    self.set_alarm(AlarmCode::ProbeFailContact);
                } else {
                    self.set_state(MachineState::Idle);
                }
            }
            stepper.begin_idle_lock(settings);
        }
    }

    pub fn set_feed_override(&mut self, pct: u8, planner: &mut Planner) {
        self.feed_override_pct = pct.clamp(10, 200);
        planner.update_velocity_profile_parameters(self.feed_override_pct);
    }

    /// Rapid override only has three discrete levels (§8 boundary
    /// behaviors); any requested value snaps to the nearest of them rather
    /// than taking a continuous range like feed/spindle override.
    pub fn set_rapid_override(&mut self, pct: u8) {
        self.rapid_override_pct = match pct {
            0..=37 => 25,
            38..=75 => 50,
            _ => 100,
        };
    }

    pub fn set_spindle_override(&mut self, pct: u8) {
        self.spindle_override_pct = pct.clamp(10, 200);
    }

    pub fn sys_position(&self, stepper: &StepperCore) -> StepPosition {
        stepper.position()
    }

    /// Snaps both the stepper core's `sys_position` and the planner's
    /// tracked position to `position` (§4.1 `sync_position`) — used after
    /// homing and after a probe's forced decel, where the machine's real
    /// position is known by other means than step accumulation.
    pub fn sync_position(&mut self, position: StepPosition, planner: &mut Planner, stepper: &StepperCore) {
        stepper.set_position(position);
        planner.sync_position(position);
    }

    /// Builds the read-only snapshot the external status reporter consumes.
    pub fn status_snapshot(&self, planner: &Planner, stepper: &StepperCore) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            alarm: self.alarm(),
            position: stepper.position(),
            feed_override_pct: self.feed_override_pct,
            rapid_override_pct: self.rapid_override_pct,
            spindle_override_pct: self.spindle_override_pct,
            planner_blocks_queued: planner.len(),
        }
    }

    /// Soft-limit check (§4.4, §9 Decision). The travel window is always
    /// the symmetric range `[min(0, -max_travel), max(0, -max_travel)]`,
    /// independent of `HOMING_FORCE_ORIGIN` or `homing_dir_mask` — the
    /// upstream behavior of letting those two bend the window was judged
    /// a latent bug rather than an intended feature (§9).
    pub fn soft_limit_check(&self, target: &[f32; N_AXIS], settings: &Settings) -> bool {
        for axis in 0..N_AXIS {
            if !settings.flags.contains(crate::settings::SettingsFlags::SOFT_LIMIT_ENABLE) {
                continue;
            }
            let max_travel = settings.max_travel[axis];
            let lo = max_travel.min(0.0);
            let hi = (-max_travel).max(0.0);
            if target[axis] < lo || target[axis] > hi {
                return true;
            }
        }
        false
    }

    /// Raises a soft-limit alarm: forces a feed hold then an alarm/reset,
    /// matching `limits_soft_check`'s upstream sequencing.
    pub fn trigger_soft_limit(&self, stepper: &StepperCore, hal: &mut impl Hal) {
        self.request_feed_hold();
        stepper.stop(hal);
        self.set_alarm(AlarmCode::SoftLimit);
    }

    /// Hard-limit ISR handler: called when a limit switch trips while
    /// `HARD_LIMIT_ENABLE` is set and the machine isn't already homing.
    pub fn hard_limit_triggered(&self, stepper: &StepperCore, hal: &mut impl Hal) {
        if self.state() == MachineState::Homing {
            return;
        }
        stepper.stop(hal);
        self.set_alarm(AlarmCode::HardLimit);
    }

    /// Coolant control honoring the invert-flag symmetrically on both the
    /// flood and mist lines (§9 Decision: the upstream `#ifdef` duplicated
    /// one branch for both outputs; both must honor the flag).
    pub fn set_coolant(&self, hal: &mut impl Hal, flood: bool, mist: bool, invert: bool) {
        hal.set_flood(flood ^ invert);
        hal.set_mist(mist ^ invert);
    }

    /// Executes a single-axis (or combined) jog move outside the normal
    /// cycle-start state machine, per `jog_execute` (§4.4 Jog).
    pub fn jog_execute(
        &mut self,
        target: StepPosition,
        feed_rate: f32,
        planner: &mut Planner,
        settings: &Settings,
    ) -> Result<(), crate::PlannerError> {
        if !matches!(self.state(), MachineState::Idle | MachineState::Jog) {
            return Err(crate::PlannerError::EmptyBlock);
        }
        self.set_state(MachineState::Jog);
        let data = LineData { feed_rate, condition: ConditionFlags::NO_FEED_OVERRIDE, ..Default::default() };
        let result = planner.enqueue(target, data, settings);
        if result.is_err() {
            self.set_state(MachineState::Idle);
        }
        // On success the state stays `Jog` (distinct from a program `Cycle`,
        // per §4.4's state diagram) until the move either runs out on its
        // own or is cut short by `motion_cancel` — both retired by the
        // `cycle_stop` handling in `service`.
        result
    }

    /// A straight-line probing move (§4.4): runs the move like any other
    /// planner block, but watches the probe pin every stepper tick via
    /// `hal.get_state()`d polling in the caller's main loop
    /// ([`Self::poll_probe`]), latching `sys_position` the instant it
    /// trips.
    pub fn probe(&mut self, target: StepPosition, feed_rate: f32, planner: &mut Planner, settings: &Settings) -> Result<(), crate::PlannerError> {
        self.probe_position = None;
        self.probe_armed = true;
        let data = LineData { feed_rate, ..Default::default() };
        planner.enqueue(target, data, settings)?;
        self.set_state(MachineState::Cycle);
        Ok(())
    }

    /// Called once per stepper tick (or main-loop pass) while a probe move
    /// is active; latches the current position the instant the probe pin
    /// trips and cancels remaining motion. Reads `sys_position` straight off
    /// the stepper core so the snapshot is the same tick's position (§8
    /// "probe latch"), not a value the caller captured and passed down
    /// separately. A no-op unless [`Self::probe`] has armed the latch
    /// (`sys_probe_state == PROBE_ACTIVE` in the upstream), so an incidental
    /// probe-pin bounce during ordinary motion can't cancel it.
    pub fn poll_probe(&mut self, probe_triggered: bool, stepper: &StepperCore, hal: &mut impl Hal) {
        if self.probe_armed && probe_triggered && self.probe_position.is_none() {
            #[cfg(feature = "defmt-logging")]
            defmt::debug!("probe triggered, latching position");
            self.probe_position = Some(stepper.position());
            self.probe_armed = false;
            stepper.stop(hal);
            self.set_state(MachineState::Idle);
        }
    }

    pub fn probe_result(&self) -> Option<StepPosition> {
        self.probe_position
    }

    /// Runs the homing cycle for the axes in `cycle_mask`, one bit per
    /// logical axis (§4.4, grounded on `limits_go_home`). Blocking: drives
    /// the stepper core directly rather than going through the planner,
    /// since homing motion bypasses the ring buffer entirely (a "system
    /// motion", same as parking).
    ///
    /// `kinematics` converts the homing target from mm to steps so CoreXY
    /// machines still seek along true machine axes rather than gantry
    /// motors directly.
    pub fn homing_cycle(
        &mut self,
        cycle_mask: AxisMask,
        settings: &Settings,
        kinematics: &impl Kinematics,
        stepper: &StepperCore,
        hal: &mut impl Hal,
    ) -> Result<(), AlarmCode> {
        if !settings.flags.contains(crate::settings::SettingsFlags::HOMING_ENABLE) {
            return Err(AlarmCode::HomingFailReset);
        }
        self.set_state(MachineState::Homing);

        let active_axes: heapless::Vec<usize, N_AXIS> =
            (0..N_AXIS).filter(|&a| cycle_mask & axis_bit(a) != 0).collect();
        let n_active = active_axes.len().max(1) as f32;
        let rate_scale = sqrtf(n_active);

        // Search phase: seek until every active axis's limit switch trips.
        #[cfg(feature = "defmt-logging")]
        defmt::debug!("homing: search phase, mask={=u8:b}", cycle_mask);
        let search_rate = settings.homing_seek_rate * rate_scale;
        self.drive_until_limits(&active_axes, true, search_rate, settings, stepper, hal)?;

        // Pull off the switch before locating more precisely.
        #[cfg(feature = "defmt-logging")]
        defmt::debug!("homing: pull-off phase");
        self.pull_off(&active_axes, settings.homing_pulloff, settings.homing_feed_rate, settings, stepper, hal);
        hal.delay_ms(settings.homing_debounce_delay);

        // Locate phase: slow re-approach for a precise trip point, same
        // direction as the search (§9: the upstream `approach` toggle flips
        // back to "toward the switch" here, not away from it).
        #[cfg(feature = "defmt-logging")]
        defmt::debug!("homing: locate phase");
        let locate_rate = settings.homing_feed_rate * rate_scale;
        self.drive_until_limits(&active_axes, true, locate_rate, settings, stepper, hal)?;
        self.pull_off(&active_axes, settings.homing_pulloff, settings.homing_feed_rate, settings, stepper, hal);

        let mut mm_position = [0.0f32; N_AXIS];
        for &axis in active_axes.iter() {
            mm_position[axis] = if settings.flags.contains(crate::settings::SettingsFlags::HOMING_FORCE_ORIGIN) {
                0.0
            } else if settings.homing_dir_mask & axis_bit(axis) != 0 {
                settings.max_travel[axis]
            } else {
                0.0
            };
        }
        let steps = kinematics.position_to_steps(mm_position);
        stepper.set_position(steps);

        self.set_state(MachineState::Idle);
        Ok(())
    }

    /// An axis's direction bit (§9, matching [`crate::stepper::Core`]'s
    /// convention of "bit set = negative") for a homing move: `toward_limit`
    /// picks between the search/locate approach and the pull-off retreat,
    /// grounded on `limits_go_home`'s `target = -max_travel` (approach, mask
    /// bit set) vs. the opposite sign during retreat.
    fn homing_negative_direction(settings: &Settings, axis: usize, toward_limit: bool) -> bool {
        let dir_mask_bit_set = settings.homing_dir_mask & axis_bit(axis) != 0;
        if toward_limit {
            !dir_mask_bit_set
        } else {
            dir_mask_bit_set
        }
    }

    /// Drives the axes in `axes` toward (`toward_limit = true`) or away
    /// from (`false`) their limit switches, freezing each axis individually
    /// as its switch trips (§4.4 `HOMING_AXIS_SEARCH_SCALAR`/
    /// `HOMING_AXIS_LOCATE_SCALAR` scaling is applied by the caller via
    /// `rate`). Unlike a normal planner move, homing bypasses the ring
    /// buffer, so every simulated step pushed out through `hal` is also
    /// accumulated straight into `sys_position` via [`StepperCore::set_position`]
    /// (§3 invariant 3: position only ever changes alongside an actual step).
    fn drive_until_limits(
        &self,
        axes: &[usize],
        toward_limit: bool,
        rate: f32,
        settings: &Settings,
        stepper: &StepperCore,
        hal: &mut impl Hal,
    ) -> Result<(), AlarmCode> {
        let axes_mask = axes.iter().fold(0, |m, &a| m | axis_bit(a));
        let mut direction_bits: AxisMask = 0;
        for &axis in axes {
            if Self::homing_negative_direction(settings, axis, toward_limit) {
                direction_bits |= axis_bit(axis);
            }
        }
        hal.set_dir(axes_mask, direction_bits);

        let delay_ms = homing_step_delay_ms(axes, rate, settings);
        let mut position = stepper.position();

        let mut locked: AxisMask = 0;
        let max_iterations: u32 = 100_000;
        for _ in 0..max_iterations {
            let limit_state = LimitsHal::get_state(hal);
            for &axis in axes {
                let bit = axis_bit(axis);
                if locked & bit != 0 {
                    continue;
                }
                let tripped = limit_state & bit != 0;
                if tripped == toward_limit {
                    locked |= bit;
                }
            }
            if axes.iter().all(|&a| locked & axis_bit(a) != 0) {
                return Ok(());
            }
            let step_mask = locked ^ axes_mask;
            hal.set_step(step_mask, 0xFF);
            for &axis in axes {
                if step_mask & axis_bit(axis) == 0 {
                    continue;
                }
                if direction_bits & axis_bit(axis) != 0 {
                    position[axis] -= 1;
                } else {
                    position[axis] += 1;
                }
            }
            stepper.set_position(position);
            hal.delay_ms(delay_ms);
        }
        Err(AlarmCode::HomingFailApproach)
    }

    /// Retracts `axes` off their just-tripped switch by `pulloff_mm`,
    /// converted to a real step count via `steps_per_mm` rather than a fixed
    /// iteration count, driving `sys_position` through the same
    /// step-at-a-time accumulation as [`Self::drive_until_limits`].
    fn pull_off(
        &self,
        axes: &[usize],
        pulloff_mm: f32,
        rate: f32,
        settings: &Settings,
        stepper: &StepperCore,
        hal: &mut impl Hal,
    ) {
        let axes_mask = axes.iter().fold(0, |m, &a| m | axis_bit(a));
        let mut direction_bits: AxisMask = 0;
        for &axis in axes {
            if Self::homing_negative_direction(settings, axis, false) {
                direction_bits |= axis_bit(axis);
            }
        }
        hal.set_dir(axes_mask, direction_bits);

        let delay_ms = homing_step_delay_ms(axes, rate, settings);
        let mut position = stepper.position();

        let steps_per_mm_max = axes.iter().map(|&a| settings.steps_per_mm[a]).fold(1.0f32, f32::max);
        let pulloff_steps = (pulloff_mm.max(0.0) * steps_per_mm_max).round() as u32;

        for _ in 0..pulloff_steps {
            hal.set_step(axes_mask, 0xFF);
            for &axis in axes {
                if direction_bits & axis_bit(axis) != 0 {
                    position[axis] -= 1;
                } else {
                    position[axis] += 1;
                }
            }
            stepper.set_position(position);
            hal.delay_ms(delay_ms);
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
