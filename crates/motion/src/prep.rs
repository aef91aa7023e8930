//! Segment preparer (component B, §4.2).
//!
//! Slices the head planner block into constant-rate segments following a
//! trapezoidal velocity profile, and publishes them to the ring the stepper
//! core's base-timer ISR drains. Main-loop only, same as [`crate::block`].

use crate::block::{ConditionFlags, Planner};
use crate::mathf::sqrtf;
use crate::settings::Settings;
use crate::N_AXIS;

/// Number of segments the stepper core can have queued at once.
pub const SEGMENT_BUFFER_SIZE: usize = 6;

/// Size of the stepper-local block-copy ring (§3). One less than the
/// segment ring so the planner can release a block's ring slot while the
/// stepper core still references it through the last segment pointing at
/// the corresponding stepper-local copy.
pub const STEPPER_BLOCK_RING_SIZE: usize = SEGMENT_BUFFER_SIZE - 1;

/// Immutable-during-execution snapshot of a planner block's Bresenham
/// parameters (§3 "Stepper-local block copy"). The planner may release its
/// own ring slot (`Planner::discard`) as soon as a block is fully sliced
/// into segments; the stepper core keeps stepping it via this copy until
/// every segment referencing it has been consumed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepperBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: u8,
}

/// Rate, in Hz, at which the trapezoid is re-walked during acceleration or
/// deceleration. Matches the upstream default of 100 Hz.
pub const ACCELERATION_TICKS_PER_SECOND: u32 = 100;
const DT_SEGMENT_MIN: f32 = 1.0 / ACCELERATION_TICKS_PER_SECOND as f32 / 60.0;

/// Nominal frequency, in Hz, of the base stepper timer's tick counter.
pub const TICK_FREQUENCY_HZ: u32 = 1_000_000;

/// AMASS oversampling shift amounts, lowest-fidelity to highest.
const AMASS_SHIFTS: [u8; 4] = [0, 2, 4, 6];
/// Highest shift any segment can carry; the stepper core pre-shifts a
/// block's Bresenham counts by this much once at block-load time so no
/// segment-to-segment change in AMASS shift ever requires a runtime divide.
pub const MAX_AMASS_SHIFT: u8 = AMASS_SHIFTS[AMASS_SHIFTS.len() - 1];
/// Step-rate ceiling, steps/s, below which each shift level is selected.
/// Chosen so the *scaled* (shifted) rate never outruns the base timer.
const AMASS_THRESHOLDS_HZ: [u32; 4] = [
    TICK_FREQUENCY_HZ >> 1,
    TICK_FREQUENCY_HZ >> 3,
    TICK_FREQUENCY_HZ >> 5,
    TICK_FREQUENCY_HZ >> 7,
];

/// One constant-rate segment, ready for the stepper ISR to replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Steps to execute, already scaled by `1 << amass_shift`.
    pub n_step: u16,
    /// AMASS oversampling shift chosen for this segment.
    pub amass_shift: u8,
    /// Base timer reload value (in timer ticks) between step events.
    pub cycles_per_tick: u32,
    /// Spindle PWM duty to hold for the duration of this segment.
    pub spindle_pwm: u8,
    /// Index into the stepper-local block-copy ring (§3) this segment's
    /// Bresenham parameters belong to.
    pub block_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RampPhase {
    Accelerate,
    Cruise,
    Decelerate,
}

/// Per-block trapezoid bookkeeping plus the running position within it.
#[derive(Debug, Clone, Copy)]
struct BlockPrepState {
    mm_remaining: f32,
    mm_total: f32,
    steps_per_mm: f32,
    current_speed: f32,
    nominal_speed: f32,
    exit_speed: f32,
    acceleration: f32,
    /// `mm_remaining` value at which the accelerate phase ends.
    accelerate_until: f32,
    /// `mm_remaining` value at which the decelerate phase begins.
    decelerate_after: f32,
    /// `mm_remaining` floor below which this block stops advancing: zero for
    /// a normal block (it runs out exactly at the block boundary), nonzero
    /// while a forced hold has located a stop point short of it (§4.2 "Hold
    /// mode": "`mm_complete` marks the end point (may be inside the block)").
    mm_complete: f32,
    /// PWM duty for the block's commanded spindle speed at full rate; zero
    /// if the spindle is off. In laser mode this is scaled per segment by
    /// the current/nominal speed ratio instead of applied as-is (step 6,
    /// "rate-adjusted laser mode").
    spindle_pwm: u8,
    laser_mode: bool,
    /// Ring slot of this block's stepper-local copy; stamped onto every
    /// segment emitted while this block is current.
    block_index: usize,
}

/// Classifies the trapezoid (or triangle) ramp for `total_mm` of travel
/// between `entry_speed` and `exit_speed`, capped at `nominal_speed` (§4.2
/// step 2). Returns `(nominal_speed, accel_distance, decel_distance)` —
/// `nominal_speed` comes back lower than the input when the distance is too
/// short to reach it (a triangle profile).
fn classify_ramp(total_mm: f32, entry_speed: f32, exit_speed: f32, nominal_speed: f32, acceleration: f32) -> (f32, f32, f32) {
    let accel_dist = (nominal_speed * nominal_speed - entry_speed * entry_speed).max(0.0) / (2.0 * acceleration);
    let decel_dist = (nominal_speed * nominal_speed - exit_speed * exit_speed).max(0.0) / (2.0 * acceleration);
    if accel_dist + decel_dist > total_mm {
        let peak_sqr = (2.0 * acceleration * total_mm + entry_speed * entry_speed + exit_speed * exit_speed) / 2.0;
        let peak = sqrtf(peak_sqr.max(0.0));
        let accel = (peak * peak - entry_speed * entry_speed).max(0.0) / (2.0 * acceleration);
        (peak, accel, total_mm - accel)
    } else {
        (nominal_speed, accel_dist, decel_dist)
    }
}

/// Snapshot of in-flight prep state, saved across a parking motion so the
/// interrupted program move can resume exactly where it left off (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct ParkedPrepState {
    block: BlockPrepState,
}

pub struct Preparer {
    ring: [Segment; SEGMENT_BUFFER_SIZE],
    head: usize,
    tail: usize,
    block: Option<BlockPrepState>,
    parked: Option<ParkedPrepState>,
    block_ring: [StepperBlock; STEPPER_BLOCK_RING_SIZE],
    block_ring_head: usize,
}

impl Preparer {
    pub fn new() -> Self {
        Preparer {
            ring: [Segment::default(); SEGMENT_BUFFER_SIZE],
            head: 0,
            tail: 0,
            block: None,
            parked: None,
            block_ring: [StepperBlock::default(); STEPPER_BLOCK_RING_SIZE],
            block_ring_head: 0,
        }
    }

    /// Stepper-local block copy referenced by a segment's `block_index`.
    /// Called by the stepper core when a newly-loaded segment points at a
    /// different block than the one currently executing (§4.3 step 5).
    pub fn stepper_block(&self, index: usize) -> StepperBlock {
        self.block_ring[index]
    }

    fn next_index(i: usize) -> usize {
        (i + 1) % SEGMENT_BUFFER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        Self::next_index(self.head) == self.tail
    }

    pub fn len(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            SEGMENT_BUFFER_SIZE - self.tail + self.head
        }
    }

    /// Pops the next segment for the stepper ISR to execute.
    pub fn pop(&mut self) -> Option<Segment> {
        if self.is_empty() {
            return None;
        }
        let seg = self.ring[self.tail];
        self.tail = Self::next_index(self.tail);
        Some(seg)
    }

    fn push(&mut self, seg: Segment) -> bool {
        if self.is_full() {
            return false;
        }
        self.ring[self.head] = seg;
        self.head = Self::next_index(self.head);
        true
    }

    /// Maps a commanded spindle speed onto an 8-bit PWM duty, linearized
    /// between `rpm_min` and `rpm_max` (§4.5 "spindle PWM linearization
    /// bounds"). Below `rpm_min` still produces a nonzero floor duty so the
    /// spindle doesn't stall near the bottom of its range.
    fn spindle_pwm_for_rpm(settings: &Settings, rpm: f32) -> u8 {
        if rpm <= 0.0 {
            return 0;
        }
        let span = (settings.rpm_max - settings.rpm_min).max(1.0);
        let frac = ((rpm - settings.rpm_min) / span).clamp(0.0, 1.0);
        (frac * 255.0).round() as u8
    }

    /// Begins tracking a freshly-dequeued planner block.
    fn start_block(&mut self, planner: &Planner, settings: &Settings) {
        let b = planner.current_block().expect("start_block called with no current block");
        let entry_speed = sqrtf(b.entry_speed_sqr);
        let exit_speed_sqr = planner.get_exec_block_exit_speed_sqr();
        let exit_speed = sqrtf(exit_speed_sqr);
        let nominal_speed = b.programmed_rate.min(b.rapid_rate);

        let (nominal_speed, accel_dist, decel_dist) =
            classify_ramp(b.millimeters, entry_speed, exit_speed, nominal_speed, b.acceleration);

        let spindle_on = b.condition.intersects(ConditionFlags::SPINDLE_CW | ConditionFlags::SPINDLE_CCW);
        let spindle_pwm = if spindle_on { Self::spindle_pwm_for_rpm(settings, b.spindle_speed) } else { 0 };
        let laser_mode = spindle_on && settings.flags.contains(crate::settings::SettingsFlags::LASER_MODE);

        let block_index = self.block_ring_head;
        self.block_ring[block_index] =
            StepperBlock { steps: b.steps, step_event_count: b.step_event_count, direction_bits: b.direction_bits };
        self.block_ring_head = (self.block_ring_head + 1) % STEPPER_BLOCK_RING_SIZE;

        self.block = Some(BlockPrepState {
            mm_remaining: b.millimeters,
            mm_total: b.millimeters,
            steps_per_mm: b.step_event_count as f32 / b.millimeters.max(1.0e-6),
            current_speed: entry_speed,
            nominal_speed,
            exit_speed,
            acceleration: b.acceleration,
            accelerate_until: b.millimeters - accel_dist,
            decelerate_after: decel_dist,
            mm_complete: 0.0,
            spindle_pwm,
            laser_mode,
            block_index,
        });
    }

    /// Forced-decel hold (§4.2 "Hold mode"): locates the stop distance from
    /// the current speed via `v²/(2a)` and makes the in-flight block
    /// decelerate to zero starting immediately, rather than continuing its
    /// normal accel/cruise/decel profile. `mm_complete` marks the point
    /// (possibly short of the block's own end) where that zero-speed stop
    /// occurs; `fill()` stops advancing the block there without discarding
    /// it, so [`Self::resume_hold`] can pick the remaining distance back up.
    /// A no-op if no block is in flight or it is already decelerating to a
    /// full stop (e.g. the last queued block).
    pub fn begin_hold(&mut self) {
        let Some(state) = self.block.as_mut() else { return };
        if state.exit_speed == 0.0 && state.decelerate_after >= state.mm_remaining {
            return;
        }
        let stop_distance = (state.current_speed * state.current_speed) / (2.0 * state.acceleration);
        state.mm_complete = (state.mm_remaining - stop_distance).max(0.0);
        state.exit_speed = 0.0;
        state.accelerate_until = state.mm_remaining;
        state.decelerate_after = state.mm_remaining;
    }

    /// Resumes a block frozen mid-way by [`Self::begin_hold`]: reclassifies
    /// the ramp over the distance still remaining, from the current (parked)
    /// speed back up to the block's original exit speed, and clears
    /// `mm_complete` so `fill()` runs the block out to its real end again.
    /// A no-op if the block was never actually halted short of its end.
    pub fn resume_hold(&mut self, planner: &Planner) {
        let Some(state) = self.block.as_mut() else { return };
        if state.mm_complete <= 1.0e-4 {
            return;
        }
        let entry_speed = state.current_speed;
        let exit_speed = sqrtf(planner.get_exec_block_exit_speed_sqr());
        let (nominal_speed, accel_dist, decel_dist) =
            classify_ramp(state.mm_remaining, entry_speed, exit_speed, state.nominal_speed, state.acceleration);
        state.nominal_speed = nominal_speed;
        state.exit_speed = exit_speed;
        state.accelerate_until = state.mm_remaining - accel_dist;
        state.decelerate_after = decel_dist;
        state.mm_complete = 0.0;
    }

    fn phase(state: &BlockPrepState) -> RampPhase {
        if state.mm_remaining > state.accelerate_until {
            RampPhase::Accelerate
        } else if state.mm_remaining > state.decelerate_after {
            RampPhase::Cruise
        } else {
            RampPhase::Decelerate
        }
    }

    fn amass_for_rate(step_rate_hz: f32) -> u8 {
        let rate = step_rate_hz as u32;
        for (i, &threshold) in AMASS_THRESHOLDS_HZ.iter().enumerate().rev() {
            if rate < threshold {
                return AMASS_SHIFTS[i];
            }
        }
        AMASS_SHIFTS[0]
    }

    /// Refills the segment ring from the current planner block, pulling a
    /// fresh block from `planner` whenever the previous one completes. Each
    /// segment's spindle PWM is derived from the block's commanded spindle
    /// speed and `settings.rpm_min`/`rpm_max`; in laser mode it is scaled by
    /// the segment's speed relative to the block's nominal speed instead of
    /// held constant (step 6, "rate-adjusted laser mode").
    pub fn fill(&mut self, planner: &mut Planner, settings: &Settings) {
        while !self.is_full() {
            if self.block.is_none() {
                if planner.current_block().is_none() {
                    return;
                }
                self.start_block(planner, settings);
            }

            let state = self.block.as_mut().expect("checked above");
            let mm_to_complete = state.mm_remaining - state.mm_complete;
            if mm_to_complete <= 1.0e-4 {
                // Either the block legitimately ran out (mm_complete == 0),
                // handled below, or a forced hold parked it short of its end
                // (mm_complete > 0): either way there is nothing left to
                // advance until the block is discarded or resumed.
                if state.mm_complete <= 1.0e-4 {
                    planner.discard();
                    self.block = None;
                    continue;
                }
                return;
            }
            let dt = DT_SEGMENT_MIN.min(mm_to_complete / state.current_speed.max(1.0));
            let phase = Self::phase(state);

            let next_speed = match phase {
                RampPhase::Accelerate => {
                    (state.current_speed + state.acceleration * dt).min(state.nominal_speed)
                }
                RampPhase::Cruise => state.nominal_speed,
                RampPhase::Decelerate => {
                    (state.current_speed - state.acceleration * dt).max(state.exit_speed)
                }
            };

            let avg_speed = (state.current_speed + next_speed) / 2.0;
            let mut mm_this_tick = avg_speed * dt;
            if mm_this_tick >= mm_to_complete || mm_this_tick <= 0.0 {
                mm_this_tick = mm_to_complete;
            }

            let steps_this_tick = (mm_this_tick * state.steps_per_mm).round().max(1.0) as u16;
            let step_rate_hz = (avg_speed / 60.0) * state.steps_per_mm;
            let amass_shift = Self::amass_for_rate(step_rate_hz);

            let effective_rate_hz = (step_rate_hz * (1u32 << amass_shift) as f32).max(1.0);
            let cycles_per_tick = (TICK_FREQUENCY_HZ as f32 / effective_rate_hz).round() as u32;

            let segment_pwm = if state.laser_mode {
                let ratio = (avg_speed / state.nominal_speed.max(1.0e-6)).clamp(0.0, 1.0);
                ((state.spindle_pwm as f32) * ratio).round() as u8
            } else {
                state.spindle_pwm
            };

            self.push(Segment {
                n_step: steps_this_tick << amass_shift,
                amass_shift,
                cycles_per_tick: cycles_per_tick.max(1),
                spindle_pwm: segment_pwm,
                block_index: state.block_index,
            });

            state.current_speed = next_speed;
            state.mm_remaining -= mm_this_tick;
        }
    }

    /// Discards all queued segments and in-flight block state, e.g. on a
    /// feed hold completing into a full stop or a reset.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.block = None;
        self.parked = None;
    }

    /// Saves in-flight trapezoid state before a parking motion steals the
    /// stepper core, so the interrupted move can resume unchanged (§4.2).
    pub fn save_partial(&mut self) {
        if let Some(state) = self.block {
            self.parked = Some(ParkedPrepState { block: state });
        }
        self.block = None;
        self.head = 0;
        self.tail = 0;
    }

    /// Restores trapezoid state saved by [`Self::save_partial`].
    pub fn restore_partial(&mut self) {
        if let Some(parked) = self.parked.take() {
            self.block = Some(parked.block);
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }
}

impl Default for Preparer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::LineData;

    fn test_settings() -> Settings {
        let mut s = Settings::default();
        s.steps_per_mm = [80.0, 80.0, 80.0];
        s.max_rate = [10000.0, 10000.0, 10000.0];
        s.acceleration = [500.0 * 60.0 * 60.0; 3];
        s
    }

    #[test]
    fn fills_segments_from_a_queued_block() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([8000, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();

        let mut prep = Preparer::new();
        prep.fill(&mut planner, &settings);
        assert!(!prep.is_empty());
    }

    #[test]
    fn drains_block_fully_across_repeated_fills() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([800, 0, 0], LineData { feed_rate: 500.0, ..Default::default() }, &settings)
            .unwrap();

        let mut prep = Preparer::new();
        let mut total_steps: u32 = 0;
        for _ in 0..64 {
            prep.fill(&mut planner, &settings);
            while let Some(seg) = prep.pop() {
                total_steps += (seg.n_step >> seg.amass_shift) as u32;
            }
            if planner.is_empty() && prep.is_empty() {
                break;
            }
        }
        assert_eq!(total_steps, 800);
    }

    #[test]
    fn save_and_restore_partial_preserves_remaining_distance() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([8000, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();

        let mut prep = Preparer::new();
        prep.fill(&mut planner, &settings);
        let remaining_before = prep.block.unwrap().mm_remaining;
        prep.save_partial();
        assert!(prep.is_parked());
        assert!(prep.is_empty());
        prep.restore_partial();
        assert!(!prep.is_parked());
        assert_eq!(prep.block.unwrap().mm_remaining, remaining_before);
    }

    /// A forced hold must bring the block to a full stop (current speed
    /// reaches the exit speed of zero) without ever discarding it, so the
    /// interrupted move is still there to resume.
    #[test]
    fn begin_hold_ramps_the_in_flight_block_down_to_a_stop() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([8000, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();

        let mut prep = Preparer::new();
        // Run enough fills to get the block up to cruise speed before
        // holding.
        for _ in 0..20 {
            prep.fill(&mut planner, &settings);
            while prep.pop().is_some() {}
        }
        assert!(prep.block.unwrap().current_speed > 0.0);

        prep.begin_hold();
        assert!(prep.block.unwrap().mm_complete > 0.0, "mid-block stop point should be short of the block end");

        for _ in 0..1000 {
            prep.fill(&mut planner, &settings);
            while prep.pop().is_some() {}
            if prep.block.is_none() {
                break;
            }
            let state = prep.block.unwrap();
            if (state.mm_remaining - state.mm_complete).abs() < 1.0e-3 {
                break;
            }
        }

        let parked = prep.block.expect("hold should park the block, not discard it");
        assert!((parked.current_speed).abs() < 1.0e-2, "should have decelerated to a stop: {}", parked.current_speed);
        assert!((parked.mm_remaining - parked.mm_complete).abs() < 1.0e-2);

        // Once parked, further fills must not advance the block any more.
        let stalled_remaining = parked.mm_remaining;
        prep.fill(&mut planner, &settings);
        assert_eq!(prep.block.unwrap().mm_remaining, stalled_remaining);
    }

    #[test]
    fn resume_hold_reclassifies_remaining_distance_and_clears_the_stop_point() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([8000, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();

        let mut prep = Preparer::new();
        for _ in 0..20 {
            prep.fill(&mut planner, &settings);
            while prep.pop().is_some() {}
        }
        prep.begin_hold();
        for _ in 0..1000 {
            prep.fill(&mut planner, &settings);
            while prep.pop().is_some() {}
            let state = prep.block.unwrap();
            if (state.mm_remaining - state.mm_complete).abs() < 1.0e-3 {
                break;
            }
        }

        let remaining_at_park = prep.block.unwrap().mm_remaining;
        prep.resume_hold(&planner);
        let resumed = prep.block.unwrap();
        assert_eq!(resumed.mm_complete, 0.0);
        assert_eq!(resumed.mm_remaining, remaining_at_park);

        // The block should now be able to run all the way to completion.
        for _ in 0..2000 {
            prep.fill(&mut planner, &settings);
            while prep.pop().is_some() {}
            if prep.block.is_none() {
                break;
            }
        }
        assert!(prep.block.is_none(), "resumed block should run out to completion");
        assert!(planner.is_empty());
    }
}
