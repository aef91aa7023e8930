//! Stepper core (component C, §4.3): the two interrupt-level entry points
//! that replay prepared segments via a multi-axis Bresenham line algorithm.
//!
//! State here is shared between the main loop and interrupt context, so it
//! is held behind [`critical_section::Mutex`]. The ISR entry points
//! themselves ([`Core::base_timer_fired`], [`Core::pulse_timer_fired`]) are
//! meant to be called directly from a backend's real interrupt handlers;
//! they do not take the critical section themselves beyond what touching
//! the `Mutex` requires, since they already run with interrupts masked at
//! the hardware level on every target this has shipped on.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::hal::{AxisMask, StepperHal};
use crate::prep::{Preparer, Segment, StepperBlock, MAX_AMASS_SHIFT};
use crate::settings::Settings;
use crate::{StepPosition, N_AXIS};

/// Per-axis Bresenham counters plus the direction/step masks currently
/// latched for the segment in progress.
#[derive(Debug, Clone, Copy, Default)]
struct Execution {
    /// Steps remaining in the current segment; one base-timer tick retires
    /// exactly one, regardless of AMASS shift (§9: the segment's `n_step`
    /// already accounts for the oversampling).
    step_count: u32,
    /// Per-axis Bresenham increment, pre-shifted by `MAX_AMASS_SHIFT` at
    /// block-load time and then right-shifted by this segment's
    /// `amass_shift` (§9 "the stepper-local block copy stores pre-shifted
    /// step counts so the ISR never divides at runtime") — recomputed from
    /// `shifted_steps` every time a new segment loads, since consecutive
    /// segments of the same block can carry different AMASS shifts as the
    /// step rate ramps.
    event_count: [u32; N_AXIS],
    /// Bresenham error accumulators, one per axis, driven by the dominant
    /// (longest) axis of the current planner block.
    counter: [i32; N_AXIS],
    /// Fixed per-block threshold the accumulators compare against:
    /// `step_event_count << MAX_AMASS_SHIFT`, set once at block-load time
    /// and left untouched across every segment of the block.
    dominant_event_count: u32,
    /// This block's raw per-axis step counts, pre-shifted by
    /// `MAX_AMASS_SHIFT`; kept around so [`Core::apply_segment_shift`] can
    /// recompute `event_count` for each new segment without re-fetching the
    /// block copy.
    shifted_steps: [u32; N_AXIS],
    direction_bits: AxisMask,
    step_pins_out: AxisMask,
    /// Stepper-local block-copy ring slot the current segment belongs to;
    /// `None` until the first segment is loaded.
    block_index: Option<usize>,
}

struct Shared {
    exec: Option<Execution>,
    busy: bool,
    step_invert_mask: AxisMask,
    dir_invert_mask: AxisMask,
    idle_lock_ticks_remaining: u16,
    /// The machine's canonical step position (§3 `sys_position`), updated
    /// synchronously with every step pulse (§3 invariant 3, §4.3 step 7) —
    /// this is the only place that happens, so reporting, soft limits, and
    /// the probe snapshot all read through [`Core::position`] rather than
    /// keeping their own copy that could drift from what was actually
    /// stepped.
    position: StepPosition,
    /// Set when [`Core::load_segment`] finds the segment ring empty (§4.3
    /// step 5, "post `EXEC_CYCLE_STOP`"); drained by [`Core::take_cycle_stop`]
    /// so the realtime supervisor can retire `Cycle` back to `Idle`.
    cycle_stop_pending: bool,
}

impl Default for Shared {
    fn default() -> Self {
        Shared {
            exec: None,
            busy: false,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            idle_lock_ticks_remaining: 0,
            position: [0; N_AXIS],
            cycle_stop_pending: false,
        }
    }
}

/// Owns the ISR-shared stepper state. One instance per machine; the caller
/// is responsible for wiring [`Self::base_timer_fired`] and
/// [`Self::pulse_timer_fired`] to the backend's actual interrupt vectors.
pub struct Core {
    shared: Mutex<RefCell<Shared>>,
}

impl Core {
    pub fn new() -> Self {
        Core { shared: Mutex::new(RefCell::new(Shared::default())) }
    }

    pub fn configure(&self, settings: &Settings) {
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            s.step_invert_mask = settings.step_invert_mask;
            s.dir_invert_mask = settings.dir_invert_mask;
        });
    }

    /// Swaps in a new stepper-local block copy and resets the Bresenham
    /// counters to `step_event_count / 2` (§4.3 step 5): called whenever a
    /// freshly-loaded segment's `block_index` differs from the one
    /// currently executing. Pre-shifts `steps`/`step_event_count` by
    /// `MAX_AMASS_SHIFT` so that no later segment of this block ever needs
    /// to divide to apply its own (possibly smaller) AMASS shift — it only
    /// ever right-shifts this fixed copy (§9).
    fn load_block(exec: &mut Execution, block: StepperBlock, block_index: usize) {
        for axis in 0..N_AXIS {
            exec.shifted_steps[axis] = block.steps[axis] << MAX_AMASS_SHIFT;
        }
        let dominant = block.steps.iter().copied().max().unwrap_or(1).max(1);
        exec.dominant_event_count = dominant << MAX_AMASS_SHIFT;
        exec.counter = [(exec.dominant_event_count / 2) as i32; N_AXIS];
        exec.direction_bits = block.direction_bits;
        exec.block_index = Some(block_index);
    }

    /// Recomputes `event_count` for the AMASS shift of the segment that was
    /// just loaded (§9): a plain right-shift of the fixed, block-local
    /// `shifted_steps`, never a division. Unlike [`Self::load_block`], this
    /// runs on *every* segment load, since consecutive segments of the same
    /// block can ramp through different AMASS shifts as the step rate
    /// changes.
    fn apply_segment_shift(exec: &mut Execution, amass_shift: u8) {
        for axis in 0..N_AXIS {
            exec.event_count[axis] = exec.shifted_steps[axis] >> amass_shift;
        }
    }

    /// Loads the next segment into the execution state, pulling from the
    /// preparer's ring. Returns `false` if no segment was ready, in which
    /// case the stepper core has gone idle (§4.3 step 5): the base timer is
    /// stopped, `busy`/`exec` are cleared so a later refill starts clean,
    /// and `cycle_stop_pending` is set for [`Self::take_cycle_stop`].
    fn load_segment(&self, hal: &mut impl StepperHal, prep: &mut Preparer) -> bool {
        let Some(seg) = prep.pop() else {
            critical_section::with(|cs| {
                let mut s = self.shared.borrow(cs).borrow_mut();
                s.exec = None;
                s.busy = false;
                s.cycle_stop_pending = true;
            });
            hal.base_timer_stop();
            hal.pulse_timer_stop();
            return false;
        };
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            let mut exec = s.exec.take().unwrap_or_default();
            if exec.block_index != Some(seg.block_index) {
                let block = prep.stepper_block(seg.block_index);
                Self::load_block(&mut exec, block, seg.block_index);
            }
            exec.step_count = seg.n_step as u32;
            Self::apply_segment_shift(&mut exec, seg.amass_shift);
            s.exec = Some(exec);
            s.busy = false;
        });
        hal.base_timer_start(cycles_per_tick_clamped(seg));
        true
    }

    /// Base timer ISR: fires once per `cycles_per_tick`, executing one
    /// Bresenham step across all axes. Swaps in a new stepper-local block
    /// copy itself, via the segment's `block_index`, whenever the block
    /// currently executing changes (§4.3 step 5) — the caller need not
    /// track block boundaries.
    ///
    /// A segment is popped *before* stepping whenever the previous one ran
    /// out (including from a cold start, where `exec` is still `None`):
    /// only when the preparer's ring has nothing left does this tick idle
    /// and stop the base timer, mirroring the upstream ISR's "pop, then
    /// execute in the same call" structure rather than requiring a
    /// separate tick just to notice a segment is needed.
    pub fn base_timer_fired(&self, hal: &mut impl StepperHal, prep: &mut Preparer) {
        let busy = critical_section::with(|cs| self.shared.borrow(cs).borrow().busy);
        if busy {
            // Previous pulse hasn't been cleared yet; skip this tick rather
            // than reenter (§4.3 busy guard).
            return;
        }

        let needs_segment = critical_section::with(|cs| {
            let s = self.shared.borrow(cs).borrow();
            match s.exec.as_ref() {
                Some(exec) => exec.step_count == 0,
                None => true,
            }
        });
        if needs_segment && !self.load_segment(hal, prep) {
            // load_segment already stopped the timers and parked `exec`.
            return;
        }

        let (step_bits, dir_bits) = critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            let exec = s.exec.as_mut().expect("load_segment above guarantees a loaded segment");

            let mut step_bits: AxisMask = 0;
            if exec.dominant_event_count != 0 {
                for axis in 0..N_AXIS {
                    exec.counter[axis] -= exec.event_count[axis] as i32;
                    if exec.counter[axis] < 0 {
                        exec.counter[axis] += exec.dominant_event_count as i32;
                        step_bits |= 1 << axis;
                    }
                }
            }
            exec.step_count -= 1;

            if step_bits != 0 {
                for axis in 0..N_AXIS {
                    if step_bits & (1 << axis) == 0 {
                        continue;
                    }
                    if exec.direction_bits & (1 << axis) != 0 {
                        s.position[axis] -= 1;
                    } else {
                        s.position[axis] += 1;
                    }
                }
            }
            let dir_bits = s.dir_invert_mask ^ exec.direction_bits;
            s.busy = true;
            (step_bits, dir_bits)
        });

        if step_bits != 0 {
            hal.set_dir(step_bits, dir_bits);
            let out_bits = critical_section::with(|cs| self.shared.borrow(cs).borrow().step_invert_mask) ^ step_bits;
            hal.set_step(step_bits, out_bits);
            hal.pulse_timer_start(0);
        } else {
            critical_section::with(|cs| self.shared.borrow(cs).borrow_mut().busy = false);
        }
    }

    /// Pulse timer ISR: fires `pulse_microseconds` after a step line was
    /// raised, and drops it. Clears the busy guard so the next base-timer
    /// tick can issue another pulse.
    pub fn pulse_timer_fired(&self, hal: &mut impl StepperHal) {
        hal.set_step(0xFF, 0);
        hal.pulse_timer_stop();
        critical_section::with(|cs| self.shared.borrow(cs).borrow_mut().busy = false);
    }

    /// True while a segment is actively being stepped out.
    pub fn is_busy(&self) -> bool {
        critical_section::with(|cs| self.shared.borrow(cs).borrow().exec.is_some())
    }

    /// The canonical machine step position (§3 `sys_position`), current as
    /// of the most recently committed step pulse.
    pub fn position(&self) -> StepPosition {
        critical_section::with(|cs| self.shared.borrow(cs).borrow().position)
    }

    /// Drains the pending `cycle_stop` signal (§4.4 "posted by stepper when
    /// segment buffer drains"), returning `true` at most once per time the
    /// segment ring actually ran dry.
    pub fn take_cycle_stop(&self) -> bool {
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            core::mem::take(&mut s.cycle_stop_pending)
        })
    }

    /// Overwrites `sys_position` directly, bypassing step accumulation.
    /// Used after homing and after a probe's forced decel resyncs the
    /// planner (§4.1 `sync_position`) — the only two events that are
    /// allowed to move the machine's notion of "here" without a step
    /// actually having been taken.
    pub fn set_position(&self, position: StepPosition) {
        critical_section::with(|cs| self.shared.borrow(cs).borrow_mut().position = position);
    }

    /// Immediately halts the stepper core (reset, alarm, or feed-hold
    /// completing into a full stop).
    pub fn stop(&self, hal: &mut impl StepperHal) {
        hal.base_timer_stop();
        hal.pulse_timer_stop();
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            s.exec = None;
            s.busy = false;
        });
    }

    /// Begins (or resets) the idle-lock countdown after motion stops,
    /// following `stepper_idle_lock_time` (§3); `0xFF` disables it.
    pub fn begin_idle_lock(&self, settings: &Settings) {
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            s.idle_lock_ticks_remaining = if settings.stepper_idle_lock_time == 0xFF {
                0
            } else {
                settings.stepper_idle_lock_time as u16
            };
        });
    }

    /// Called once per ms by the realtime supervisor's housekeeping tick;
    /// returns `true` the instant the idle-lock countdown reaches zero, so
    /// the caller can deassert the stepper drivers.
    pub fn tick_idle_lock(&self) -> bool {
        critical_section::with(|cs| {
            let mut s = self.shared.borrow(cs).borrow_mut();
            if s.idle_lock_ticks_remaining == 0 {
                return false;
            }
            s.idle_lock_ticks_remaining -= 1;
            s.idle_lock_ticks_remaining == 0
        })
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

fn cycles_per_tick_clamped(seg: Segment) -> u16 {
    seg.cycles_per_tick.min(u16::MAX as u32) as u16
}
