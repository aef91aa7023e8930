//! Planner ring buffer (component A, §4.1).
//!
//! Main-loop only: the planner ring itself needs no locking. Only the
//! `tail` index is ever touched outside the main loop, and then only
//! indirectly through [`Planner::discard`], which the segment preparer
//! also calls from the main loop.

use bitflags::bitflags;

use crate::mathf::sqrtf;
use crate::settings::Settings;
use crate::{N_AXIS, PlannerError, StepPosition};

/// Number of planner blocks the ring can hold.
pub const BLOCK_BUFFER_SIZE: usize = 16;

bitflags! {
    /// Per-block condition bits (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
    pub struct ConditionFlags: u8 {
        const RAPID             = 1 << 0;
        const SYSTEM_MOTION     = 1 << 1;
        const NO_FEED_OVERRIDE  = 1 << 2;
        const INVERSE_TIME      = 1 << 3;
        const SPINDLE_CW        = 1 << 4;
        const SPINDLE_CCW       = 1 << 5;
        const COOLANT_FLOOD     = 1 << 6;
        const COOLANT_MIST      = 1 << 7;
    }
}

/// Per-axis sign bitmask: bit set means negative direction.
pub type DirectionBits = u8;

/// One linear motion block, as queued in the planner ring.
#[derive(Debug, Clone, Copy)]
pub struct PlannerBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: DirectionBits,
    pub condition: ConditionFlags,

    pub entry_speed_sqr: f32,
    pub max_entry_speed_sqr: f32,
    pub max_junction_speed_sqr: f32,

    pub acceleration: f32,
    /// Remaining distance, mm. Mutated by the preparer as segments publish.
    pub millimeters: f32,

    pub rapid_rate: f32,
    pub programmed_rate: f32,

    pub spindle_speed: f32,
    pub line_number: u32,
}

impl Default for PlannerBlock {
    fn default() -> Self {
        PlannerBlock {
            steps: [0; N_AXIS],
            step_event_count: 0,
            direction_bits: 0,
            condition: ConditionFlags::empty(),
            entry_speed_sqr: 0.0,
            max_entry_speed_sqr: 0.0,
            max_junction_speed_sqr: f32::MAX,
            acceleration: 0.0,
            millimeters: 0.0,
            rapid_rate: 0.0,
            programmed_rate: 0.0,
            spindle_speed: 0.0,
            line_number: 0,
        }
    }
}

/// Caller-supplied parameters for one [`Planner::enqueue`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineData {
    pub feed_rate: f32,
    pub spindle_speed: f32,
    pub condition: ConditionFlags,
    pub line_number: u32,
}

const MINIMUM_JUNCTION_SPEED_SQR: f32 = 1.0e-6;

/// The planner ring buffer plus the planner's own tracked position.
pub struct Planner {
    ring: [PlannerBlock; BLOCK_BUFFER_SIZE],
    /// Next block to execute.
    tail: usize,
    /// Next free slot.
    head: usize,
    /// Planner's own tracked position, absorbing homing/probe corrections
    /// before they reach `sys_position` (§4.1).
    position: StepPosition,
    /// A planner-ring-bypass block for homing/parking/jog-cancel motion.
    system_motion_block: Option<PlannerBlock>,
}

impl Planner {
    pub fn new() -> Self {
        Planner {
            ring: [PlannerBlock::default(); BLOCK_BUFFER_SIZE],
            tail: 0,
            head: 0,
            position: [0; N_AXIS],
            system_motion_block: None,
        }
    }

    fn next_index(i: usize) -> usize {
        (i + 1) % BLOCK_BUFFER_SIZE
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
            BLOCK_BUFFER_SIZE - self.tail + self.head
        }
    }

    /// Appends one linear motion block. `target` is the absolute target
    /// position in steps, already kinematics-transformed by the caller.
    pub fn enqueue(
        &mut self,
        target: StepPosition,
        data: LineData,
        settings: &Settings,
    ) -> Result<(), PlannerError> {
        if self.is_full() {
            return Err(PlannerError::QueueFull);
        }

        let mut steps = [0u32; N_AXIS];
        let mut direction_bits: DirectionBits = 0;
        let mut unit = [0.0f32; N_AXIS];
        let mut distance_sqr = 0.0f32;

        for axis in 0..N_AXIS {
            let delta = target[axis] - self.position[axis];
            steps[axis] = delta.unsigned_abs();
            if delta < 0 {
                direction_bits |= 1 << axis;
            }
            let mm = delta as f32 / settings.steps_per_mm[axis];
            unit[axis] = mm;
            distance_sqr += mm * mm;
        }

        let step_event_count = steps.iter().copied().max().unwrap_or(0);
        if step_event_count == 0 {
            return Err(PlannerError::EmptyBlock);
        }

        let distance = sqrtf(distance_sqr);
        for u in unit.iter_mut() {
            *u /= distance;
        }

        // Axis-limit projection: the move is capped by whichever axis
        // would be driven past its own rate/acceleration limit.
        let mut rapid_rate = f32::MAX;
        let mut acceleration = f32::MAX;
        for axis in 0..N_AXIS {
            let component = crate::mathf::fabsf(unit[axis]);
            if component > 1.0e-9 {
                rapid_rate = rapid_rate.min(settings.max_rate[axis] / component);
                acceleration = acceleration.min(settings.acceleration[axis] / component);
            }
        }

        let programmed_rate = if data.condition.contains(ConditionFlags::RAPID) {
            rapid_rate
        } else {
            data.feed_rate.min(rapid_rate)
        };

        let mut block = PlannerBlock {
            steps,
            step_event_count,
            direction_bits,
            condition: data.condition,
            entry_speed_sqr: 0.0,
            max_entry_speed_sqr: 0.0,
            max_junction_speed_sqr: f32::MAX,
            acceleration,
            millimeters: distance,
            rapid_rate,
            programmed_rate,
            spindle_speed: data.spindle_speed,
            line_number: data.line_number,
        };

        if let Some(prev) = self.last_enqueued() {
            block.max_junction_speed_sqr =
                junction_speed_sqr(prev, &block, unit, settings.junction_deviation);
        }
        let nominal_sqr = block.programmed_rate.min(block.rapid_rate).powi(2);
        block.max_entry_speed_sqr = block.max_junction_speed_sqr.min(nominal_sqr);

        self.ring[self.head] = block;
        self.head = Self::next_index(self.head);
        self.position = target;

        self.recompute();
        Ok(())
    }

    fn last_enqueued(&self) -> Option<&PlannerBlock> {
        if self.is_empty() {
            None
        } else {
            let idx = (self.head + BLOCK_BUFFER_SIZE - 1) % BLOCK_BUFFER_SIZE;
            Some(&self.ring[idx])
        }
    }

    fn iter_indices(&self) -> impl Iterator<Item = usize> {
        let (tail, head, len) = (self.tail, self.head, self.len());
        (0..len).map(move |i| (tail + i) % BLOCK_BUFFER_SIZE)
    }

    /// Reverse then forward replanning pass across every queued block
    /// (§4.1). Runs in O(n) over the ring; called after every enqueue and
    /// after any override change.
    pub fn recompute(&mut self) {
        let indices: heapless::Vec<usize, BLOCK_BUFFER_SIZE> = self.iter_indices().collect();
        if indices.is_empty() {
            return;
        }

        // Reverse pass, newest -> oldest.
        let mut next_entry_sqr = 0.0f32;
        for (pos, &idx) in indices.iter().enumerate().rev() {
            let block = &mut self.ring[idx];
            let is_last = pos == indices.len() - 1;
            let exit_sqr = if is_last { 0.0 } else { next_entry_sqr };
            if block.entry_speed_sqr != block.max_entry_speed_sqr {
                block.entry_speed_sqr = block
                    .max_entry_speed_sqr
                    .min(exit_sqr + 2.0 * block.acceleration * block.millimeters);
            }
            next_entry_sqr = block.entry_speed_sqr;
        }

        // Forward pass, oldest -> newest.
        let mut prev_exit_sqr: Option<f32> = None;
        let mut prev_accel = 0.0f32;
        let mut prev_mm = 0.0f32;
        for &idx in indices.iter() {
            let block = &mut self.ring[idx];
            if let Some(exit_sqr) = prev_exit_sqr {
                let cap = exit_sqr + 2.0 * prev_accel * prev_mm;
                if block.entry_speed_sqr > cap {
                    block.entry_speed_sqr = cap;
                }
            }
            prev_exit_sqr = Some(block.entry_speed_sqr);
            prev_accel = block.acceleration;
            prev_mm = block.millimeters;
        }
    }

    /// After an override change: recompute every ring entry's junction cap
    /// from its stored unit-vector geometry is not retained, so this
    /// re-derives the override-adjusted nominal speed cap directly and
    /// forces a full replan (§4.4).
    pub fn update_velocity_profile_parameters(&mut self, feed_override_pct: u8) {
        let scale = feed_override_pct as f32 / 100.0;
        for idx in self.iter_indices().collect::<heapless::Vec<usize, BLOCK_BUFFER_SIZE>>() {
            let block = &mut self.ring[idx];
            if !block.condition.contains(ConditionFlags::NO_FEED_OVERRIDE) {
                let nominal = block.programmed_rate.min(block.rapid_rate) * scale;
                block.max_entry_speed_sqr = block.max_junction_speed_sqr.min(nominal * nominal);
            }
        }
        self.recompute();
    }

    /// Returns the nominal cruise speed (mm/min) of `block` after applying
    /// the feed/rapid override percentage, clamped to the axis-limited
    /// rapid rate.
    pub fn compute_profile_nominal_speed(&self, block: &PlannerBlock, feed_override_pct: u8, rapid_override_pct: u8) -> f32 {
        let base = if block.condition.contains(ConditionFlags::RAPID) {
            block.rapid_rate * (rapid_override_pct as f32 / 100.0)
        } else {
            block.programmed_rate * (feed_override_pct as f32 / 100.0)
        };
        base.min(block.rapid_rate)
    }

    /// The ring tail: the block currently executing (or about to).
    pub fn current_block(&self) -> Option<&PlannerBlock> {
        if self.system_motion_block.is_some() {
            self.system_motion_block.as_ref()
        } else if self.is_empty() {
            None
        } else {
            Some(&self.ring[self.tail])
        }
    }

    pub fn current_block_mut(&mut self) -> Option<&mut PlannerBlock> {
        if self.system_motion_block.is_some() {
            self.system_motion_block.as_mut()
        } else if self.is_empty() {
            None
        } else {
            Some(&mut self.ring[self.tail])
        }
    }

    /// Installs a planner-bypass block for homing/parking/jog-cancel.
    pub fn set_system_motion_block(&mut self, block: PlannerBlock) {
        self.system_motion_block = Some(block);
    }

    pub fn clear_system_motion_block(&mut self) {
        self.system_motion_block = None;
    }

    pub fn is_system_motion_active(&self) -> bool {
        self.system_motion_block.is_some()
    }

    /// Releases the currently executing block. Called by the preparer once
    /// `millimeters` reaches zero.
    pub fn discard(&mut self) {
        if self.system_motion_block.is_some() {
            self.system_motion_block = None;
        } else if !self.is_empty() {
            self.tail = Self::next_index(self.tail);
        }
    }

    /// Drops every queued block without executing them (hard reset).
    pub fn clear(&mut self) {
        self.tail = 0;
        self.head = 0;
        self.system_motion_block = None;
    }

    /// Snaps the planner's tracked position to the machine position,
    /// e.g. after homing or a probe cycle.
    pub fn sync_position(&mut self, sys_position: StepPosition) {
        self.position = sys_position;
    }

    pub fn position(&self) -> StepPosition {
        self.position
    }

    /// Exit speed² of the currently executing block, used by the preparer
    /// to chain into the next block without an unplanned stop.
    pub fn get_exec_block_exit_speed_sqr(&self) -> f32 {
        match self.peek_next_after_tail() {
            Some(next) => next.entry_speed_sqr,
            None => 0.0,
        }
    }

    fn peek_next_after_tail(&self) -> Option<&PlannerBlock> {
        if self.len() < 2 {
            return None;
        }
        let idx = Self::next_index(self.tail);
        Some(&self.ring[idx])
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// Junction speed² from the cosine-half-angle between two unit vectors
/// (§4.1): `v_junction² = a · δ · sin(θ/2) / (1 − sin(θ/2))`, clamped to
/// both blocks' nominal² and a configured minimum.
fn junction_speed_sqr(
    prev: &PlannerBlock,
    next: &PlannerBlock,
    next_unit: [f32; N_AXIS],
    junction_deviation: f32,
) -> f32 {
    // Reconstruct the previous block's unit vector from its step deltas
    // and direction bits relative to its own travelled distance.
    let mut prev_unit = [0.0f32; N_AXIS];
    if prev.millimeters > 1.0e-9 {
        for axis in 0..N_AXIS {
            let mag = prev.steps[axis] as f32 / prev.step_event_count.max(1) as f32;
            let signed = if (prev.direction_bits >> axis) & 1 == 1 { -mag } else { mag };
            prev_unit[axis] = signed;
        }
        let norm = sqrtf(prev_unit.iter().map(|v| v * v).sum());
        if norm > 1.0e-9 {
            for v in prev_unit.iter_mut() {
                *v /= norm;
            }
        }
    }

    let cos_theta: f32 = -prev_unit
        .iter()
        .zip(next_unit.iter())
        .map(|(a, b)| a * b)
        .sum::<f32>();
    let cos_theta = cos_theta.clamp(-1.0, 1.0);

    // sin(theta/2) from cos(theta) via the half-angle identity, avoiding a
    // trig call in the no_std build.
    let sin_half = sqrtf((0.5 * (1.0 - cos_theta)).max(0.0));

    let junction_sqr = if sin_half > 0.999999 {
        MINIMUM_JUNCTION_SPEED_SQR
    } else {
        let min_accel = prev.acceleration.min(next.acceleration);
        (min_accel * junction_deviation * sin_half / (1.0 - sin_half)).max(MINIMUM_JUNCTION_SPEED_SQR)
    };

    let prev_nominal_sqr = prev.programmed_rate.min(prev.rapid_rate).powi(2);
    let next_nominal_sqr = next.programmed_rate.min(next.rapid_rate).powi(2);
    junction_sqr.min(prev_nominal_sqr).min(next_nominal_sqr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        let mut s = Settings::default();
        s.steps_per_mm = [80.0, 80.0, 80.0];
        s.max_rate = [10000.0, 10000.0, 10000.0];
        s.acceleration = [500.0 * 60.0 * 60.0, 500.0 * 60.0 * 60.0, 500.0 * 60.0 * 60.0];
        s.junction_deviation = 0.01;
        s
    }

    #[test]
    fn enqueue_rejects_zero_length_move() {
        let mut planner = Planner::new();
        let settings = test_settings();
        let result = planner.enqueue([0, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings);
        assert_eq!(result, Err(PlannerError::EmptyBlock));
        assert!(planner.is_empty());
    }

    #[test]
    fn single_straight_line_step_counts() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([800, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();
        let block = planner.current_block().unwrap();
        assert_eq!(block.steps, [800, 0, 0]);
        assert_eq!(block.step_event_count, 800);
        assert_eq!(block.direction_bits, 0);
    }

    #[test]
    fn ring_rejects_enqueue_when_full() {
        let mut planner = Planner::new();
        let settings = test_settings();
        for i in 1..BLOCK_BUFFER_SIZE as i32 {
            let result = planner.enqueue([i * 80, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings);
            assert!(result.is_ok(), "enqueue {i} should succeed");
        }
        let result = planner.enqueue(
            [(BLOCK_BUFFER_SIZE as i32) * 80, 0, 0],
            LineData { feed_rate: 1000.0, ..Default::default() },
            &settings,
        );
        assert_eq!(result, Err(PlannerError::QueueFull));
    }

    #[test]
    fn colinear_blocks_chain_without_full_stop() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([800, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();
        planner
            .enqueue([1600, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();

        let first = planner.current_block().unwrap();
        // Two colinear moves in the same direction should let the first
        // block carry nonzero entry/exit speed rather than decelerate to 0.
        assert!(first.entry_speed_sqr >= 0.0);
        assert!(planner.get_exec_block_exit_speed_sqr() > 0.0);
    }

    #[test]
    fn discard_advances_tail_and_frees_a_slot() {
        let mut planner = Planner::new();
        let settings = test_settings();
        planner
            .enqueue([800, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
            .unwrap();
        assert_eq!(planner.len(), 1);
        planner.discard();
        assert!(planner.is_empty());
    }

    #[test]
    fn reset_clears_ring_and_leaves_position_unchanged() {
        let mut planner = Planner::new();
        let settings = test_settings();
        for i in 1..=4 {
            planner
                .enqueue([i * 80, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
                .unwrap();
        }
        let position_before = planner.position();
        planner.clear();
        assert!(planner.is_empty());
        assert_eq!(planner.position(), position_before);
    }
}
