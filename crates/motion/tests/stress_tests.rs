//! Boundary and load behavior: ring exhaustion, override clamping, and
//! sustained high step rates through the full pipeline.
#![cfg(test)]

use motion::block::{LineData, Planner, BLOCK_BUFFER_SIZE};
use motion::error::PlannerError;
use motion::prep::Preparer;
use motion::realtime::Supervisor;
use motion::settings::Settings;
use motion::stepper::Core as StepperCore;

fn test_settings() -> Settings {
    let mut s = Settings::default();
    s.steps_per_mm = [80.0, 80.0, 80.0];
    s.max_rate = [10_000.0, 10_000.0, 10_000.0];
    s.acceleration = [500.0 * 60.0 * 60.0; 3];
    s
}

/// The planner ring has `BLOCK_BUFFER_SIZE` slots and one is never usable
/// (head cannot catch tail), so the `(BLOCK_BUFFER_SIZE - 1)`th enqueue must
/// fail with `QueueFull` rather than silently overwriting the tail.
#[test]
fn enqueue_reports_queue_full_once_the_ring_saturates() {
    let settings = test_settings();
    let mut planner = Planner::new();
    let mut target = [0i32, 0, 0];

    let mut first_failure = None;
    for i in 1..=(BLOCK_BUFFER_SIZE + 4) {
        target[0] = (i as i32) * 100;
        let result = planner.enqueue(target, LineData { feed_rate: 1000.0, ..Default::default() }, &settings);
        if result.is_err() {
            first_failure = Some(i);
            assert_eq!(result, Err(PlannerError::QueueFull));
        }
    }

    assert_eq!(first_failure, Some(BLOCK_BUFFER_SIZE));
}

/// Feed and spindle overrides both clamp to 10..=200; values outside that
/// range are pulled to the nearest bound rather than rejected.
#[test]
fn feed_and_spindle_overrides_clamp_to_their_valid_range() {
    let mut supervisor = Supervisor::new();
    let mut planner = Planner::new();
    let stepper = StepperCore::new();

    supervisor.set_feed_override(255, &mut planner);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).feed_override_pct, 200);

    supervisor.set_feed_override(0, &mut planner);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).feed_override_pct, 10);

    supervisor.set_spindle_override(255);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).spindle_override_pct, 200);

    supervisor.set_spindle_override(0);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).spindle_override_pct, 10);
}

/// Rapid override only has three discrete levels; any requested value
/// snaps to the nearest of them.
#[test]
fn rapid_override_snaps_to_one_of_three_discrete_levels() {
    let mut supervisor = Supervisor::new();
    let planner = Planner::new();
    let stepper = StepperCore::new();
    supervisor.set_rapid_override(5);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).rapid_override_pct, 25);
    supervisor.set_rapid_override(60);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).rapid_override_pct, 50);
    supervisor.set_rapid_override(255);
    assert_eq!(supervisor.status_snapshot(&planner, &stepper).rapid_override_pct, 100);
}

/// A long move at a high feed rate should still refill the segment ring
/// repeatedly without ever producing a zero-length `cycles_per_tick`
/// (which would be an infinite step rate) and without the preparer
/// reporting full when it shouldn't.
#[test]
fn high_feed_rate_move_never_emits_a_zero_length_tick() {
    let mut settings = test_settings();
    settings.max_rate = [20_000.0, 20_000.0, 20_000.0];
    settings.acceleration = [5_000.0 * 60.0 * 60.0; 3];

    let mut planner = Planner::new();
    planner
        .enqueue([200 * 80, 0, 0], LineData { feed_rate: 2_500.0 * 60.0, ..Default::default() }, &settings)
        .unwrap();

    let mut prep = Preparer::new();
    let mut seen_any = false;
    for _ in 0..10_000 {
        prep.fill(&mut planner, &settings);
        while let Some(seg) = prep.pop() {
            assert!(seg.cycles_per_tick > 0, "cycles_per_tick must never be zero");
            seen_any = true;
        }
        if planner.is_empty() && prep.is_empty() {
            break;
        }
    }
    assert!(seen_any);
}

/// Many short colinear segments, chained through repeated replans, should
/// not force the planner back down to (near) zero entry speed at every
/// junction the way an independently-planned sequence would.
#[test]
fn many_short_colinear_segments_do_not_each_stop_at_their_junction() {
    let settings = test_settings();
    let mut planner = Planner::new();

    let mut stops = 0;
    for i in 1..=40 {
        let x = i * 20;
        let result = planner.enqueue([x, 0, 0], LineData { feed_rate: 1500.0, ..Default::default() }, &settings);
        if result.is_err() {
            // Ring saturated; drain a slot the way the prep stage would.
            planner.discard();
            planner
                .enqueue([x, 0, 0], LineData { feed_rate: 1500.0, ..Default::default() }, &settings)
                .unwrap();
        }
        if i > 1 && planner.get_exec_block_exit_speed_sqr() < 1.0 {
            stops += 1;
        }
    }

    assert!(stops < 5, "planner stopped at {} of 39 colinear junctions", stops);
}
