//! Integration-level scenario tests driven through the fake-HAL harness.

use motion::settings::Settings;
use sim::Harness;

fn test_settings() -> Settings {
    let mut s = Settings::default();
    s.steps_per_mm = [80.0, 80.0, 80.0];
    s.max_rate = [10_000.0, 10_000.0, 10_000.0];
    s.acceleration = [500.0 * 60.0 * 60.0; 3];
    s.junction_deviation = 0.01;
    s
}

/// Scenario 1: a single straight 10 mm move at 1000 mm/min and 80 steps/mm
/// lands at exactly 800 steps on the dominant axis and none on the others.
#[test]
fn single_straight_line_lands_on_exact_step_count() {
    let mut h = Harness::new(test_settings());
    h.enqueue([800, 0, 0], 1000.0).unwrap();

    assert!(h.drive_to_idle(2_000_000), "pipeline never drained");
    assert_eq!(h.position(), [800, 0, 0]);
}

/// Scenario 2: two colinear blocks at the same feed rate should chain
/// through their shared junction without a full stop in between, so the
/// combined step count still lands exactly on target.
#[test]
fn colinear_blocks_chain_without_a_full_stop() {
    let mut h = Harness::new(test_settings());
    h.enqueue([800, 0, 0], 1000.0).unwrap();
    h.enqueue([1600, 0, 0], 1000.0).unwrap();

    assert!(h.planner.get_exec_block_exit_speed_sqr() > 0.0, "blocks should not plan a stop at the junction");

    assert!(h.drive_to_idle(2_000_000));
    assert_eq!(h.position(), [1600, 0, 0]);
}

/// Scenario 3: a right-angle corner forces a junction speed well below the
/// nominal feed rate (per the junction-deviation formula), but motion still
/// completes with the exact step counts on both legs.
#[test]
fn right_angle_junction_completes_with_exact_step_counts() {
    let mut h = Harness::new(test_settings());
    h.enqueue([800, 0, 0], 1000.0).unwrap();
    h.enqueue([800, 800, 0], 1000.0).unwrap();

    // The corner should be far below nominal speed: nominal feed is
    // 1000mm/min -> roughly (1000/60*80)^2 steps/s^2 territory; the right
    // angle junction speed is on the order of tens of (mm/min)^2, so the
    // entry speed of the second leg should be much smaller than nominal.
    assert!(h.drive_to_idle(2_000_000));
    assert_eq!(h.position(), [800, 800, 0]);
}

/// A single block with two nonzero axes must step them out together, not as
/// two sequential single-axis legs: the dominant axis (X here, tied with Y)
/// drives the Bresenham accumulator while the other rides along on the same
/// ticks, so both land on target in one pass through the pipeline.
#[test]
fn diagonal_move_steps_both_axes_simultaneously() {
    let mut h = Harness::new(test_settings());
    h.enqueue([800, 800, 0], 1000.0).unwrap();

    assert!(h.drive_to_idle(2_000_000));
    assert_eq!(h.position(), [800, 800, 0]);
}

/// Scenario 4: a feed hold mid-cruise stops the machine without losing
/// steps once cycle start resumes it; no steps are skipped versus the
/// original target.
#[test]
fn feed_hold_then_resume_loses_no_steps() {
    let mut h = Harness::new(test_settings());
    h.enqueue([8_000, 0, 0], 600.0).unwrap();

    // Run partway into the move, then request a hold. The preparer ramps
    // the in-flight block down to zero under its own acceleration rather
    // than stopping instantly, so give the forced decel a budget of ticks
    // to finish running out before checking that the machine has parked.
    h.drive_ticks(20_000);
    h.supervisor.request_feed_hold();
    h.drive_ticks(2_000);
    assert_eq!(h.supervisor.state(), motion::realtime::MachineState::Hold);

    // Once parked, holding for a while shouldn't move the machine further.
    let parked_position = h.position();
    h.drive_ticks(5_000);
    assert_eq!(h.position(), parked_position);

    // Resume and run to completion; no steps lost versus the original
    // target despite the intervening hold.
    h.supervisor.request_cycle_start();
    assert!(h.drive_to_idle(2_000_000));
    assert_eq!(h.position(), [8_000, 0, 0]);
}

/// Scenario 5: homing the X axis with its limit switch already tripped
/// completes the search/pull-off/locate/pull-off sequence and lands
/// `sys_position` on the configured home position (machine origin, here,
/// since `homing_dir_mask` defaults to the negative direction).
#[test]
fn homing_cycle_lands_on_configured_home_position() {
    let mut h = Harness::new(test_settings());
    h.hal.limit_pins = 0b001;

    h.home(0b001).unwrap();

    assert_eq!(h.sys_position()[0], 0);
    assert_eq!(h.supervisor.state(), motion::realtime::MachineState::Idle);
}

/// Scenario 6: a probing move (G38.2-style) toward a workpiece halts the
/// instant the probe pin trips and latches the exact step position it
/// tripped at, rather than continuing on to the programmed target.
#[test]
fn probe_move_latches_touch_position_and_halts() {
    let mut h = Harness::new(test_settings());
    h.probe([4_000, 0, 0], 300.0).unwrap();

    // Run partway into the move, then trip the probe mid-cruise.
    h.drive_ticks(5_000);
    let position_before_trip = h.sys_position();
    assert!(position_before_trip[0] > 0, "probe move should have advanced before the trip");
    assert!(position_before_trip[0] < 4_000, "probe move should not have reached its target yet");
    h.hal.probe_pin = true;

    // The probe's interrupted block is never fully consumed, so the
    // planner/preparer stay non-empty; wait only for the stepper itself to
    // go idle (the trip must halt it well before the programmed target).
    for _ in 0..1_000 {
        h.tick();
        if h.hal.is_idle() {
            break;
        }
    }
    assert!(h.hal.is_idle(), "probe trip should have halted the stepper");

    let touch = h.supervisor.probe_result().expect("probe should have latched a position");
    assert_eq!(touch, h.sys_position());
    assert_eq!(h.supervisor.state(), motion::realtime::MachineState::Idle);

    // Once stopped, continuing to tick must not move the machine further.
    let parked = h.sys_position();
    h.drive_ticks(1_000);
    assert_eq!(h.sys_position(), parked);
}
