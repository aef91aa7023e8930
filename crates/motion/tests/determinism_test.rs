//! End-to-end determinism checks across planner -> preparer -> stepper core
//! (§8 concrete scenarios 1 and 2).

use motion::block::{LineData, Planner};
use motion::hal::{AxisMask, CoolantHal, DelayHal, LimitsHal, ProbeHal, SpindleHal, StepperHal, SystemControlHal};
use motion::prep::Preparer;
use motion::settings::Settings;
use motion::stepper::Core;

#[derive(Default)]
struct RecordingHal {
    steps: [i64; 3],
    dir_bits: u8,
    base_running: bool,
}

impl StepperHal for RecordingHal {
    fn set_driver_state(&mut self, _enabled: bool) {}
    fn set_dir(&mut self, mask: AxisMask, bits: AxisMask) {
        self.dir_bits = (self.dir_bits & !mask) | (bits & mask);
    }
    fn set_step(&mut self, mask: AxisMask, _bits: AxisMask) {
        for axis in 0..3 {
            if mask & (1 << axis) != 0 {
                let negative = (self.dir_bits >> axis) & 1 == 1;
                self.steps[axis] += if negative { -1 } else { 1 };
            }
        }
    }
    fn base_timer_start(&mut self, _cycles_per_tick: u16) {
        self.base_running = true;
    }
    fn base_timer_stop(&mut self) {
        self.base_running = false;
    }
    fn base_timer_set_reload(&mut self, _cycles_per_tick: u16) {}
    fn pulse_timer_start(&mut self, _pulse_microseconds: u16) {}
    fn pulse_timer_stop(&mut self) {}
}
impl SpindleHal for RecordingHal {
    fn init(&mut self) {}
    fn start(&mut self, _clockwise: bool) {}
    fn stop(&mut self) {}
    fn set_pwm(&mut self, _duty: u8) {}
    fn get_state(&self) -> bool {
        false
    }
}
impl CoolantHal for RecordingHal {
    fn init(&mut self) {}
    fn set_flood(&mut self, _on: bool) {}
    fn set_mist(&mut self, _on: bool) {}
    fn get_flood(&self) -> bool {
        false
    }
    fn get_mist(&self) -> bool {
        false
    }
}
impl LimitsHal for RecordingHal {
    fn init(&mut self) {}
    fn set_enabled(&mut self, _enabled: bool) {}
    fn get_state(&self) -> AxisMask {
        0
    }
}
impl ProbeHal for RecordingHal {
    fn init(&mut self) {}
    fn get_state(&self) -> bool {
        false
    }
}
impl SystemControlHal for RecordingHal {
    fn init(&mut self) {}
    fn get_state(&self) -> AxisMask {
        0
    }
}
impl DelayHal for RecordingHal {
    fn delay_ms(&mut self, _ms: u16) {}
}

/// Alternates refilling the segment ring and ticking the base timer until
/// both the planner and the preparer have drained, mirroring the real
/// main-loop/ISR split without needing actual timer interrupts.
fn drive_to_completion(planner: &mut Planner, prep: &mut Preparer, settings: &Settings, hal: &mut RecordingHal) {
    let core = Core::new();
    for _ in 0..2_000_000 {
        prep.fill(planner, settings);
        core.base_timer_fired(hal, prep);
        if !hal.base_running && planner.is_empty() && prep.is_empty() {
            break;
        }
    }
}

fn test_settings() -> Settings {
    let mut s = Settings::default();
    s.steps_per_mm = [80.0, 80.0, 80.0];
    s.max_rate = [10_000.0, 10_000.0, 10_000.0];
    s.acceleration = [500.0 * 60.0 * 60.0; 3];
    s
}

/// §8 scenario 1: a single straight line at a fixed feed rate produces
/// exactly the expected step count on the dominant axis and none on the
/// others.
#[test]
fn single_straight_line_produces_exact_step_count() {
    let settings = test_settings();
    let mut planner = Planner::new();
    planner
        .enqueue([800, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
        .unwrap();

    let mut prep = Preparer::new();
    let mut hal = RecordingHal::default();
    drive_to_completion(&mut planner, &mut prep, &settings, &mut hal);

    assert_eq!(hal.steps, [800, 0, 0]);
    assert!(planner.is_empty());
}

/// An asymmetric diagonal (X twice Y) exercises the Bresenham accumulator's
/// subordinate-axis path directly: Y must advance at half the rate of the
/// dominant X axis and still land exactly on target, confirming step
/// conservation across a genuinely simultaneous multi-axis move rather than
/// two sequential single-axis legs.
#[test]
fn asymmetric_diagonal_line_lands_on_exact_step_counts_for_both_axes() {
    let settings = test_settings();
    let mut planner = Planner::new();
    planner
        .enqueue([800, 400, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
        .unwrap();

    let mut prep = Preparer::new();
    let mut hal = RecordingHal::default();
    drive_to_completion(&mut planner, &mut prep, &settings, &mut hal);

    assert_eq!(hal.steps, [800, 400, 0]);
    assert!(planner.is_empty());
}

/// §8 scenario 2: two colinear blocks at the same feed rate should chain
/// through their shared junction without decelerating to a full stop — the
/// first block's exit speed (= second block's entry speed) must be nonzero.
#[test]
fn colinear_blocks_do_not_fully_stop_at_the_junction() {
    let settings = test_settings();
    let mut planner = Planner::new();
    planner
        .enqueue([800, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
        .unwrap();
    planner
        .enqueue([1600, 0, 0], LineData { feed_rate: 1000.0, ..Default::default() }, &settings)
        .unwrap();

    assert!(planner.get_exec_block_exit_speed_sqr() > 0.0);

    let mut prep = Preparer::new();
    let mut hal = RecordingHal::default();
    drive_to_completion(&mut planner, &mut prep, &settings, &mut hal);

    assert_eq!(hal.steps, [1600, 0, 0]);
}
