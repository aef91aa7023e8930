//! A fake HAL: motor motion is tracked in plain counters instead of driving
//! real GPIO/timers, and the input-side traits expose simple setters a test
//! can use to inject a limit/probe/control-pin transition at a chosen tick.

use motion::hal::{
    AxisMask, CoolantHal, DelayHal, LimitsHal, ProbeHal, SpindleHal, StepperHal, SystemControlHal,
};
use motion::{StepPosition, N_AXIS};
use tracing::trace;

#[derive(Debug, Default)]
pub struct FakeHal {
    pub position: StepPosition,
    dir_bits: AxisMask,
    driver_enabled: bool,
    base_timer_running: bool,
    pulse_timer_running: bool,
    pub base_timer_ticks_armed: u32,
    spindle_running: bool,
    spindle_cw: bool,
    spindle_pwm: u8,
    flood: bool,
    mist: bool,
    limits_enabled: bool,
    /// Bits set here are reported back by `LimitsHal::get_state` as already
    /// tripped, letting a test simulate a switch closing mid-homing.
    pub limit_pins: AxisMask,
    pub probe_pin: bool,
    pub control_pins: AxisMask,
    pub delay_ms_total: u32,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        !self.base_timer_running
    }
}

impl StepperHal for FakeHal {
    fn set_driver_state(&mut self, enabled: bool) {
        self.driver_enabled = enabled;
    }

    fn set_dir(&mut self, mask: AxisMask, bits: AxisMask) {
        self.dir_bits = (self.dir_bits & !mask) | (bits & mask);
    }

    fn set_step(&mut self, mask: AxisMask, bits: AxisMask) {
        for axis in 0..N_AXIS {
            let bit = 1 << axis;
            if mask & bit == 0 || bits & bit == 0 {
                continue;
            }
            let negative = (self.dir_bits >> axis) & 1 == 1;
            self.position[axis] += if negative { -1 } else { 1 };
        }
        trace!(position = ?self.position, "step");
    }

    fn base_timer_start(&mut self, cycles_per_tick: u16) {
        self.base_timer_running = true;
        self.base_timer_ticks_armed = cycles_per_tick as u32;
    }

    fn base_timer_stop(&mut self) {
        self.base_timer_running = false;
    }

    fn base_timer_set_reload(&mut self, cycles_per_tick: u16) {
        self.base_timer_ticks_armed = cycles_per_tick as u32;
    }

    fn pulse_timer_start(&mut self, _pulse_microseconds: u16) {
        self.pulse_timer_running = true;
    }

    fn pulse_timer_stop(&mut self) {
        self.pulse_timer_running = false;
    }
}

impl SpindleHal for FakeHal {
    fn init(&mut self) {}

    fn start(&mut self, clockwise: bool) {
        self.spindle_running = true;
        self.spindle_cw = clockwise;
    }

    fn stop(&mut self) {
        self.spindle_running = false;
    }

    fn set_pwm(&mut self, duty: u8) {
        self.spindle_pwm = duty;
    }

    fn get_state(&self) -> bool {
        self.spindle_running
    }
}

impl CoolantHal for FakeHal {
    fn init(&mut self) {}

    fn set_flood(&mut self, on: bool) {
        self.flood = on;
    }

    fn set_mist(&mut self, on: bool) {
        self.mist = on;
    }

    fn get_flood(&self) -> bool {
        self.flood
    }

    fn get_mist(&self) -> bool {
        self.mist
    }
}

impl LimitsHal for FakeHal {
    fn init(&mut self) {}

    fn set_enabled(&mut self, enabled: bool) {
        self.limits_enabled = enabled;
    }

    fn get_state(&self) -> AxisMask {
        self.limit_pins
    }
}

impl ProbeHal for FakeHal {
    fn init(&mut self) {}

    fn get_state(&self) -> bool {
        self.probe_pin
    }
}

impl SystemControlHal for FakeHal {
    fn init(&mut self) {}

    fn get_state(&self) -> AxisMask {
        self.control_pins
    }
}

impl DelayHal for FakeHal {
    fn delay_ms(&mut self, ms: u16) {
        self.delay_ms_total += ms as u32;
    }
}
