//! Deterministic tick-stepping harness: advances the pipeline one base-timer
//! tick at a time, the same unit of work a real backend's timer ISR would
//! perform, so scenario tests see exactly the sequence of steps a machine
//! would produce.

use motion::block::{LineData, Planner};
use motion::hal::{AxisMask, ProbeHal};
use motion::kinematics::CartesianKinematics;
use motion::prep::Preparer;
use motion::realtime::Supervisor;
use motion::settings::Settings;
use motion::stepper::Core;
use motion::{PlannerError, StepPosition};
use tracing::debug;

use crate::fake_hal::FakeHal;

pub struct Harness {
    pub planner: Planner,
    pub prep: Preparer,
    pub stepper: Core,
    pub supervisor: Supervisor,
    pub settings: Settings,
    pub hal: FakeHal,
    pub kinematics: CartesianKinematics,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let stepper = Core::new();
        stepper.configure(&settings);
        let kinematics = CartesianKinematics { steps_per_mm: settings.steps_per_mm };
        Harness {
            planner: Planner::new(),
            prep: Preparer::new(),
            stepper,
            supervisor: Supervisor::new(),
            settings,
            hal: FakeHal::new(),
            kinematics,
        }
    }

    /// Enqueues one straight-line motion block.
    pub fn enqueue(&mut self, target: StepPosition, feed_rate: f32) -> Result<(), PlannerError> {
        self.planner.enqueue(target, LineData { feed_rate, ..Default::default() }, &self.settings)
    }

    /// Runs the homing cycle for the given axis mask, blocking until it
    /// completes (search, pull-off, locate, pull-off) or fails.
    pub fn home(&mut self, cycle_mask: AxisMask) -> Result<(), motion::AlarmCode> {
        self.supervisor.homing_cycle(cycle_mask, &self.settings, &self.kinematics, &self.stepper, &mut self.hal)
    }

    /// Enqueues a probing move (G38.2-style): motion toward `target`, halted
    /// and the touch position latched the moment the probe pin trips.
    pub fn probe(&mut self, target: StepPosition, feed_rate: f32) -> Result<(), PlannerError> {
        self.supervisor.probe(target, feed_rate, &mut self.planner, &self.settings)
    }

    pub fn sys_position(&self) -> StepPosition {
        self.supervisor.sys_position(&self.stepper)
    }

    /// Advances the pipeline by one base-timer tick, running main-loop
    /// housekeeping (preparer refill, realtime servicing) first, the way a
    /// real firmware's main loop interleaves with its ISRs.
    pub fn tick(&mut self) {
        self.supervisor.service(&self.stepper, &mut self.hal, &mut self.planner, &mut self.prep, &self.settings);
        self.supervisor.poll_probe(ProbeHal::get_state(&self.hal), &self.stepper, &mut self.hal);
        // Keep ticking through a hold: the preparer's forced-decel ramp
        // (`Preparer::begin_hold`) needs the pipeline to keep running so the
        // machine actually decelerates to a stop instead of freezing in
        // place mid-speed.
        self.prep.fill(&mut self.planner, &self.settings);
        self.stepper.base_timer_fired(&mut self.hal, &mut self.prep);
    }

    /// Runs ticks until the pipeline goes fully idle (planner and preparer
    /// drained, base timer stopped) or `max_ticks` is exhausted.
    ///
    /// Returns `true` if the pipeline drained before the tick budget ran
    /// out.
    pub fn drive_to_idle(&mut self, max_ticks: u32) -> bool {
        for i in 0..max_ticks {
            self.tick();
            if self.planner.is_empty() && self.prep.is_empty() && self.hal.is_idle() {
                debug!(ticks = i + 1, "pipeline drained");
                return true;
            }
        }
        false
    }

    /// Runs exactly `ticks` base-timer ticks without checking for idle,
    /// useful for sampling mid-motion state (feed hold, probe trip).
    pub fn drive_ticks(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn position(&self) -> StepPosition {
        self.hal.position
    }
}
