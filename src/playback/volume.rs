//! Stepped volume easing for start/pause transitions.
//!
//! Ramps run as discrete steps on a timer instead of stepping instantly, to
//! avoid audible clicks. A "quiet" ducking mode halves the target volume and
//! composes multiplicatively with whatever ramp is active.

/// Number of discrete steps per ramp.
pub const RAMP_STEPS: u32 = 8;
/// Spacing between ramp steps, in milliseconds.
pub const RAMP_STEP_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampDirection {
    /// Fade from silence up to the target volume.
    In,
    /// Fade from the target volume down to silence.
    Out,
}

/// Ramp state owned by the playback controller. Each `begin`/`cancel` bumps
/// the generation, so ticks from a superseded ramp are ignored by the caller.
#[derive(Debug)]
pub struct VolumeEase {
    generation: u64,
    active: Option<RampDirection>,
    quiet: bool,
}

impl Default for VolumeEase {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeEase {
    pub fn new() -> Self {
        Self {
            generation: 0,
            active: None,
            quiet: false,
        }
    }

    /// Starts a new ramp, invalidating any previous one. Returns the ramp
    /// generation ticks must carry.
    pub fn begin(&mut self, direction: RampDirection) -> u64 {
        self.generation += 1;
        self.active = Some(direction);
        self.generation
    }

    /// Cancels the active ramp (if any) by invalidating its generation.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.active = None;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn direction(&self) -> Option<RampDirection> {
        self.active
    }

    pub fn is_ramping_out(&self) -> bool {
        self.active == Some(RampDirection::Out)
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Target volume with ducking applied and no ramp in progress.
    pub fn base_volume(&self) -> f32 {
        if self.quiet {
            0.5
        } else {
            1.0
        }
    }

    /// Volume for step `step` (1..=[`RAMP_STEPS`]) of the active ramp.
    /// Returns `None` when no ramp is active.
    pub fn volume_at(&self, step: u32) -> Option<f32> {
        let direction = self.active?;
        let fraction = step.min(RAMP_STEPS) as f32 / RAMP_STEPS as f32;
        let fraction = match direction {
            RampDirection::In => fraction,
            RampDirection::Out => 1.0 - fraction,
        };
        Some(fraction * self.base_volume())
    }

    /// Marks the ramp finished once its final step has been applied.
    pub fn finish(&mut self) {
        self.active = None;
    }
}
