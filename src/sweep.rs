/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

//! Bounded parameter sweep over a running acquisition.
//!
//! The controller applies one parameter value per processed frame. A value is
//! written to the device before the retrieval that should observe it, so the
//! value in effect when a retrieval is issued is the one the frame is tagged
//! with. Devices that only pick up a change on a later exposure cycle can be
//! given `settle_frames`, which discards that many frames after every change.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::camera::{DeviceError, DeviceHandle, Parameter, RetrieveError};
use crate::cancel::CancelToken;
use crate::sink::FrameSink;

/// Relative share of a step by which a value may pass the bound and still count
/// as reaching it.
const BOUND_TOLERANCE: f64 = 1e-9;

/// Parameters of a single sweep session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Device parameter that is swept
    pub parameter: Parameter,
    /// Upper limit on grab results for the whole session
    pub frame_count: u32,
    pub initial_value: f64,
    /// Increment after each processed frame; its sign gives the sweep direction
    pub step: f64,
    /// Last value that may be applied, inclusive
    pub upper_bound: f64,
    pub retrieval_timeout: Duration,
    /// Frames dropped after each parameter change
    pub settle_frames: u32,
    /// Size of the device buffer pool, `None` keeps the device default
    pub buffer_count: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            parameter: Parameter::ExposureTime,
            frame_count: 100,
            initial_value: 0.0,
            step: 5e4,
            upper_bound: 1e6,
            retrieval_timeout: Duration::from_millis(5000),
            settle_frames: 0,
            buffer_count: Some(5),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        let invalid = |msg: String| Err(SweepError::InvalidSweepConfig(msg));
        if self.frame_count == 0 {
            return invalid("frame count must be at least 1".to_string());
        }
        if self.retrieval_timeout.is_zero() {
            return invalid("retrieval timeout must be positive".to_string());
        }
        for (name, value) in [
            ("initial value", self.initial_value),
            ("step", self.step),
            ("upper bound", self.upper_bound),
        ] {
            if !value.is_finite() {
                return invalid(format!("{} must be finite, got {}", name, value));
            }
        }
        if self.step == 0.0 {
            return invalid("step must not be zero".to_string());
        }
        let span = self.upper_bound - self.initial_value;
        if span != 0.0 && span.is_sign_positive() != self.step.is_sign_positive() {
            return invalid(format!(
                "step {} never reaches bound {} from {}",
                self.step, self.upper_bound, self.initial_value
            ));
        }
        if self.buffer_count == Some(0) {
            return invalid("buffer count must be at least 1".to_string());
        }
        Ok(())
    }

    /// Number of frames the sweep processes when no frame is lost.
    pub fn planned_frames(&self) -> u32 {
        let span = (self.upper_bound - self.initial_value) / self.step;
        let steps = (span + BOUND_TOLERANCE).floor();
        let values = if steps.is_finite() && steps >= 0.0 {
            steps.min(u32::MAX as f64 - 1.0) as u32 + 1
        } else {
            1
        };
        values.min(self.frame_count)
    }
}

/// Progress of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepState {
    initial_value: f64,
    step: f64,
    upper_bound: f64,
    steps_taken: u32,
    /// Value applied to the device for the next frame
    pub current_value: f64,
    pub frames_requested: u32,
    pub frames_completed: u32,
}

impl SweepState {
    pub fn new(config: &SessionConfig) -> Self {
        SweepState {
            initial_value: config.initial_value,
            step: config.step,
            upper_bound: config.upper_bound,
            steps_taken: 0,
            current_value: config.initial_value,
            frames_requested: config.frame_count,
            frames_completed: 0,
        }
    }

    /// How far `value` lies past the bound in sweep direction.
    fn overshoot(&self, value: f64) -> f64 {
        if self.step > 0.0 {
            value - self.upper_bound
        } else {
            self.upper_bound - value
        }
    }

    /// Value following `current_value`, or `None` once it would pass the bound.
    ///
    /// Values are derived from the step count rather than accumulated. A value
    /// that passes the bound by rounding noise only is clamped to the bound.
    pub fn next_value(&self) -> Option<f64> {
        let next = self.initial_value + self.step * f64::from(self.steps_taken + 1);
        let overshoot = self.overshoot(next);
        if overshoot > self.step.abs() * BOUND_TOLERANCE {
            None
        } else if overshoot > 0.0 {
            Some(self.upper_bound)
        } else {
            Some(next)
        }
    }

    fn advance(&mut self, next: f64) {
        self.steps_taken += 1;
        self.current_value = next;
    }
}

/// Fatal condition that ended a session early.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FatalKind {
    #[error("no frame within {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("device fault: {0}")]
    DeviceFault(DeviceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    /// The device delivered every requested frame
    FrameCountReached,
    /// The next value would have passed the upper bound
    BoundReached,
    UserCancelled,
    FatalError(FatalKind),
}

impl TerminationReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TerminationReason::FatalError(_))
    }
}

/// Outcome of [SweepController::run].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    /// Frames handed to the sink without error
    pub frames_completed: u32,
    /// Grab results the device reported as failed
    pub frames_skipped: u32,
    /// Frames dropped while a new value settled
    pub frames_discarded: u32,
    pub sink_failures: u32,
    /// Processed frames whose reported exposure belongs to another sweep value
    pub exposure_mismatches: u32,
    /// Last value applied to the device
    pub last_value: f64,
    pub termination_reason: TerminationReason,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("invalid sweep configuration: {0}")]
    InvalidSweepConfig(String),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// A running acquisition that is stopped when dropped.
pub struct Acquisition<'d, D: DeviceHandle + ?Sized> {
    device: &'d mut D,
    stopped: bool,
}

impl<'d, D: DeviceHandle + ?Sized> Acquisition<'d, D> {
    pub fn start(device: &'d mut D, frame_count: u32) -> Result<Self, DeviceError> {
        device.start(frame_count)?;
        Ok(Acquisition {
            device,
            stopped: false,
        })
    }

    pub fn device(&mut self) -> &mut D {
        &mut *self.device
    }

    pub fn is_active(&self) -> bool {
        !self.stopped && self.device.is_active()
    }

    /// Stop the device once; later calls do nothing.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.device.stop()
    }
}

impl<D: DeviceHandle + ?Sized> Drop for Acquisition<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("failed to stop acquisition: {}", e);
        }
    }
}

/// Drives a device through a parameter sweep and feeds each frame to a sink.
pub struct SweepController {
    config: SessionConfig,
    cancel: CancelToken,
}

impl SweepController {
    pub fn new(config: SessionConfig) -> Result<Self, SweepError> {
        config.validate()?;
        Ok(SweepController {
            config,
            cancel: CancelToken::new(),
        })
    }

    /// Use `cancel` to end the sweep from outside; it is checked once per frame.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run one session.
    ///
    /// Errors before acquisition starts are returned as `Err`. Once frames are
    /// flowing every outcome, fatal ones included, is reported through
    /// [SessionResult::termination_reason] together with the partial counts.
    pub fn run<D, S>(&self, device: &mut D, sink: &mut S) -> Result<SessionResult, SweepError>
    where
        D: DeviceHandle + ?Sized,
        S: FrameSink + ?Sized,
    {
        let config = &self.config;
        let parameter = config.parameter;
        info!("Using device {}", device.model_name());

        for auto in Parameter::AUTO_CONTROLLED {
            if device.disable_auto(auto) {
                debug!("{} auto mode off", auto);
            } else {
                warn!("{} auto mode cannot be switched off, continuing", auto);
            }
        }
        if let Some(count) = config.buffer_count {
            device.set_buffer_count(count)?;
        }
        device.set_parameter(parameter, config.initial_value)?;
        info!(
            "sweeping {} from {} by {} up to {} ({} frames planned, {} max)",
            parameter,
            config.initial_value,
            config.step,
            config.upper_bound,
            config.planned_frames(),
            config.frame_count
        );

        let mut state = SweepState::new(config);
        let mut frames_skipped = 0;
        let mut frames_discarded = 0;
        let mut sink_failures = 0;
        let mut exposure_mismatches = 0;
        // The sensor rounds exposure to whole lines; only a difference of half a
        // step or more points at a frame taken under a neighbouring value.
        let exposure_tolerance = config.step.abs() / 2.0;
        // the initial value was just written as well
        let mut settling = config.settle_frames;

        let mut acquisition = Acquisition::start(device, config.frame_count)?;
        let mut reason = loop {
            if !acquisition.is_active() {
                break TerminationReason::FrameCountReached;
            }
            if self.cancel.is_cancelled() {
                info!("sweep cancelled");
                break TerminationReason::UserCancelled;
            }

            let gain = acquisition.device().get_parameter(Parameter::Gain).ok();
            let frame = match acquisition.device().retrieve(config.retrieval_timeout) {
                Ok(frame) => frame,
                Err(RetrieveError::Timeout(timeout)) => {
                    error!("no frame within {:?}", timeout);
                    break TerminationReason::FatalError(FatalKind::AcquisitionTimeout(timeout));
                }
                Err(RetrieveError::DeviceReportedFailure { code, description }) => {
                    warn!("Error: {} {}", code, description);
                    frames_skipped += 1;
                    continue;
                }
                Err(RetrieveError::Device(e)) => {
                    error!("retrieval failed: {}", e);
                    break TerminationReason::FatalError(FatalKind::DeviceFault(e));
                }
            };

            if settling > 0 {
                settling -= 1;
                frames_discarded += 1;
                debug!("discarding frame {} while {} settles", frame.frame_number(), parameter);
                continue;
            }

            let tagged_value = state.current_value;
            if let Some(gain) = gain {
                info!("gain value: {}", gain);
            }
            info!("current {}: {}", parameter, tagged_value);
            debug!(
                "frame {}: {}x{}, first pixel {:?}",
                frame.frame_number(),
                frame.width(),
                frame.height(),
                frame.first_pixel_value()
            );
            if parameter == Parameter::ExposureTime {
                if let Some(reported) = frame.exposure_us() {
                    if (reported - tagged_value).abs() >= exposure_tolerance {
                        exposure_mismatches += 1;
                        warn!(
                            "frame {} was exposed for {} us but tagged {} us",
                            frame.frame_number(),
                            reported,
                            tagged_value
                        );
                    }
                }
            }

            match sink.process(&frame, tagged_value) {
                Ok(()) => state.frames_completed += 1,
                Err(e) => {
                    warn!("frame tagged {} not saved: {}", tagged_value, e);
                    sink_failures += 1;
                }
            }
            drop(frame);

            let next = match state.next_value() {
                Some(next) => next,
                None => break TerminationReason::BoundReached,
            };
            if !acquisition.is_active() {
                break TerminationReason::FrameCountReached;
            }
            if let Err(e) = acquisition.device().set_parameter(parameter, next) {
                error!("cannot set {} to {}: {}", parameter, next, e);
                break TerminationReason::FatalError(FatalKind::DeviceFault(e));
            }
            state.advance(next);
            settling = config.settle_frames;
        };

        if let Err(e) = acquisition.stop() {
            error!("failed to stop acquisition: {}", e);
            if !reason.is_fatal() {
                reason = TerminationReason::FatalError(FatalKind::DeviceFault(e));
            }
        }

        info!(
            "sweep finished after {} frames: {:?}",
            state.frames_completed, reason
        );
        Ok(SessionResult {
            frames_completed: state.frames_completed,
            frames_skipped,
            frames_discarded,
            sink_failures,
            exposure_mismatches,
            last_value: state.current_value,
            termination_reason: reason,
        })
    }
}
