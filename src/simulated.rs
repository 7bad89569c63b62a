/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

//! In-process camera for running sweeps without hardware.
//!
//! The simulated camera behaves like a device with a bounded acquisition:
//! every grab result (good or failed) uses up one frame of the budget given to
//! [DeviceHandle::start], and acquisition ends by itself once the budget is
//! spent. Faults can be scripted per retrieval attempt, and exposure changes
//! can be delayed by a number of frames to mimic sensors that only pick up a
//! new value on a later exposure cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use log::{debug, info};

use crate::camera::{CameraModule, DeviceError, DeviceHandle, Parameter, RetrieveError};
use crate::image::{Frame, PixelFormat};

const DEFAULT_EXPOSURE_US: f64 = 10_000.0;
const MAX_EXPOSURE_US: f64 = 10_000_000.0;

/// Outcome forced onto a retrieval attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// A grab result arrives but carries an error instead of an image.
    Failure { code: i32, description: String },
    /// Nothing arrives within the timeout.
    Timeout,
}

pub struct SimulatedCamera {
    width: u32,
    height: u32,
    parameters: HashMap<Parameter, f64>,
    auto: HashSet<Parameter>,
    locked_auto: HashSet<Parameter>,
    faults: HashMap<u32, Fault>,
    latency: u32,
    line_time_us: Option<f64>,
    pending_exposure: VecDeque<(f64, u32)>,
    effective_exposure: f64,
    buffer: Vec<u8>,
    buffer_count: u32,
    remaining: u32,
    active: bool,
    attempts: u32,
    frame_number: u32,
    set_calls: Vec<(Parameter, f64)>,
    start_calls: u32,
    stop_calls: u32,
}

impl SimulatedCamera {
    /// Create a mono camera with every automatic mode switched on.
    pub fn new(width: u32, height: u32) -> Self {
        let parameters = HashMap::from([
            (Parameter::ExposureTime, DEFAULT_EXPOSURE_US),
            (Parameter::Gain, 0.0),
            (Parameter::BalanceWhite, 1.0),
        ]);
        SimulatedCamera {
            width,
            height,
            parameters,
            auto: Parameter::AUTO_CONTROLLED.into_iter().collect(),
            locked_auto: HashSet::new(),
            faults: HashMap::new(),
            latency: 0,
            line_time_us: None,
            pending_exposure: VecDeque::new(),
            effective_exposure: DEFAULT_EXPOSURE_US,
            buffer: vec![0; width as usize * height as usize],
            buffer_count: 1,
            remaining: 0,
            active: false,
            attempts: 0,
            frame_number: 0,
            set_calls: Vec::new(),
            start_calls: 0,
            stop_calls: 0,
        }
    }

    /// Force `fault` on the retrieval attempt with the given zero based index.
    pub fn with_fault(mut self, attempt: u32, fault: Fault) -> Self {
        self.faults.insert(attempt, fault);
        self
    }

    /// Exposure changes become visible only `frames` frames after they are set.
    pub fn with_latency(mut self, frames: u32) -> Self {
        self.latency = frames;
        self
    }

    /// Frames report their exposure rounded to whole sensor lines of `us`.
    pub fn with_line_time(mut self, us: f64) -> Self {
        self.line_time_us = Some(us);
        self
    }

    fn reported_exposure(&self) -> f64 {
        match self.line_time_us {
            Some(line) if line > 0.0 => (self.effective_exposure / line).round() * line,
            _ => self.effective_exposure,
        }
    }

    /// Automatic control of `parameter` cannot be switched off.
    pub fn with_locked_auto(mut self, parameter: Parameter) -> Self {
        self.locked_auto.insert(parameter);
        self
    }

    pub fn set_calls(&self) -> &[(Parameter, f64)] {
        &self.set_calls
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls
    }

    pub fn auto_enabled(&self, parameter: Parameter) -> bool {
        self.auto.contains(&parameter)
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Number of retrieval attempts so far, including timeouts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn advance_exposure(&mut self) {
        while let Some(&(value, 0)) = self.pending_exposure.front() {
            self.effective_exposure = value;
            self.pending_exposure.pop_front();
        }
        for (_, frames_left) in self.pending_exposure.iter_mut() {
            *frames_left -= 1;
        }
    }

    fn render(&mut self) {
        let level = (self.effective_exposure / MAX_EXPOSURE_US * 10.0).min(1.0);
        let span = (self.width + self.height).max(2) as f64 - 2.0;
        let width = self.width as usize;
        for (i, px) in self.buffer.iter_mut().enumerate() {
            let (x, y) = (i % width, i / width);
            let ramp = if span > 0.0 { (x + y) as f64 / span } else { 0.0 };
            *px = (ramp * level * 255.0).round() as u8;
        }
    }
}

impl DeviceHandle for SimulatedCamera {
    fn model_name(&self) -> String {
        format!("Simulated {}x{}", self.width, self.height)
    }

    fn disable_auto(&mut self, parameter: Parameter) -> bool {
        if self.locked_auto.contains(&parameter) {
            return false;
        }
        self.auto.remove(&parameter);
        true
    }

    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<(), DeviceError> {
        self.set_calls.push((parameter, value));
        if parameter == Parameter::ExposureTime {
            if !(0.0..=MAX_EXPOSURE_US).contains(&value) {
                return Err(DeviceError::ValueRejected { parameter, value });
            }
            if self.latency == 0 {
                self.effective_exposure = value;
            } else {
                self.pending_exposure.push_back((value, self.latency));
            }
        }
        self.parameters.insert(parameter, value);
        Ok(())
    }

    fn get_parameter(&self, parameter: Parameter) -> Result<f64, DeviceError> {
        self.parameters
            .get(&parameter)
            .copied()
            .ok_or(DeviceError::Unsupported(parameter))
    }

    fn set_buffer_count(&mut self, count: u32) -> Result<(), DeviceError> {
        self.buffer_count = count;
        Ok(())
    }

    fn start(&mut self, frame_count: u32) -> Result<(), DeviceError> {
        self.start_calls += 1;
        self.remaining = frame_count;
        self.active = frame_count > 0;
        debug!("simulated acquisition of {} frames started", frame_count);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop_calls += 1;
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Frame<'_>, RetrieveError> {
        if !self.active {
            return Err(DeviceError::NotAcquiring.into());
        }
        let attempt = self.attempts;
        self.attempts += 1;
        if let Some(Fault::Timeout) = self.faults.get(&attempt) {
            return Err(RetrieveError::Timeout(timeout));
        }

        // Any grab result, failed or not, uses up the frame budget.
        self.remaining -= 1;
        if self.remaining == 0 {
            self.active = false;
        }
        self.advance_exposure();
        self.frame_number += 1;

        if let Some(Fault::Failure { code, description }) = self.faults.get(&attempt) {
            return Err(RetrieveError::DeviceReportedFailure {
                code: *code,
                description: description.clone(),
            });
        }

        self.render();
        let frame = Frame::from_raw(self.width, self.height, 0, PixelFormat::Mono8, &self.buffer)
            .map_err(|e| DeviceError::Backend {
                code: -1,
                description: e.to_string(),
            })?;
        Ok(frame
            .with_frame_number(self.frame_number)
            .with_exposure_us(self.reported_exposure()))
    }
}

/// Runtime scope for [SimulatedCamera]s.
pub struct SimulatedModule {
    width: u32,
    height: u32,
}

impl SimulatedModule {
    pub fn new() -> Self {
        Self::with_resolution(640, 480)
    }

    pub fn with_resolution(width: u32, height: u32) -> Self {
        info!("simulated camera runtime initialized");
        SimulatedModule { width, height }
    }
}

impl Default for SimulatedModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraModule for SimulatedModule {
    type Camera = SimulatedCamera;

    fn name(&self) -> &str {
        "simulated"
    }

    fn open_first(&mut self) -> Result<SimulatedCamera, DeviceError> {
        if self.width == 0 || self.height == 0 {
            return Err(DeviceError::NotFound);
        }
        Ok(SimulatedCamera::new(self.width, self.height))
    }
}

impl Drop for SimulatedModule {
    fn drop(&mut self) {
        info!("simulated camera runtime released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn acquisition_ends_after_budget() {
        let mut cam = SimulatedCamera::new(4, 3);
        cam.start(2).unwrap();
        assert!(cam.is_active());
        cam.retrieve(TIMEOUT).unwrap();
        let frame = cam.retrieve(TIMEOUT).unwrap();
        assert_eq!(frame.frame_number(), 2);
        assert!(!cam.is_active());
        assert_eq!(
            cam.retrieve(TIMEOUT).unwrap_err(),
            RetrieveError::Device(DeviceError::NotAcquiring)
        );
    }

    #[test]
    fn timeout_keeps_budget() {
        let mut cam = SimulatedCamera::new(4, 3).with_fault(0, Fault::Timeout);
        cam.start(1).unwrap();
        assert_eq!(
            cam.retrieve(TIMEOUT).unwrap_err(),
            RetrieveError::Timeout(TIMEOUT)
        );
        assert!(cam.is_active());
        cam.retrieve(TIMEOUT).unwrap();
        assert!(!cam.is_active());
    }

    #[test]
    fn failure_uses_budget() {
        let failure = Fault::Failure {
            code: 3852,
            description: "incomplete buffer".to_string(),
        };
        let mut cam = SimulatedCamera::new(4, 3).with_fault(0, failure);
        cam.start(1).unwrap();
        let err = cam.retrieve(TIMEOUT).unwrap_err();
        assert!(matches!(err, RetrieveError::DeviceReportedFailure { code: 3852, .. }));
        assert!(!cam.is_active());
    }

    #[test]
    fn exposure_latency() {
        let mut cam = SimulatedCamera::new(4, 3).with_latency(1);
        cam.start(3).unwrap();
        cam.set_parameter(Parameter::ExposureTime, 500.0).unwrap();
        let first = cam.retrieve(TIMEOUT).unwrap().exposure_us();
        assert_eq!(first, Some(DEFAULT_EXPOSURE_US));
        let second = cam.retrieve(TIMEOUT).unwrap().exposure_us();
        assert_eq!(second, Some(500.0));
    }

    #[test]
    fn exposure_rounded_to_line_time() {
        let mut cam = SimulatedCamera::new(4, 3).with_line_time(15.0);
        cam.start(1).unwrap();
        cam.set_parameter(Parameter::ExposureTime, 50_000.0).unwrap();
        let reported = cam.retrieve(TIMEOUT).unwrap().exposure_us();
        assert_eq!(reported, Some(49_995.0));
    }

    #[test]
    fn locked_auto_mode() {
        let mut cam = SimulatedCamera::new(4, 3).with_locked_auto(Parameter::BalanceWhite);
        assert!(cam.disable_auto(Parameter::Gain));
        assert!(!cam.disable_auto(Parameter::BalanceWhite));
        assert!(!cam.auto_enabled(Parameter::Gain));
        assert!(cam.auto_enabled(Parameter::BalanceWhite));
    }

    #[test]
    fn rejects_exposure_out_of_range() {
        let mut cam = SimulatedCamera::new(4, 3);
        let err = cam
            .set_parameter(Parameter::ExposureTime, -1.0)
            .unwrap_err();
        assert!(matches!(err, DeviceError::ValueRejected { .. }));
        assert_eq!(
            cam.get_parameter(Parameter::ExposureTime).unwrap(),
            DEFAULT_EXPOSURE_US
        );
    }

    #[test]
    fn brighter_with_longer_exposure() {
        let mut cam = SimulatedCamera::new(8, 8);
        cam.start(2).unwrap();
        cam.set_parameter(Parameter::ExposureTime, 1000.0).unwrap();
        let dim = cam.retrieve(TIMEOUT).unwrap().pixel(7, 7).unwrap()[0];
        cam.set_parameter(Parameter::ExposureTime, 500_000.0).unwrap();
        let bright = cam.retrieve(TIMEOUT).unwrap().pixel(7, 7).unwrap()[0];
        assert!(bright > dim);
    }

    #[test]
    fn module_opens_camera() {
        let mut module = SimulatedModule::with_resolution(16, 8);
        let cam = module.open_first().unwrap();
        assert_eq!(cam.model_name(), "Simulated 16x8");
        let mut empty = SimulatedModule::with_resolution(0, 0);
        assert_eq!(empty.open_first().err(), Some(DeviceError::NotFound));
    }
}
