/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

use std::fmt;
use std::time::Duration;

use crate::image::Frame;

/// A device parameter that can be swept or taken out of automatic control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Exposure time in microseconds
    ExposureTime,
    /// Analog gain in dB
    Gain,
    /// White balance ratio
    BalanceWhite,
}

impl Parameter {
    /// Parameters whose automatic control is switched off before a sweep.
    pub const AUTO_CONTROLLED: [Parameter; 3] = [
        Parameter::Gain,
        Parameter::BalanceWhite,
        Parameter::ExposureTime,
    ];

    /// GenICam style feature name.
    pub fn name(&self) -> &'static str {
        match self {
            Parameter::ExposureTime => "ExposureTime",
            Parameter::Gain => "Gain",
            Parameter::BalanceWhite => "BalanceWhite",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("no camera detected")]
    NotFound,
    #[error("parameter {0} is not supported by this device")]
    Unsupported(Parameter),
    #[error("value {value} rejected for {parameter}")]
    ValueRejected { parameter: Parameter, value: f64 },
    #[error("acquisition is not running")]
    NotAcquiring,
    #[error("device error {code}: {description}")]
    Backend { code: i32, description: String },
}

/// Why a single [DeviceHandle::retrieve] call produced no frame.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RetrieveError {
    /// No frame arrived within the requested timeout.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// The device delivered a grab result that carries no usable image.
    #[error("grab failed with code {code}: {description}")]
    DeviceReportedFailure { code: i32, description: String },
    /// The device itself failed while retrieving.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// An opened camera as seen by the sweep controller.
///
/// Implementations own their buffer pool; a frame returned by
/// [retrieve](DeviceHandle::retrieve) borrows the device and must be dropped
/// before the next call.
pub trait DeviceHandle {
    fn model_name(&self) -> String;

    /// Switch off automatic control of `parameter`.
    ///
    /// returns: `true` if the device is now in manual mode for this parameter.
    fn disable_auto(&mut self, parameter: Parameter) -> bool;

    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<(), DeviceError>;

    fn get_parameter(&self, parameter: Parameter) -> Result<f64, DeviceError>;

    /// Number of buffers the device may fill ahead of the caller.
    fn set_buffer_count(&mut self, count: u32) -> Result<(), DeviceError> {
        log::debug!("{} ignores buffer count {}", self.model_name(), count);
        Ok(())
    }

    /// Start acquiring; the session ends by itself after `frame_count` grab results.
    fn start(&mut self, frame_count: u32) -> Result<(), DeviceError>;

    /// Stop acquiring. Stopping an already stopped device is not an error.
    fn stop(&mut self) -> Result<(), DeviceError>;

    fn is_active(&self) -> bool;

    fn retrieve(&mut self, timeout: Duration) -> Result<Frame<'_>, RetrieveError>;
}

/// Process-wide scope of a camera SDK.
///
/// Creating the module initializes the vendor runtime and dropping it releases
/// the runtime again, so cameras opened from it must be dropped first.
pub trait CameraModule {
    type Camera: DeviceHandle;

    fn name(&self) -> &str;

    fn open_first(&mut self) -> Result<Self::Camera, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_names_follow_genicam() {
        assert_eq!(Parameter::ExposureTime.to_string(), "ExposureTime");
        assert_eq!(Parameter::Gain.name(), "Gain");
        assert_eq!(Parameter::BalanceWhite.name(), "BalanceWhite");
    }

    #[test]
    fn retrieve_error_wraps_device_error() {
        let err: RetrieveError = DeviceError::NotAcquiring.into();
        assert_eq!(err, RetrieveError::Device(DeviceError::NotAcquiring));
        assert_eq!(err.to_string(), "acquisition is not running");
    }
}
