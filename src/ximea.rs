/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

//! XIMEA cameras through the xiAPI.

use std::mem::size_of;
use std::slice::from_raw_parts;
use std::time::Duration;

use libc::{c_char, c_int};
use log::{debug, info, warn};
use paste::paste;
use xiapi_sys::*;

use crate::camera::{CameraModule, DeviceError, DeviceHandle, Parameter, RetrieveError};
use crate::image::{Frame, PixelFormat};

pub struct XimeaCamera {
    device_handle: HANDLE,
    acquiring: bool,
    remaining: u32,
    xi_img: XI_IMG,
}

fn describe(err: XI_RETURN) -> String {
    match err as u32 {
        XI_RET::XI_INVALID_HANDLE => "invalid handle".to_string(),
        XI_RET::XI_NO_IMAGE => "no image available".to_string(),
        XI_RET::XI_TIMEOUT => "timeout".to_string(),
        XI_RET::XI_NOT_SUPPORTED => "function not supported".to_string(),
        XI_RET::XI_WRONG_PARAM_VALUE => "wrong parameter value".to_string(),
        XI_RET::XI_NO_DEVICES_FOUND => "no devices found".to_string(),
        _ => format!("xiAPI error {}", err),
    }
}

fn backend_error(err: XI_RETURN) -> DeviceError {
    DeviceError::Backend {
        code: err,
        description: describe(err),
    }
}

macro_rules! float_param {
    ($name:ident, $prm:ident) => {
        paste! {
            fn $name(&self) -> Result<f32, XI_RETURN> {
                let mut value = 0f32;
                let err = unsafe {
                    xiGetParamFloat(
                        self.device_handle,
                        [<XI_PRM_ $prm>].as_ptr() as *const c_char,
                        &mut value,
                    )
                };
                match err as u32 {
                    XI_RET::XI_OK => Ok(value),
                    _ => Err(err),
                }
            }

            fn [<set_ $name>](&mut self, value: f32) -> Result<(), XI_RETURN> {
                let err = unsafe {
                    xiSetParamFloat(
                        self.device_handle,
                        [<XI_PRM_ $prm>].as_ptr() as *const c_char,
                        value,
                    )
                };
                match err as u32 {
                    XI_RET::XI_OK => Ok(()),
                    _ => Err(err),
                }
            }
        }
    };
}

macro_rules! int_param {
    ($name:ident, $prm:ident) => {
        paste! {
            #[allow(dead_code)]
            fn $name(&self) -> Result<c_int, XI_RETURN> {
                let mut value: c_int = 0;
                let err = unsafe {
                    xiGetParamInt(
                        self.device_handle,
                        [<XI_PRM_ $prm>].as_ptr() as *const c_char,
                        &mut value,
                    )
                };
                match err as u32 {
                    XI_RET::XI_OK => Ok(value),
                    _ => Err(err),
                }
            }

            fn [<set_ $name>](&mut self, value: c_int) -> Result<(), XI_RETURN> {
                let err = unsafe {
                    xiSetParamInt(
                        self.device_handle,
                        [<XI_PRM_ $prm>].as_ptr() as *const c_char,
                        value,
                    )
                };
                match err as u32 {
                    XI_RET::XI_OK => Ok(()),
                    _ => Err(err),
                }
            }
        }
    };
}

/// Open the camera with the given index, the first camera if `None`.
pub fn open_device(dev_id: Option<u32>) -> Result<XimeaCamera, XI_RETURN> {
    let mut device_handle: HANDLE = std::ptr::null_mut();
    let dev_id = dev_id.unwrap_or(0);
    let err = unsafe { xiOpenDevice(dev_id, &mut device_handle) };
    match err as u32 {
        XI_RET::XI_OK => {
            // SAFETY: XI_IMG is a plain C struct for which all zero bytes are valid.
            let mut xi_img: XI_IMG = unsafe { std::mem::zeroed() };
            xi_img.size = size_of::<XI_IMG>() as _;
            Ok(XimeaCamera {
                device_handle,
                acquiring: false,
                remaining: 0,
                xi_img,
            })
        }
        _ => Err(err),
    }
}

/// Number of XIMEA cameras connected to the host.
pub fn number_devices() -> Result<u32, XI_RETURN> {
    let mut count = 0;
    let err = unsafe { xiGetNumberDevices(&mut count) };
    match err as u32 {
        XI_RET::XI_OK => Ok(count as u32),
        _ => Err(err),
    }
}

impl XimeaCamera {
    float_param!(exposure, EXPOSURE);
    float_param!(gain, GAIN);
    int_param!(aeag, AEAG);
    int_param!(auto_wb, AUTO_WB);
    int_param!(buffers_queue_size, BUFFERS_QUEUE_SIZE);

    fn device_name(&self) -> Result<String, XI_RETURN> {
        let mut buffer = [0u8; 256];
        let err = unsafe {
            xiGetParamString(
                self.device_handle,
                XI_PRM_DEVICE_NAME.as_ptr() as *const c_char,
                buffer.as_mut_ptr() as *mut _,
                buffer.len() as _,
            )
        };
        match err as u32 {
            XI_RET::XI_OK => {
                let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
                Ok(String::from_utf8_lossy(&buffer[..end]).into_owned())
            }
            _ => Err(err),
        }
    }

    fn pixel_format(&self) -> Option<PixelFormat> {
        match self.xi_img.frm {
            XI_IMG_FORMAT::XI_MONO8 | XI_IMG_FORMAT::XI_RAW8 => Some(PixelFormat::Mono8),
            XI_IMG_FORMAT::XI_MONO16 | XI_IMG_FORMAT::XI_RAW16 => Some(PixelFormat::Mono16),
            // xiAPI delivers color as blue, green, red
            XI_IMG_FORMAT::XI_RGB24 => Some(PixelFormat::Bgr8),
            XI_IMG_FORMAT::XI_RGB32 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }

    fn stop_acquisition(&mut self) -> Result<(), XI_RETURN> {
        if !self.acquiring {
            return Ok(());
        }
        self.acquiring = false;
        let err = unsafe { xiStopAcquisition(self.device_handle) };
        match err as u32 {
            XI_RET::XI_OK => Ok(()),
            _ => Err(err),
        }
    }
}

impl Drop for XimeaCamera {
    fn drop(&mut self) {
        if let Err(err) = self.stop_acquisition() {
            warn!("stopping acquisition on close failed: {}", describe(err));
        }
        unsafe {
            xiCloseDevice(self.device_handle);
        }
    }
}

impl DeviceHandle for XimeaCamera {
    fn model_name(&self) -> String {
        self.device_name()
            .unwrap_or_else(|err| format!("XIMEA camera ({})", describe(err)))
    }

    fn disable_auto(&mut self, parameter: Parameter) -> bool {
        let off = XI_SWITCH::XI_OFF as c_int;
        // exposure and gain share one automatic controller
        let result = match parameter {
            Parameter::ExposureTime | Parameter::Gain => self.set_aeag(off),
            Parameter::BalanceWhite => self.set_auto_wb(off),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!("cannot disable auto {}: {}", parameter, describe(err));
                false
            }
        }
    }

    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<(), DeviceError> {
        let result = match parameter {
            Parameter::ExposureTime => self.set_exposure(value as f32),
            Parameter::Gain => self.set_gain(value as f32),
            Parameter::BalanceWhite => return Err(DeviceError::Unsupported(parameter)),
        };
        result.map_err(|err| match err as u32 {
            XI_RET::XI_WRONG_PARAM_VALUE => DeviceError::ValueRejected { parameter, value },
            _ => backend_error(err),
        })
    }

    fn get_parameter(&self, parameter: Parameter) -> Result<f64, DeviceError> {
        let value = match parameter {
            Parameter::ExposureTime => self.exposure(),
            Parameter::Gain => self.gain(),
            Parameter::BalanceWhite => return Err(DeviceError::Unsupported(parameter)),
        };
        value.map(f64::from).map_err(backend_error)
    }

    fn set_buffer_count(&mut self, count: u32) -> Result<(), DeviceError> {
        self.set_buffers_queue_size(count as c_int)
            .map_err(backend_error)
    }

    fn start(&mut self, frame_count: u32) -> Result<(), DeviceError> {
        let err = unsafe { xiStartAcquisition(self.device_handle) };
        match err as u32 {
            XI_RET::XI_OK => {
                self.acquiring = true;
                self.remaining = frame_count;
                info!("acquisition started for {} frames", frame_count);
                Ok(())
            }
            _ => Err(backend_error(err)),
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop_acquisition().map_err(backend_error)
    }

    fn is_active(&self) -> bool {
        self.acquiring && self.remaining > 0
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Frame<'_>, RetrieveError> {
        if !self.is_active() {
            return Err(DeviceError::NotAcquiring.into());
        }
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let err = unsafe { xiGetImage(self.device_handle, timeout_ms as _, &mut self.xi_img) };
        if err as u32 == XI_RET::XI_TIMEOUT {
            return Err(RetrieveError::Timeout(timeout));
        }

        // xiAPI has no bounded acquisition. The session counts as finished once
        // the budget is used; the stream itself stops in stop().
        self.remaining -= 1;
        if err as u32 != XI_RET::XI_OK {
            return Err(RetrieveError::DeviceReportedFailure {
                code: err,
                description: describe(err),
            });
        }

        let format = self
            .pixel_format()
            .ok_or_else(|| RetrieveError::DeviceReportedFailure {
                code: -1,
                description: format!("unsupported image format {}", self.xi_img.frm),
            })?;
        let img = &self.xi_img;
        let length = if img.bp_size != 0 {
            img.bp_size as usize
        } else {
            (img.width as usize * format.bytes_per_pixel() + img.padding_x as usize)
                * img.height as usize
        };
        if img.bp.is_null() {
            return Err(RetrieveError::DeviceReportedFailure {
                code: -1,
                description: "image buffer missing".to_string(),
            });
        }
        // SAFETY: xiAPI keeps the buffer valid until the next xiGetImage call,
        // which cannot happen while the returned frame borrows self.
        let data = unsafe { from_raw_parts(img.bp as *const u8, length) };
        let frame = Frame::from_raw(img.width, img.height, img.padding_x, format, data).map_err(
            |e| RetrieveError::DeviceReportedFailure {
                code: -1,
                description: e.to_string(),
            },
        )?;
        Ok(frame
            .with_frame_number(img.nframe)
            .with_exposure_us(f64::from(img.exposure_time_us)))
    }
}

/// Scope of the xiAPI runtime.
pub struct XimeaModule {
    device_count: u32,
}

impl XimeaModule {
    pub fn new() -> Result<Self, DeviceError> {
        let device_count = number_devices().map_err(backend_error)?;
        info!("xiAPI found {} camera(s)", device_count);
        Ok(XimeaModule { device_count })
    }
}

impl CameraModule for XimeaModule {
    type Camera = XimeaCamera;

    fn name(&self) -> &str {
        "xiapi"
    }

    fn open_first(&mut self) -> Result<XimeaCamera, DeviceError> {
        if self.device_count == 0 {
            return Err(DeviceError::NotFound);
        }
        open_device(None).map_err(backend_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::file_serial]
    fn start_stop_acquisition() -> Result<(), DeviceError> {
        let mut cam = XimeaModule::new()?.open_first()?;
        cam.start(1)?;
        assert!(cam.is_active());
        cam.stop()?;
        cam.stop()?;
        assert!(!cam.is_active());
        Ok(())
    }

    #[test]
    #[serial_test::file_serial]
    fn exposure_round_trip() -> Result<(), DeviceError> {
        let mut cam = XimeaModule::new()?.open_first()?;
        assert!(cam.disable_auto(Parameter::ExposureTime));
        cam.set_parameter(Parameter::ExposureTime, 10000.0)?;
        approx::assert_abs_diff_eq!(
            cam.get_parameter(Parameter::ExposureTime)?,
            10000.0,
            epsilon = 100.0
        );
        Ok(())
    }

    #[test]
    #[serial_test::file_serial]
    fn retrieves_frame() -> Result<(), DeviceError> {
        let mut cam = XimeaModule::new()?.open_first()?;
        cam.start(1)?;
        let frame = cam
            .retrieve(Duration::from_secs(5))
            .map_err(|e| DeviceError::Backend {
                code: -1,
                description: e.to_string(),
            })?;
        assert!(frame.width() > 0 && frame.height() > 0);
        drop(frame);
        assert!(!cam.is_active());
        Ok(())
    }
}
