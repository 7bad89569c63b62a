/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

pub use camera::*;
pub use cancel::CancelToken;
pub use sink::{BmpSink, FrameSink, SinkError};
pub use sweep::*;

pub mod camera;
pub mod cancel;
pub mod image;
pub mod simulated;
pub mod sink;
pub mod sweep;
#[cfg(feature = "xiapi")]
pub mod ximea;

#[cfg(test)]
mod tests {
    use crate::simulated::SimulatedModule;
    use crate::{CameraModule, DeviceError, DeviceHandle};

    #[test]
    fn start_stop_acquisition() -> Result<(), DeviceError> {
        let mut module = SimulatedModule::new();
        let mut cam = module.open_first()?;
        cam.start(1)?;
        assert!(cam.is_active());
        cam.stop()?;
        assert!(!cam.is_active());
        Ok(())
    }
}
