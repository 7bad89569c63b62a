/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{error, info};

use exposweep::simulated::SimulatedModule;
use exposweep::{
    BmpSink, CameraModule, CancelToken, Parameter, SessionConfig, SweepController,
    TerminationReason,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SweptParameter {
    ExposureTime,
    Gain,
}

impl From<SweptParameter> for Parameter {
    fn from(value: SweptParameter) -> Self {
        match value {
            SweptParameter::ExposureTime => Parameter::ExposureTime,
            SweptParameter::Gain => Parameter::Gain,
        }
    }
}

/// Capture one frame per value while sweeping a camera parameter, saving each
/// frame as `<value>.bmp`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of frames to grab
    #[arg(long, default_value_t = 100)]
    frames: u32,

    /// First value of the sweep
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    start: f64,

    /// Increment between frames
    #[arg(long, default_value_t = 50_000.0, allow_negative_numbers = true)]
    step: f64,

    /// Last value of the sweep, inclusive
    #[arg(long, default_value_t = 1_000_000.0, allow_negative_numbers = true)]
    stop: f64,

    /// Time to wait for each frame before giving up
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Number of buffers the camera may fill ahead
    #[arg(long, default_value_t = 5)]
    buffers: u32,

    /// Frames to drop after every parameter change
    #[arg(long, default_value_t = 0)]
    settle_frames: u32,

    #[arg(long, value_enum, default_value_t = SweptParameter::ExposureTime)]
    parameter: SweptParameter,

    /// Directory the bitmaps are written to
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// Use the simulated camera even if hardware support is compiled in
    #[arg(long)]
    simulated: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            parameter: self.parameter.into(),
            frame_count: self.frames,
            initial_value: self.start,
            step: self.step,
            upper_bound: self.stop,
            retrieval_timeout: Duration::from_millis(self.timeout_ms),
            settle_frames: self.settle_frames,
            buffer_count: Some(self.buffers),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(TerminationReason::FatalError(kind)) => {
            error!("An exception occurred.\n{}", kind);
            ExitCode::from(1)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("An exception occurred.\n{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<TerminationReason> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        info!("got Ctrl-C, finishing sweep");
        handler.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let controller = SweepController::new(args.session_config())?.with_cancel_token(cancel);
    let mut sink = BmpSink::new(&args.output_dir)?;
    sweep(args, &controller, &mut sink)
}

#[cfg(feature = "xiapi")]
fn sweep(
    args: &Args,
    controller: &SweepController,
    sink: &mut BmpSink,
) -> anyhow::Result<TerminationReason> {
    if args.simulated {
        return sweep_with(SimulatedModule::new(), controller, sink);
    }
    let module = exposweep::ximea::XimeaModule::new().context("initializing xiAPI")?;
    sweep_with(module, controller, sink)
}

#[cfg(not(feature = "xiapi"))]
fn sweep(
    args: &Args,
    controller: &SweepController,
    sink: &mut BmpSink,
) -> anyhow::Result<TerminationReason> {
    if !args.simulated {
        log::warn!("built without camera support, using the simulated camera");
    }
    sweep_with(SimulatedModule::new(), controller, sink)
}

fn sweep_with<M: CameraModule>(
    mut module: M,
    controller: &SweepController,
    sink: &mut BmpSink,
) -> anyhow::Result<TerminationReason> {
    let mut camera = module
        .open_first()
        .with_context(|| format!("opening camera through {}", module.name()))?;
    let result = controller.run(&mut camera, sink)?;
    info!(
        "{} frames saved to {} ({} failed grabs, {} not written, {} discarded, {} exposure mismatches)",
        result.frames_completed,
        sink.dir().display(),
        result.frames_skipped,
        result.sink_failures,
        result.frames_discarded,
        result.exposure_mismatches
    );
    Ok(result.termination_reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_session() {
        let args = Args::parse_from(["exposweep"]);
        let config = args.session_config();
        assert_eq!(
            config,
            SessionConfig {
                buffer_count: Some(5),
                ..SessionConfig::default()
            }
        );
        assert_eq!(args.output_dir, PathBuf::from("results"));
        assert!(!args.simulated);
    }

    #[test]
    fn parses_descending_gain_sweep() {
        let args = Args::parse_from([
            "exposweep",
            "--parameter",
            "gain",
            "--start",
            "12",
            "--step",
            "-3",
            "--stop",
            "0",
            "--settle-frames",
            "1",
        ]);
        let config = args.session_config();
        assert_eq!(config.parameter, Parameter::Gain);
        assert_eq!(config.step, -3.0);
        assert_eq!(config.settle_frames, 1);
        assert!(config.validate().is_ok());
    }
}
