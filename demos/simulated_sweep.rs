/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */
use exposweep::simulated::SimulatedModule;
use exposweep::{BmpSink, CameraModule, SessionConfig, SweepController};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut module = SimulatedModule::with_resolution(320, 240);
    let mut cam = module.open_first()?;
    let mut sink = BmpSink::new("sweep_demo")?;

    let config = SessionConfig {
        initial_value: 1000.0,
        step: 1000.0,
        upper_bound: 10_000.0,
        ..SessionConfig::default()
    };
    let result = SweepController::new(config)?.run(&mut cam, &mut sink)?;
    println!(
        "Saved {} frames to {}, stopped with {:?}",
        result.frames_completed,
        sink.dir().display(),
        result.termination_reason
    );
    Ok(())
}
