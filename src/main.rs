// src/main.rs
// Offline demo: one sweep against the simulated board, printed or saved as a spectrum file.
use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use msa_core::config::{load_json, AppConfig, ScanMode};
use msa_core::drivers::board::SimulatedBoard;
use msa_core::drivers::crystal;
use msa_core::drivers::network::CONNECTOR_Z0;
use msa_core::drivers::pipeline::TracePipeline;
use msa_core::recorder::save_spectrum;
use msa_core::{ScanController, ScanEvent, Session};

const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> Result<()> {
    env_logger::init();

    let config = match env::var("MSA_CONFIG") {
        Ok(path) => load_json::<AppConfig>(&path)?,
        Err(_) => AppConfig::default(),
    };
    config.hardware.validate().context("invalid hardware configuration")?;

    let mut scan = config.scan.clone();
    scan.halt_at_end = true;
    let plan = scan.plan.clone();
    let mode = scan.mode;

    let board = SimulatedBoard::new(7, plan.points() as u64);
    let session = Session::connect(config.hardware.clone(), Box::new(board))?;
    let mut controller = ScanController::new(session);
    let scan_id = controller.configure_and_start(scan).context("failed to start scan")?;
    let mut pipeline = TracePipeline::new(controller, plan)?;

    let poll = Duration::from_millis(config.scan.update_interval_ms.max(1));
    let started = Instant::now();
    loop {
        pipeline.pump_all()?;
        for event in pipeline.source_mut().drain_events() {
            match event {
                ScanEvent::Log(msg) => info!("{}", msg),
                ScanEvent::Error(msg) => warn!("{}", msg),
                ScanEvent::DataReady { .. } | ScanEvent::Halted { .. } => {}
            }
        }
        if pipeline.source_mut().is_stopped_and_drained() {
            break;
        }
        if started.elapsed() > SCAN_TIMEOUT {
            bail!("scan {} did not finish within {:?}", scan_id, SCAN_TIMEOUT);
        }
        thread::sleep(poll);
    }
    pipeline.pump_all()?;

    let trace = pipeline.latest_trace();
    info!("scan {}: {} of {} points", scan_id, trace.filled(), trace.samples.len());

    match mode {
        ScanMode::Reflection => match pipeline.latest_tdr(CONNECTOR_Z0) {
            Ok(tdr) => info!("TDR computed over {} time bins", tdr.time_ns.len()),
            Err(e) => warn!("TDR skipped: {}", e),
        },
        ScanMode::Transmission => {
            let points: Vec<(f64, f64)> = trace.points().iter().map(|p| (p.freq_mhz, p.db)).collect();
            match crystal::locate_resonances(&points).and_then(|m| crystal::extract(&m, CONNECTOR_Z0)) {
                Ok(xtal) => info!(
                    "resonator: Fs {:.6} MHz, Fp {:.6} MHz, Rm {:.2} ohm, Q {:.0}",
                    xtal.fs_mhz, xtal.fp_mhz, xtal.rm_ohms, xtal.unloaded_q
                ),
                Err(e) => info!("no resonator parameters: {}", e),
            }
        }
        ScanMode::SpectrumAnalyzer => {}
    }

    let saved = trace.to_saved("msa-core simulated sweep", CONNECTOR_Z0);
    match env::args().nth(1) {
        Some(path) => {
            save_spectrum(&path, &saved).with_context(|| format!("failed to save {}", path))?;
            info!("saved {}", path);
        }
        None => print!("{}", saved.to_text()),
    }
    Ok(())
}
