use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marker_tracker::calibration::load_calibration;
use marker_tracker::camera::{load_intrinsics, resolve_intrinsics, OpenCvCamera};
use marker_tracker::config::Config;
use marker_tracker::logging;
use marker_tracker::marker::aruco::ArucoMarkerDetector;
use marker_tracker::session::{TrackerStatus, TrackingSession};
use marker_tracker::vmt::{PoseSink, VmtClient};

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    let (config, load_error) = match Config::load(CONFIG_PATH) {
        Ok(c) => (c, None),
        Err(e) => (Config::default().validated(), Some(e)),
    };
    logging::init(&config.logging, "tracker")?;
    if let Some(e) = load_error {
        tracing::warn!("{e:#}, using defaults");
    }
    tracing::info!("Marker Tracker ({})", env!("GIT_VERSION"));
    tracing::info!("VMT target: {}", config.vmt.addr);

    let intrinsics_path = Path::new(&config.charuco.output_path);
    let saved = if intrinsics_path.exists() {
        Some(load_intrinsics(intrinsics_path)?)
    } else {
        None
    };

    // カメラ起動（実際の解像度で内部パラメータを作る）
    let mut sources = Vec::new();
    let mut intrinsics = Vec::new();
    for cam in &config.cameras {
        let camera = OpenCvCamera::open(cam.index, Some(cam.width), Some(cam.height), Some(cam.fps))?;
        let (w, h) = camera.resolution();
        intrinsics.push(resolve_intrinsics(cam, saved.as_ref(), w, h));
        sources.push((camera, ArucoMarkerDetector::new(&config.markers.dictionary)?));
    }

    let session = Arc::new(TrackingSession::with_intrinsics(config.clone(), intrinsics)?);
    let cal_path = Path::new(&config.calibration.output_path);
    if cal_path.exists() {
        let cal = load_calibration(cal_path)?;
        session.load_calibration(&cal);
    } else {
        tracing::warn!("{} not found, run calibrate_tracker first", cal_path.display());
    }

    let vmt = VmtClient::new(&config.vmt.addr)?;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&stop)).context("Failed to register signal handler")?;
    }

    let mut handle = session.start(sources)?;
    tracing::info!("操作: [Ctrl+C] 終了");

    let interval = Duration::from_secs_f64(1.0 / config.vmt.send_rate);
    let mut last_status: HashMap<usize, TrackerStatus> = HashMap::new();
    let mut send_errors = 0u64;
    let mut next = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let now = session.now();
        for out in session.fused_outputs(now) {
            if last_status.insert(out.tracker_id, out.status) != Some(out.status) {
                tracing::info!(tracker = out.tracker_id, name = %out.name, "status: {:?}", out.status);
            }
            if out.status == TrackerStatus::Ignored {
                continue;
            }
            if let Err(e) = vmt.send_sample(out.vmt_index, out.pose.as_ref()) {
                send_errors += 1;
                if send_errors == 1 || send_errors % 1000 == 0 {
                    tracing::warn!("VMT send failed ({send_errors}): {e:#}");
                }
            }
        }

        next += interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    handle.stop();
    // 停止後は全トラッカーを無効化
    for out in session.fused_outputs(session.now()) {
        if out.status != TrackerStatus::Ignored {
            vmt.send_sample(out.vmt_index, None)?;
        }
    }
    tracing::info!("stopped");
    Ok(())
}
