use anyhow::Result;
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marker_tracker::camera::CameraIntrinsics;
use marker_tracker::config::{CameraConfig, Config, TrackerConfig};
use marker_tracker::logging;
use marker_tracker::session::TrackingSession;
use marker_tracker::sim::{Scene, SyntheticCamera, SyntheticDetector, SyntheticSource};
use marker_tracker::tracker::RigidBodyModel;
use marker_tracker::vmt::{PoseSink, VmtClient};

const FPS: u32 = 60;
const NOISE_PX: f64 = 0.3;
const CALIBRATION_SECS: u64 = 5;
const TRACKING_SECS: u64 = 5;

/// 3マーカーの腰トラッカーと2マーカーの足トラッカー
fn truth_models(markers_per_tracker: u32) -> Vec<RigidBodyModel> {
    let mut hip = RigidBodyModel::new(0);
    hip.set_root(0);
    hip.insert_calibrated(1, &Isometry3::new(Vector3::new(0.07, 0.0, -0.015), Vector3::new(0.0, 0.5, 0.0)));
    hip.insert_calibrated(2, &Isometry3::new(Vector3::new(-0.07, 0.0, -0.015), Vector3::new(0.0, -0.5, 0.0)));

    let root = markers_per_tracker;
    let mut foot = RigidBodyModel::new(1);
    foot.set_root(root);
    foot.insert_calibrated(root + 1, &Isometry3::new(Vector3::new(0.0, 0.06, -0.01), Vector3::new(-0.45, 0.0, 0.0)));
    vec![hip, foot]
}

fn motion(t: f64) -> Vec<Isometry3<f64>> {
    let facing = |x: f64, y: f64, yaw: f64| {
        Isometry3::from_parts(
            Translation3::new(x, y, 0.42 + 0.02 * (t * 0.7).sin()),
            UnitQuaternion::from_euler_angles(std::f64::consts::PI + 0.1 * (t * 0.9).sin(), yaw, 0.0),
        )
    };
    vec![
        facing(-0.09 + 0.02 * (t * 1.1).sin(), -0.02, 0.15 * (t * 0.5).sin()),
        facing(0.1, 0.04 + 0.015 * (t * 1.7).cos(), -0.1),
    ]
}

fn main() -> Result<()> {
    let mut config = Config::default();
    config.trackers = ["hip", "left_foot"]
        .iter()
        .map(|name| TrackerConfig {
            name: name.to_string(),
            ..Default::default()
        })
        .collect();
    config.cameras = vec![CameraConfig::default(), CameraConfig { index: 1, ..Default::default() }];
    config.logging.file = false;
    let config = config.validated();
    logging::init(&config.logging, "synthetic")?;

    let send_vmt = std::env::args().any(|a| a == "--vmt");
    let vmt = if send_vmt { Some(VmtClient::new(&config.vmt.addr)?) } else { None };

    let intrinsics = CameraIntrinsics::from_fov(60.0, 640, 480);
    // 2台目は右から内向き
    let cameras = [
        SyntheticCamera::new(0, intrinsics, Isometry3::identity()),
        SyntheticCamera::new(
            1,
            intrinsics,
            Isometry3::from_parts(
                Translation3::new(0.25, 0.0, 0.05),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -32f64.to_radians()),
            ),
        ),
    ];

    let scene = Arc::new(Scene {
        truth: truth_models(config.markers.markers_per_tracker),
        marker_size: config.markers.size,
        motion: Box::new(motion),
    });

    let session = Arc::new(TrackingSession::with_intrinsics(
        config.clone(),
        cameras.iter().map(|c| c.intrinsics).collect(),
    )?);
    let start = Instant::now();
    let sources: Vec<_> = cameras
        .iter()
        .map(|c| {
            let source = SyntheticSource::new(*c, Arc::clone(&scene), start, FPS, NOISE_PX, 7 + c.id as u64);
            (source, SyntheticDetector)
        })
        .collect();
    let mut handle = session.start(sources)?;

    println!("=== Synthetic demo ({}) ===", env!("GIT_VERSION"));
    println!("[1/3] 校正 {CALIBRATION_SECS}秒");
    for tracker in 0..session.tracker_count() {
        session.begin_calibration(tracker)?;
    }
    std::thread::sleep(Duration::from_secs(CALIBRATION_SECS));
    for (tracker, truth) in scene.truth.iter().enumerate() {
        match session.end_calibration(tracker) {
            Ok(model) => {
                for id in truth.calibrated_ids() {
                    match (model.marker_pose(id), truth.marker_pose(id)) {
                        (Some(est), Some(gt)) => println!(
                            "  トラッカー {tracker} マーカー {id}: 位置誤差 {:.2}mm 回転誤差 {:.2}°",
                            (est.translation.vector - gt.translation.vector).norm() * 1000.0,
                            est.rotation.angle_to(&gt.rotation).to_degrees()
                        ),
                        _ => println!("  トラッカー {tracker} マーカー {id}: 未校正"),
                    }
                }
            }
            Err(e) => println!("  トラッカー {tracker}: {e}"),
        }
    }

    println!("[2/3] カメラ間アライメント");
    match session.refine_alignment(1) {
        Ok(a) => {
            let truth = cameras[0].pose.inverse() * cameras[1].pose;
            println!(
                "  位置誤差 {:.2}mm 回転誤差 {:.3}°",
                (a.translation - truth.translation.vector).norm() * 1000.0,
                a.rotation.angle_to(&truth.rotation).to_degrees()
            );
        }
        Err(e) => println!("  {e}"),
    }

    println!("[3/3] トラッキング {TRACKING_SECS}秒");
    let interval = Duration::from_secs_f64(1.0 / config.vmt.send_rate);
    let end = Instant::now() + Duration::from_secs(TRACKING_SECS);
    let mut tick = 0u64;
    while Instant::now() < end {
        for out in session.fused_outputs(session.now()) {
            if let Some(vmt) = &vmt {
                vmt.send_sample(out.vmt_index, out.pose.as_ref())?;
            }
            if tick % 30 == 0 {
                match out.pose {
                    Some(p) => println!(
                        "  {:<10} {:?} [{:+.3}, {:+.3}, {:+.3}]",
                        out.name, out.status, p.position.x, p.position.y, p.position.z
                    ),
                    None => println!("  {:<10} {:?}", out.name, out.status),
                }
            }
        }
        tick += 1;
        std::thread::sleep(interval);
    }

    handle.stop();
    Ok(())
}
