use anyhow::{Context, Result};
use crossbeam_channel::{select, unbounded, Receiver};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use marker_tracker::calibration::{load_calibration, save_calibration, CalibrationFile};
use marker_tracker::camera::{load_intrinsics, resolve_intrinsics, OpenCvCamera};
use marker_tracker::config::Config;
use marker_tracker::logging;
use marker_tracker::marker::aruco::ArucoMarkerDetector;
use marker_tracker::session::{SessionEvent, TrackingSession};
use marker_tracker::tracker::MarkerStatus;

const CONFIG_PATH: &str = "config.toml";

fn parse_tracker_arg() -> Result<usize> {
    // Usage: calibrate_tracker [tracker_index]
    match std::env::args().nth(1) {
        Some(s) => s.parse().with_context(|| format!("Invalid tracker index: {s}")),
        None => Ok(0),
    }
}

fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn describe(status: &MarkerStatus) -> String {
    match status {
        MarkerStatus::Anchor => "校正済み".to_string(),
        MarkerStatus::Calibrating { samples, elapsed } => format!("蓄積中 {samples}サンプル {elapsed:.1}s"),
        MarkerStatus::Calibrated => "完了".to_string(),
        MarkerStatus::TooFar { distance } => format!("遠すぎる {distance:.2}m"),
        MarkerStatus::NoAnchorVisible => "校正済みマーカーが見えない".to_string(),
        MarkerStatus::Waiting => "待機".to_string(),
        MarkerStatus::Rejected => "不採用".to_string(),
    }
}

fn main() -> Result<()> {
    let config = Config::load(CONFIG_PATH)?;
    logging::init(&config.logging, "calibrate")?;
    let tracker = parse_tracker_arg()?;
    let cal_path = Path::new(&config.calibration.output_path).to_path_buf();

    println!("=== トラッカー校正 ({}) ===", env!("GIT_VERSION"));
    println!();
    println!("設定:");
    println!("  マーカー辺長: {}m", config.markers.size);
    println!("  辞書: {}", config.markers.dictionary);
    println!("  最大距離: {}m", config.calibration.distance_threshold);
    println!("  最小蓄積時間: {}s", config.calibration.min_duration);
    println!("  出力先: {}", cal_path.display());
    println!();

    let intrinsics_path = Path::new(&config.charuco.output_path);
    let saved = if intrinsics_path.exists() {
        Some(load_intrinsics(intrinsics_path)?)
    } else {
        println!("{} がありません。calibrate_camera で内部パラメータを校正できます", intrinsics_path.display());
        None
    };

    let mut sources = Vec::new();
    let mut intrinsics = Vec::new();
    for cam in &config.cameras {
        let camera = OpenCvCamera::open(cam.index, Some(cam.width), Some(cam.height), Some(cam.fps))?;
        let (w, h) = camera.resolution();
        intrinsics.push(resolve_intrinsics(cam, saved.as_ref(), w, h));
        sources.push((camera, ArucoMarkerDetector::new(&config.markers.dictionary)?));
    }

    let session = Arc::new(TrackingSession::with_intrinsics(config.clone(), intrinsics)?);
    let mut file = if cal_path.exists() {
        load_calibration(&cal_path)?
    } else {
        CalibrationFile::default()
    };
    session.load_calibration(&file);

    let events = session.subscribe();
    let lines = stdin_lines();
    let mut handle = session.start(sources)?;
    session.begin_calibration(tracker)?;

    let layout = session.layout();
    println!(
        "トラッカー {} (マーカー {}..{})",
        tracker,
        layout.root_id(tracker),
        layout.root_id(tracker) + layout.markers_per_tracker - 1
    );
    println!("コマンド:");
    println!("  r <id>  - ルートマーカーを指定");
    println!("  a       - カメラ間アライメントを更新");
    println!("  s       - 保存して終了");
    println!("  q       - 破棄して終了");
    println!();

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { break };
                match event {
                    SessionEvent::CalibrationProgress { tracker: t, camera, progress, active, .. } if t == tracker => {
                        if let Some(p) = progress.iter().find(|p| Some(p.id) == active) {
                            println!("  [cam {camera}] マーカー {}: {}", p.id, describe(&p.status));
                        } else if let Some(p) = progress.iter().find(|p| p.status != MarkerStatus::Anchor) {
                            println!("  [cam {camera}] マーカー {}: {}", p.id, describe(&p.status));
                        }
                    }
                    SessionEvent::MarkerCalibrated { tracker: t, marker } if t == tracker => {
                        println!("マーカー {marker} 校正完了");
                    }
                    SessionEvent::ModelRefined { tracker: t, report } if t == tracker && report.applied => {
                        println!(
                            "全体最適化: {}フレーム RMS {:.3}px → {:.3}px",
                            report.frames, report.initial_rms, report.final_rms
                        );
                    }
                    SessionEvent::RootDesignated { tracker: t, root } if t == tracker => {
                        println!("ルートマーカー: {root}");
                    }
                    SessionEvent::AlignmentRefined(a) => {
                        println!("カメラ {} アライメント更新: {:?}", a.camera_id, a.translation);
                    }
                    _ => {}
                }
            }
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["r", id] => match id.parse() {
                        Ok(id) => {
                            if let Err(e) = session.designate_root(tracker, id) {
                                println!("ルート指定失敗: {e}");
                            }
                        }
                        Err(_) => println!("不正なID: {id}"),
                    },
                    ["a"] => {
                        for camera in 0..session.camera_count() {
                            if camera == session.fuser().primary() {
                                continue;
                            }
                            if let Err(e) = session.refine_alignment(camera) {
                                println!("アライメント失敗: {e}");
                            }
                        }
                    }
                    ["s"] => {
                        match session.end_calibration(tracker) {
                            Ok(model) => {
                                file.upsert_tracker(model);
                                file.alignments = session.calibration_file().alignments;
                                save_calibration(&cal_path, &file)?;
                                println!("保存しました: {}", cal_path.display());
                            }
                            Err(e) => println!("校正失敗（元のモデルを保持）: {e}"),
                        }
                        break;
                    }
                    ["q"] => {
                        session.cancel_calibration(tracker)?;
                        println!("破棄しました");
                        break;
                    }
                    [] => {}
                    _ => println!("不明なコマンド: {line}"),
                }
            }
            default(Duration::from_millis(200)) => {}
        }
    }

    handle.stop();
    Ok(())
}
