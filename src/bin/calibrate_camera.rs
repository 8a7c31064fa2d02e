use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use opencv::core::Size;
use std::path::Path;
use std::time::{Duration, Instant};

use marker_tracker::camera::charuco::{calibrate_pruned, create_board, create_detector, detect_view, CharucoCalibration};
use marker_tracker::camera::{
    intrinsics_snippet, load_intrinsics, save_intrinsics, FrameSource, IntrinsicsCalibration, IntrinsicsFile,
    OpenCvCamera,
};
use marker_tracker::config::{CameraConfig, Config};
use marker_tracker::logging;

const CONFIG_PATH: &str = "config.toml";

fn parse_camera_arg() -> Result<i32> {
    // Usage: calibrate_camera [camera_index]
    match std::env::args().nth(1) {
        Some(s) => s.parse().with_context(|| format!("Invalid camera index: {s}")),
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

fn main() -> Result<()> {
    let config = Config::load(CONFIG_PATH)?;
    logging::init(&config.logging, "calibrate_camera")?;
    let index = parse_camera_arg()?;
    let board_config = &config.charuco;
    let out_path = Path::new(&board_config.output_path).to_path_buf();
    let cam_config = config
        .cameras
        .iter()
        .find(|c| c.index == index)
        .cloned()
        .unwrap_or(CameraConfig { index, ..Default::default() });

    println!("=== カメラ内部パラメータ校正 ({}) ===", env!("GIT_VERSION"));
    println!();
    println!("ボード設定:");
    println!("  辞書: {}", board_config.dictionary);
    println!("  マス数: {}x{}", board_config.squares_x, board_config.squares_y);
    println!("  マス辺長: {}m", board_config.square_length);
    println!("  マーカー辺長: {}m", board_config.marker_length);
    println!("  フレーム数: {}", board_config.frames);
    println!("  出力先: {}", out_path.display());
    println!();

    let board = create_board(board_config)?;
    let detector = create_detector(&board)?;
    let mut camera = OpenCvCamera::open(
        index,
        Some(cam_config.width),
        Some(cam_config.height),
        Some(cam_config.fps),
    )?;
    let (width, height) = camera.resolution();
    let image_size = Size::new(width as i32, height as i32);

    println!("カメラ {index} ({width}x{height})");
    println!("ボードを様々な角度・距離から見せてください");
    println!("{}コーナー以上検出されると自動キャプチャします", board_config.min_corners);
    println!("コマンド:");
    println!("  s  - 現在のフレームで確定して保存");
    println!("  q  - 中止");
    println!();

    let lines = stdin_lines();
    let interval = Duration::from_secs_f64(board_config.capture_interval);
    let mut last_capture: Option<Instant> = None;
    let mut views = Vec::new();
    let mut latest: Option<CharucoCalibration> = None;

    while views.len() < board_config.frames {
        match lines.try_recv() {
            Ok(cmd) if cmd == "s" => break,
            Ok(cmd) if cmd == "q" => bail!("ユーザーにより中止されました"),
            Ok(cmd) if !cmd.is_empty() => println!("不明なコマンド: {cmd}"),
            Ok(_) | Err(_) => {}
        }

        let frame = match camera.read_frame() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("frame read failed: {e:#}");
                continue;
            }
        };
        if last_capture.is_some_and(|t| t.elapsed() < interval) {
            continue;
        }
        let Some(view) = detect_view(&detector, &board, &frame)? else {
            continue;
        };
        if (view.corners() as usize) < board_config.min_corners {
            continue;
        }

        views.push(view);
        last_capture = Some(Instant::now());
        print!("  キャプチャ: {}/{}", views.len(), board_config.frames);
        if views.len() >= 3 {
            match calibrate_pruned(&mut views, image_size, board_config.max_view_error) {
                Ok(result) => {
                    print!("  再投影誤差: {:.4} px", result.rms);
                    latest = Some(result);
                }
                Err(e) => print!("  校正失敗: {e:#}"),
            }
        }
        println!();
    }

    let result = match latest {
        Some(r) if views.len() >= 3 => r,
        _ => bail!("フレーム不足（{}枚、最低3枚必要）", views.len()),
    };

    let mut file = if out_path.exists() {
        load_intrinsics(&out_path)?
    } else {
        IntrinsicsFile::default()
    };
    file.upsert(IntrinsicsCalibration {
        camera_index: index,
        width,
        height,
        intrinsics: result.intrinsics.clone(),
        reprojection_error: result.rms,
        views: views.len(),
    });
    save_intrinsics(&out_path, &file)?;

    println!();
    println!("保存完了: {}", out_path.display());
    println!("config.toml に直接書く場合:");
    println!();
    println!("{}", intrinsics_snippet(&result.intrinsics)?);
    Ok(())
}
