use anyhow::{ensure, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use nalgebra::{Isometry3, Translation3};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::calibration::CalibrationFile;
use crate::camera::{CameraIntrinsics, FrameSource, ThreadedCamera};
use crate::config::{CalibrationConfig, Config, TrackerConfig};
use crate::geometry::PoseSample;
use crate::marker::{MarkerDetection, MarkerDetector, MarkerId, MarkerLayout};
use crate::tracker::fusion::MIN_ALIGNMENT_PAIRS;
use crate::tracker::{
    AlignmentError, CalibrationError, CalibrationReport, CameraAlignment, CameraObservation,
    EstimateError, MarkerProgress, MultiCameraFuser, Playspace, PoseEstimator, RefineReport,
    RigidBodyModel, TemporalSmoother, TrackerCalibrator,
};

const EVENT_CAPACITY: usize = 1024;
/// 前フレームの姿勢を初期値に使う最大経過時間（秒）
const PRIOR_MAX_AGE: f64 = 0.25;
/// 平滑化済みサンプルの有効期限（ウィンドウ + 遅延に加算、秒）
const OUTPUT_GRACE: f64 = 0.1;
const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("unknown camera {0}")]
    UnknownCamera(usize),
    #[error("unknown tracker {0}")]
    UnknownTracker(usize),
    #[error("tracker {0} is ignored")]
    Ignored(usize),
    #[error("tracker {0} is already calibrating")]
    AlreadyCalibrating(usize),
    #[error("tracker {0} is not calibrating")]
    NotCalibrating(usize),
    #[error("expected intrinsics for {expected} cameras, got {got}")]
    IntrinsicsMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("session stopped")]
    Stopped,
}

/// トラッカーごとの状態（VR 側へ通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Ignored,
    /// 校正済みマーカーなし
    Uncalibrated,
    /// 校正中（蓄積中のマーカー）
    Calibrating(Option<MarkerId>),
    Calibrated,
    TrackingLost,
}

/// 1トラッカー分の出力（ルーム座標系）
#[derive(Debug, Clone)]
pub struct TrackerOutput {
    pub tracker_id: usize,
    pub name: String,
    pub vmt_index: i32,
    pub status: TrackerStatus,
    pub pose: Option<PoseSample>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp: f64,
    pub trackers: Vec<TrackerStatus>,
}

/// 操作コンソール向けの通知
#[derive(Debug)]
pub enum SessionEvent {
    CalibrationStarted { tracker: usize, root: Option<MarkerId> },
    RootDesignated { tracker: usize, root: MarkerId },
    CalibrationProgress {
        tracker: usize,
        camera: usize,
        timestamp: f64,
        progress: Vec<MarkerProgress>,
        active: Option<MarkerId>,
    },
    MarkerCalibrated { tracker: usize, marker: MarkerId },
    ModelRefined { tracker: usize, report: RefineReport },
    CalibrationFinished { tracker: usize, markers: usize },
    CalibrationAborted { tracker: usize, error: CalibrationError },
    AlignmentRefined(CameraAlignment),
}

struct CalibrationRun {
    calibrator: TrackerCalibrator,
    /// 中断時に戻すモデル
    previous: RigidBodyModel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Tracking,
    Calibrating(Option<MarkerId>),
}

struct TrackerState {
    config: TrackerConfig,
    model: RwLock<RigidBodyModel>,
    run: Mutex<Option<CalibrationRun>>,
    phase: RwLock<Phase>,
    /// カメラごとの最新の平滑化済みサンプル（カメラ座標系）
    smoothed: Vec<RwLock<Option<CameraObservation>>>,
    /// カメラごとの最新の生推定（アライメント用、ルートマーカー基準）
    raw: Vec<RwLock<Option<CameraObservation>>>,
}

/// コンシューマースレッドが占有するカメラごとの状態
struct CameraState {
    intrinsics: CameraIntrinsics,
    smoothers: Vec<TemporalSmoother>,
    priors: Vec<Option<(f64, Isometry3<f64>)>>,
    confidence: Vec<f64>,
}

impl CameraState {
    fn reset_tracker(&mut self, tracker: usize) {
        if let Some(s) = self.smoothers.get_mut(tracker) {
            s.reset();
        }
        if let Some(p) = self.priors.get_mut(tracker) {
            *p = None;
        }
    }
}

/// N トラッカー × M カメラの推定・校正・統合
pub struct TrackingSession {
    layout: MarkerLayout,
    estimator: PoseEstimator,
    calibration: CalibrationConfig,
    use_centers: bool,
    use_predictive: bool,
    /// カメラごとの出力有効期限
    max_age: Vec<f64>,
    trackers: Vec<TrackerState>,
    cameras: Vec<Mutex<CameraState>>,
    fuser: MultiCameraFuser,
    auto_refine_interval: f64,
    last_auto_refine: Mutex<Vec<Option<f64>>>,
    playspace: Playspace,
    epoch: Instant,
    running: AtomicBool,
    events: Sender<SessionEvent>,
    receiver: Receiver<SessionEvent>,
}

impl TrackingSession {
    /// 内部パラメータは設定ファイルから
    pub fn new(config: Config) -> Self {
        let config = config.validated();
        let intrinsics = config.cameras.iter().map(|c| c.intrinsics()).collect();
        Self::build(config, intrinsics)
    }

    pub fn with_intrinsics(config: Config, intrinsics: Vec<CameraIntrinsics>) -> Result<Self, SessionError> {
        let config = config.validated();
        if intrinsics.len() != config.cameras.len() {
            return Err(SessionError::IntrinsicsMismatch {
                expected: config.cameras.len(),
                got: intrinsics.len(),
            });
        }
        Ok(Self::build(config, intrinsics))
    }

    fn build(config: Config, intrinsics: Vec<CameraIntrinsics>) -> Self {
        let tracker_count = config.tracker_count();
        let camera_count = config.cameras.len();

        let trackers = config
            .trackers
            .iter()
            .enumerate()
            .map(|(id, tc)| TrackerState {
                config: tc.clone(),
                model: RwLock::new(RigidBodyModel::new(id)),
                run: Mutex::new(None),
                phase: RwLock::new(Phase::Tracking),
                smoothed: (0..camera_count).map(|_| RwLock::new(None)).collect(),
                raw: (0..camera_count).map(|_| RwLock::new(None)).collect(),
            })
            .collect();

        let cameras = config
            .cameras
            .iter()
            .zip(intrinsics)
            .map(|(cc, intrinsics)| {
                Mutex::new(CameraState {
                    intrinsics,
                    smoothers: (0..tracker_count)
                        .map(|_| TemporalSmoother::from_config(&config.smoothing, cc.latency))
                        .collect(),
                    priors: vec![None; tracker_count],
                    confidence: vec![0.0; tracker_count],
                })
            })
            .collect();

        let max_age = config
            .cameras
            .iter()
            .map(|c| config.smoothing.window + c.latency + OUTPUT_GRACE)
            .collect();

        let (events, receiver) = bounded(EVENT_CAPACITY);
        tracing::info!(
            trackers = tracker_count,
            cameras = camera_count,
            marker_size = config.markers.size,
            "tracking session created"
        );

        Self {
            layout: config.markers.layout(),
            estimator: PoseEstimator::new(config.markers.size),
            calibration: config.calibration.clone(),
            use_centers: config.markers.use_centers,
            use_predictive: config.markers.use_predictive,
            max_age,
            trackers,
            cameras,
            fuser: MultiCameraFuser::new(camera_count, &config.multicam),
            auto_refine_interval: config.multicam.auto_refine_interval,
            last_auto_refine: Mutex::new(vec![None; camera_count]),
            playspace: Playspace::from_config(&config.playspace),
            epoch: Instant::now(),
            running: AtomicBool::new(true),
            events,
            receiver,
        }
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn layout(&self) -> MarkerLayout {
        self.layout
    }

    pub fn fuser(&self) -> &MultiCameraFuser {
        &self.fuser
    }

    /// セッション開始からの秒数
    pub fn timestamp(&self, instant: Instant) -> f64 {
        instant.saturating_duration_since(self.epoch).as_secs_f64()
    }

    pub fn now(&self) -> f64 {
        self.timestamp(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止要求。以降ポーズは出力しない
    pub fn request_stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("tracking session stopping");
        }
    }

    /// イベント受信側（複数可、各イベントはどれか1つに届く）
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.receiver.clone()
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => tracing::trace!("event queue full, dropped {e:?}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn tracker(&self, tracker_id: usize) -> Result<&TrackerState, SessionError> {
        self.trackers
            .get(tracker_id)
            .ok_or(SessionError::UnknownTracker(tracker_id))
    }

    pub fn model(&self, tracker_id: usize) -> Option<RigidBodyModel> {
        self.trackers.get(tracker_id).map(|t| t.model.read().clone())
    }

    // --- 推定 ---

    /// 1カメラ1フレーム分の検出結果を処理する
    ///
    /// 校正中のトラッカーには観測を渡し、全トラッカーの姿勢を推定して平滑化する。
    /// 戻り値は姿勢が得られたトラッカー数。
    pub fn process_frame(
        &self,
        camera_id: usize,
        detections: &[MarkerDetection],
        timestamp: f64,
    ) -> Result<usize, SessionError> {
        if !self.is_running() {
            return Err(SessionError::Stopped);
        }
        let mut cam = self
            .cameras
            .get(camera_id)
            .ok_or(SessionError::UnknownCamera(camera_id))?
            .lock();
        let intrinsics = cam.intrinsics;

        for (tracker_id, tracker) in self.trackers.iter().enumerate() {
            let mut run = tracker.run.lock();
            let Some(run) = run.as_mut() else {
                continue;
            };
            let report = run.calibrator.observe(&intrinsics, detections, timestamp);
            self.apply_calibration_report(tracker_id, tracker, camera_id, timestamp, run, report);
        }

        let mut estimated = 0;
        for (tracker_id, tracker) in self.trackers.iter().enumerate() {
            if tracker.config.ignore {
                continue;
            }
            let own: Vec<MarkerDetection> = detections
                .iter()
                .filter(|d| self.layout.owns(tracker_id, d.id))
                .cloned()
                .collect();

            let prior = cam.priors[tracker_id]
                .filter(|(t, _)| self.use_predictive && timestamp - t <= PRIOR_MAX_AGE)
                .map(|(_, pose)| pose);

            let result = if own.is_empty() {
                Err(EstimateError::NoMarkersMatched)
            } else {
                let model = tracker.model.read();
                self.estimator
                    .estimate(&own, &model, &intrinsics, prior.as_ref())
                    .map(|est| {
                        let center = if self.use_centers { model.centroid() } else { None };
                        (est, center)
                    })
            };

            match result {
                Ok((est, center)) => {
                    estimated += 1;
                    cam.priors[tracker_id] = Some((timestamp, est.pose));
                    cam.confidence[tracker_id] = est.confidence;

                    let raw = CameraObservation {
                        camera_id,
                        sample: PoseSample::from_isometry(timestamp, &est.pose),
                        confidence: est.confidence,
                    };
                    self.publish(&tracker.raw[camera_id], Some(raw));
                    self.record_pairs(tracker, &raw);

                    // 出力原点をマーカー群の中心へ
                    let output = match center {
                        Some(c) => est.pose * Translation3::from(c),
                        None => est.pose,
                    };
                    cam.smoothers[tracker_id].push(PoseSample::from_isometry(timestamp, &output));
                }
                // MalformedModel は推定側で記録済み
                Err(EstimateError::NoMarkersMatched | EstimateError::MalformedModel(_)) => {}
                Err(e) => {
                    tracing::debug!(tracker = tracker_id, camera = camera_id, "estimate failed: {e}");
                }
            }

            let smoothed = cam.smoothers[tracker_id]
                .get_smoothed(timestamp)
                .ok()
                .map(|sample| CameraObservation {
                    camera_id,
                    sample,
                    confidence: cam.confidence[tracker_id],
                });
            self.publish(&tracker.smoothed[camera_id], smoothed);
        }
        drop(cam);

        if camera_id != self.fuser.primary() {
            self.maybe_auto_refine(camera_id, timestamp);
        }
        Ok(estimated)
    }

    /// 停止要求後は書き込まない（クリアのみ許可）
    fn publish(&self, slot: &RwLock<Option<CameraObservation>>, value: Option<CameraObservation>) {
        let mut guard = slot.write();
        if value.is_none() || self.is_running() {
            *guard = value;
        }
    }

    /// 基準カメラと他カメラの同時観測をアライメント用に記録
    fn record_pairs(&self, tracker: &TrackerState, obs: &CameraObservation) {
        let primary = self.fuser.primary();
        if obs.camera_id == primary {
            for (camera, slot) in tracker.raw.iter().enumerate() {
                if camera == primary {
                    continue;
                }
                if let Some(other) = *slot.read() {
                    self.fuser.record_pair(obs, &other);
                }
            }
        } else if let Some(p) = tracker.raw.get(primary).and_then(|slot| *slot.read()) {
            self.fuser.record_pair(&p, obs);
        }
    }

    fn maybe_auto_refine(&self, camera_id: usize, timestamp: f64) {
        if self.auto_refine_interval <= 0.0 || self.fuser.pair_count(camera_id) < MIN_ALIGNMENT_PAIRS {
            return;
        }
        {
            let mut last = self.last_auto_refine.lock();
            let Some(slot) = last.get_mut(camera_id) else {
                return;
            };
            if slot.is_some_and(|t| timestamp - t < self.auto_refine_interval) {
                return;
            }
            *slot = Some(timestamp);
        }
        if let Err(e) = self.refine_alignment(camera_id) {
            tracing::debug!(camera = camera_id, "auto alignment skipped: {e}");
        }
    }

    // --- 出力 ---

    /// 全トラッカーの統合・平滑化済み姿勢（ルーム座標系）
    pub fn fused_outputs(&self, now: f64) -> Vec<TrackerOutput> {
        let running = self.is_running();
        self.trackers
            .iter()
            .enumerate()
            .map(|(id, tracker)| {
                let pose = if running && !tracker.config.ignore {
                    self.fuse_tracker(tracker, now)
                } else {
                    None
                };
                TrackerOutput {
                    tracker_id: id,
                    name: tracker.config.name.clone(),
                    vmt_index: tracker.config.vmt_index.unwrap_or(id as i32),
                    status: self.status_of(tracker, pose.is_some()),
                    pose,
                }
            })
            .collect()
    }

    fn fuse_tracker(&self, tracker: &TrackerState, now: f64) -> Option<PoseSample> {
        let observations: Vec<CameraObservation> = tracker
            .smoothed
            .iter()
            .zip(&self.max_age)
            .filter_map(|(slot, max_age)| {
                let obs = (*slot.read())?;
                (now - obs.sample.timestamp <= *max_age).then_some(obs)
            })
            .collect();
        let fused = self.fuser.fuse(&observations)?;
        Some(self.playspace.apply(&fused))
    }

    fn status_of(&self, tracker: &TrackerState, has_pose: bool) -> TrackerStatus {
        if tracker.config.ignore {
            return TrackerStatus::Ignored;
        }
        if let Phase::Calibrating(active) = *tracker.phase.read() {
            return TrackerStatus::Calibrating(active);
        }
        if tracker.model.read().calibrated_count() == 0 {
            return TrackerStatus::Uncalibrated;
        }
        if has_pose {
            TrackerStatus::Calibrated
        } else {
            TrackerStatus::TrackingLost
        }
    }

    pub fn status_snapshot(&self, now: f64) -> StatusSnapshot {
        StatusSnapshot {
            timestamp: now,
            trackers: self.fused_outputs(now).into_iter().map(|o| o.status).collect(),
        }
    }

    // --- 校正 ---

    /// 校正開始。ルート未指定ならレイアウト上の先頭マーカーをルートにする
    pub fn begin_calibration(&self, tracker_id: usize) -> Result<(), SessionError> {
        let tracker = self.tracker(tracker_id)?;
        if tracker.config.ignore {
            return Err(SessionError::Ignored(tracker_id));
        }
        let root = {
            let mut run = tracker.run.lock();
            if run.is_some() {
                return Err(SessionError::AlreadyCalibrating(tracker_id));
            }
            let previous = tracker.model.read().clone();
            let mut calibrator = TrackerCalibrator::new(
                previous.clone(),
                self.layout,
                self.calibration.clone(),
                self.estimator.marker_size(),
            );
            if previous.root.is_none() {
                calibrator.designate_root(self.layout.root_id(tracker_id))?;
                *tracker.model.write() = calibrator.model().clone();
            }
            let root = calibrator.model().root;
            *run = Some(CalibrationRun { calibrator, previous });
            root
        };
        *tracker.phase.write() = Phase::Calibrating(None);
        tracing::info!(tracker = tracker_id, ?root, "calibration started");
        self.emit(SessionEvent::CalibrationStarted { tracker: tracker_id, root });
        Ok(())
    }

    /// ルートマーカーを指定し直す（トラッカー座標系が変わるので平滑化もやり直し）
    pub fn designate_root(&self, tracker_id: usize, marker: MarkerId) -> Result<(), SessionError> {
        let tracker = self.tracker(tracker_id)?;
        {
            let mut run = tracker.run.lock();
            let run = run.as_mut().ok_or(SessionError::NotCalibrating(tracker_id))?;
            run.calibrator.designate_root(marker)?;
            *tracker.model.write() = run.calibrator.model().clone();
        }
        self.reset_tracker(tracker_id);
        self.emit(SessionEvent::RootDesignated { tracker: tracker_id, root: marker });
        Ok(())
    }

    /// 校正終了。成功すればモデルを確定、InsufficientSamples なら元のモデルに戻す
    pub fn end_calibration(&self, tracker_id: usize) -> Result<RigidBodyModel, SessionError> {
        let tracker = self.tracker(tracker_id)?;
        let CalibrationRun { calibrator, previous } = tracker
            .run
            .lock()
            .take()
            .ok_or(SessionError::NotCalibrating(tracker_id))?;
        *tracker.phase.write() = Phase::Tracking;

        match calibrator.finish() {
            Ok(model) => {
                *tracker.model.write() = model.clone();
                self.emit(SessionEvent::CalibrationFinished {
                    tracker: tracker_id,
                    markers: model.calibrated_count(),
                });
                Ok(model)
            }
            Err(e) => {
                let root_changed = tracker.model.read().root != previous.root;
                *tracker.model.write() = previous;
                if root_changed {
                    self.reset_tracker(tracker_id);
                }
                tracing::warn!(tracker = tracker_id, "calibration aborted: {e}");
                self.emit(SessionEvent::CalibrationAborted {
                    tracker: tracker_id,
                    error: e.clone(),
                });
                Err(e.into())
            }
        }
    }

    /// 校正を破棄して元のモデルに戻す
    pub fn cancel_calibration(&self, tracker_id: usize) -> Result<(), SessionError> {
        let tracker = self.tracker(tracker_id)?;
        let run = tracker
            .run
            .lock()
            .take()
            .ok_or(SessionError::NotCalibrating(tracker_id))?;
        *tracker.phase.write() = Phase::Tracking;
        *tracker.model.write() = run.previous;
        self.reset_tracker(tracker_id);
        tracing::info!(tracker = tracker_id, "calibration cancelled");
        Ok(())
    }

    pub fn is_calibrating(&self, tracker_id: usize) -> bool {
        self.trackers
            .get(tracker_id)
            .is_some_and(|t| matches!(*t.phase.read(), Phase::Calibrating(_)))
    }

    fn apply_calibration_report(
        &self,
        tracker_id: usize,
        tracker: &TrackerState,
        camera_id: usize,
        timestamp: f64,
        run: &mut CalibrationRun,
        report: CalibrationReport,
    ) {
        let model_changed = !report.newly_calibrated.is_empty() || report.refined.is_some_and(|r| r.applied);
        if model_changed {
            *tracker.model.write() = run.calibrator.model().clone();
        }
        *tracker.phase.write() = Phase::Calibrating(report.active);

        for marker in &report.newly_calibrated {
            self.emit(SessionEvent::MarkerCalibrated { tracker: tracker_id, marker: *marker });
        }
        if let Some(r) = report.refined {
            self.emit(SessionEvent::ModelRefined { tracker: tracker_id, report: r });
        }
        if !report.progress.is_empty() {
            self.emit(SessionEvent::CalibrationProgress {
                tracker: tracker_id,
                camera: camera_id,
                timestamp,
                progress: report.progress,
                active: report.active,
            });
        }
    }

    /// トラッカーの平滑化・前フレーム姿勢・出力を全カメラ分破棄
    fn reset_tracker(&self, tracker_id: usize) {
        for cam in &self.cameras {
            cam.lock().reset_tracker(tracker_id);
        }
        if let Some(tracker) = self.trackers.get(tracker_id) {
            for slot in tracker.smoothed.iter().chain(&tracker.raw) {
                *slot.write() = None;
            }
        }
    }

    // --- カメラ間アライメント ---

    pub fn refine_alignment(&self, camera_id: usize) -> Result<CameraAlignment, SessionError> {
        let alignment = self.fuser.refine(camera_id)?;
        self.emit(SessionEvent::AlignmentRefined(alignment));
        Ok(alignment)
    }

    // --- 保存・読み込み ---

    /// 保存済みモデルとアライメントを反映する
    pub fn load_calibration(&self, file: &CalibrationFile) {
        for model in &file.trackers {
            let Some(tracker) = self.trackers.get(model.tracker_id) else {
                tracing::warn!(tracker = model.tracker_id, "calibration for unknown tracker ignored");
                continue;
            };
            *tracker.model.write() = model.clone();
            self.reset_tracker(model.tracker_id);
        }
        self.fuser.alignments().load(&file.alignments);
        tracing::info!(
            trackers = file.trackers.len(),
            alignments = file.alignments.len(),
            "calibration loaded"
        );
    }

    /// ルートが決まっているモデルと現在のアライメント
    pub fn calibration_file(&self) -> CalibrationFile {
        CalibrationFile {
            trackers: self
                .trackers
                .iter()
                .map(|t| t.model.read().clone())
                .filter(|m| m.root.is_some())
                .map(|mut m| {
                    m.drop_in_progress();
                    m
                })
                .collect(),
            alignments: self.fuser.alignments().snapshot(),
        }
    }

    // --- スレッド ---

    /// カメラごとにキャプチャスレッドと検出スレッドを起動
    ///
    /// cameras の並びがカメラ番号になる。
    pub fn start<S, D>(self: &Arc<Self>, cameras: Vec<(S, D)>) -> Result<SessionHandle<S::Image>>
    where
        S: FrameSource,
        D: MarkerDetector<Image = S::Image> + 'static,
    {
        ensure!(
            cameras.len() == self.cameras.len(),
            "expected {} cameras, got {}",
            self.cameras.len(),
            cameras.len()
        );
        ensure!(self.is_running(), SessionError::Stopped);

        let mut captures = Vec::with_capacity(cameras.len());
        let mut consumers = Vec::with_capacity(cameras.len());
        for (camera_id, (source, mut detector)) in cameras.into_iter().enumerate() {
            let capture = ThreadedCamera::start(format!("capture-{camera_id}"), source)?;
            let slot = capture.slot();
            let session = Arc::clone(self);
            let consumer = thread::Builder::new()
                .name(format!("detect-{camera_id}"))
                .spawn(move || {
                    while session.is_running() {
                        let Some(frame) = slot.try_take() else {
                            thread::sleep(IDLE_SLEEP);
                            continue;
                        };
                        let detections = match detector.detect(&frame.image) {
                            Ok(d) => d,
                            Err(e) => {
                                tracing::warn!(camera = camera_id, frame = frame.sequence, "detection failed: {e:#}");
                                continue;
                            }
                        };
                        let t = session.timestamp(frame.captured_at);
                        match session.process_frame(camera_id, &detections, t) {
                            Ok(_) => {}
                            Err(SessionError::Stopped) => break,
                            Err(e) => tracing::warn!(camera = camera_id, "frame skipped: {e}"),
                        }
                    }
                    tracing::debug!(
                        camera = camera_id,
                        dropped = slot.dropped(),
                        "detection thread stopped"
                    );
                })?;
            captures.push(capture);
            consumers.push(consumer);
        }

        tracing::info!(cameras = captures.len(), "tracking session started");
        Ok(SessionHandle {
            session: Arc::clone(self),
            captures,
            consumers,
        })
    }
}

/// 起動中のスレッド群
pub struct SessionHandle<I: Send + 'static> {
    session: Arc<TrackingSession>,
    captures: Vec<ThreadedCamera<I>>,
    consumers: Vec<thread::JoinHandle<()>>,
}

impl<I: Send + 'static> SessionHandle<I> {
    pub fn session(&self) -> &Arc<TrackingSession> {
        &self.session
    }

    /// 停止要求 → 処理中のフレームを終えた検出スレッドを join → キャプチャ停止
    pub fn stop(&mut self) {
        self.session.request_stop();
        for consumer in self.consumers.drain(..) {
            if consumer.join().is_err() {
                tracing::error!("detection thread panicked");
            }
        }
        for capture in &mut self.captures {
            capture.stop();
        }
    }
}

impl<I: Send + 'static> Drop for SessionHandle<I> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, IntrinsicsConfig};
    use crate::sim::{render_detections, SyntheticCamera};
    use nalgebra::{UnitQuaternion, Vector3};

    const MARKER_SIZE: f64 = 0.05;

    fn config(cameras: usize) -> Config {
        let mut config = Config::default();
        config.markers.size = MARKER_SIZE;
        config.markers.use_predictive = true;
        config.cameras = (0..cameras)
            .map(|i| CameraConfig {
                index: i as i32,
                intrinsics: Some(IntrinsicsConfig {
                    matrix: [800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0],
                    dist_coeffs: vec![0.0; 5],
                }),
                ..Default::default()
            })
            .collect();
        config.calibration.min_duration = 0.3;
        config.calibration.min_samples = 5;
        config
    }

    fn truth(tracker: usize, root: MarkerId) -> RigidBodyModel {
        let mut m = RigidBodyModel::new(tracker);
        m.set_root(root);
        m.insert_calibrated(root + 1, &Isometry3::new(Vector3::new(0.07, 0.0, -0.01), Vector3::new(0.0, 0.5, 0.0)));
        m
    }

    fn facing(t: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.01 * t.sin(), 0.0, 0.3),
            UnitQuaternion::from_euler_angles(std::f64::consts::PI + 0.2, -0.15, 0.0),
        )
    }

    fn camera0(session: &TrackingSession) -> SyntheticCamera {
        let intrinsics = session.cameras[0].lock().intrinsics;
        SyntheticCamera::new(0, intrinsics, Isometry3::identity())
    }

    #[test]
    fn test_uncalibrated_then_lost_then_tracked() {
        let session = TrackingSession::new(config(1));
        assert_eq!(session.tracker_count(), 3);
        assert!(session
            .status_snapshot(0.0)
            .trackers
            .iter()
            .all(|s| *s == TrackerStatus::Uncalibrated));

        let mut file = CalibrationFile::default();
        file.upsert_tracker(truth(0, 0));
        session.load_calibration(&file);

        let out = session.fused_outputs(0.0);
        assert_eq!(out[0].status, TrackerStatus::TrackingLost);
        assert!(out[0].pose.is_none());

        let cam = camera0(&session);
        let model = truth(0, 0);
        for i in 0..10 {
            let t = i as f64 / 30.0;
            let dets = render_detections(&cam, &facing(t), &model, MARKER_SIZE);
            assert_eq!(session.process_frame(0, &dets, t).unwrap(), 1);
        }
        let out = session.fused_outputs(9.0 / 30.0);
        assert_eq!(out[0].status, TrackerStatus::Calibrated);
        assert_eq!(out[0].vmt_index, 0);
        let pose = out[0].pose.unwrap();
        // カメラ前方 0.3m → ルームでは -z
        assert!(pose.position.z < -0.25);

        // 期限切れでロスト
        let out = session.fused_outputs(5.0);
        assert_eq!(out[0].status, TrackerStatus::TrackingLost);
    }

    #[test]
    fn test_unknown_camera() {
        let session = TrackingSession::new(config(1));
        assert_eq!(session.process_frame(3, &[], 0.0), Err(SessionError::UnknownCamera(3)));
    }

    #[test]
    fn test_intrinsics_mismatch() {
        let err = TrackingSession::with_intrinsics(config(2), vec![CameraIntrinsics::from_fov(60.0, 640, 480)]);
        assert!(matches!(err, Err(SessionError::IntrinsicsMismatch { expected: 2, got: 1 })));
    }

    #[test]
    fn test_calibration_lifecycle() {
        let session = TrackingSession::new(config(1));
        let events = session.subscribe();
        session.begin_calibration(0).unwrap();
        assert_eq!(session.begin_calibration(0), Err(SessionError::AlreadyCalibrating(0)));
        assert_eq!(session.model(0).unwrap().root, Some(0));
        assert_eq!(session.status_snapshot(0.0).trackers[0], TrackerStatus::Calibrating(None));

        let cam = camera0(&session);
        let model = truth(0, 0);
        for i in 0..30 {
            let t = i as f64 / 30.0;
            let dets = render_detections(&cam, &facing(t), &model, MARKER_SIZE);
            session.process_frame(0, &dets, t).unwrap();
        }
        let result = session.end_calibration(0).unwrap();
        assert!(result.is_calibrated(1));
        let offset = result.marker_pose(1).unwrap();
        let expected = model.marker_pose(1).unwrap();
        assert!((offset.translation.vector - expected.translation.vector).norm() < 2e-3);

        let received: Vec<SessionEvent> = events.try_iter().collect();
        assert!(received
            .iter()
            .any(|e| matches!(e, SessionEvent::MarkerCalibrated { tracker: 0, marker: 1 })));
        assert!(received
            .iter()
            .any(|e| matches!(e, SessionEvent::CalibrationFinished { tracker: 0, markers: 2 })));
        assert!(!session.is_calibrating(0));
    }

    #[test]
    fn test_insufficient_samples_restores_model() {
        let session = TrackingSession::new(config(1));
        let mut file = CalibrationFile::default();
        file.upsert_tracker(truth(1, 45));
        session.load_calibration(&file);
        let before = session.model(1).unwrap();

        session.begin_calibration(1).unwrap();
        let err = session.end_calibration(1);
        assert_eq!(
            err,
            Err(SessionError::Calibration(CalibrationError::InsufficientSamples { tracker: 1 }))
        );
        assert_eq!(session.model(1).unwrap(), before);
        assert_eq!(session.end_calibration(1), Err(SessionError::NotCalibrating(1)));
    }

    #[test]
    fn test_designate_foreign_root_rejected() {
        let session = TrackingSession::new(config(1));
        session.begin_calibration(0).unwrap();
        let err = session.designate_root(0, 50);
        assert!(matches!(
            err,
            Err(SessionError::Calibration(CalibrationError::ForeignMarker { id: 50, owner: 1, tracker: 0 }))
        ));
        session.designate_root(0, 3).unwrap();
        assert_eq!(session.model(0).unwrap().root, Some(3));
        session.cancel_calibration(0).unwrap();
        assert_eq!(session.model(0).unwrap().root, None);
    }

    #[test]
    fn test_ignored_tracker() {
        let mut cfg = config(1);
        cfg.trackers[2].ignore = true;
        let session = TrackingSession::new(cfg);
        assert_eq!(session.begin_calibration(2), Err(SessionError::Ignored(2)));
        assert_eq!(session.status_snapshot(0.0).trackers[2], TrackerStatus::Ignored);
    }

    #[test]
    fn test_no_output_after_stop() {
        let session = TrackingSession::new(config(1));
        let mut file = CalibrationFile::default();
        file.upsert_tracker(truth(0, 0));
        session.load_calibration(&file);
        let cam = camera0(&session);
        let model = truth(0, 0);
        let dets = render_detections(&cam, &facing(0.0), &model, MARKER_SIZE);
        session.process_frame(0, &dets, 0.0).unwrap();
        assert!(session.fused_outputs(0.0)[0].pose.is_some());

        session.request_stop();
        assert_eq!(session.process_frame(0, &dets, 0.01), Err(SessionError::Stopped));
        assert!(session.fused_outputs(0.01).iter().all(|o| o.pose.is_none()));
    }

    #[test]
    fn test_centering_moves_output_origin() {
        let mut cfg = config(1);
        cfg.markers.use_centers = true;
        let centered = TrackingSession::new(cfg);
        let plain = TrackingSession::new(config(1));
        let mut file = CalibrationFile::default();
        file.upsert_tracker(truth(0, 0));
        centered.load_calibration(&file);
        plain.load_calibration(&file);

        let cam = camera0(&plain);
        let dets = render_detections(&cam, &facing(0.0), &truth(0, 0), MARKER_SIZE);
        centered.process_frame(0, &dets, 0.0).unwrap();
        plain.process_frame(0, &dets, 0.0).unwrap();
        let a = centered.fused_outputs(0.0)[0].pose.unwrap();
        let b = plain.fused_outputs(0.0)[0].pose.unwrap();
        // 中心 = 2マーカー中心の平均 → オフセット半分
        let shift = (a.position - b.position).norm();
        let half = truth(0, 0).centroid().unwrap().norm();
        assert!((shift - half).abs() < 1e-3, "shift {shift} vs {half}");
    }

    #[test]
    fn test_calibration_file_snapshot() {
        let session = TrackingSession::new(config(2));
        let mut file = CalibrationFile::default();
        file.upsert_tracker(truth(0, 0));
        file.alignments.push(CameraAlignment::from_isometry(
            1,
            &Isometry3::new(Vector3::new(0.5, 0.0, 0.0), Vector3::zeros()),
        ));
        session.load_calibration(&file);
        let saved = session.calibration_file();
        assert_eq!(saved.trackers.len(), 1);
        assert_eq!(saved.alignments.len(), 2);
        assert!((saved.alignments[1].translation.x - 0.5).abs() < 1e-12);
    }
}
