use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "camera")]
use anyhow::Context;
#[cfg(feature = "camera")]
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};

/// キャプチャ済みフレーム
#[derive(Debug, Clone)]
pub struct Frame<I> {
    pub image: I,
    pub captured_at: Instant,
    pub sequence: u64,
}

/// 次のフレームが来るまでブロックするフレーム供給源
pub trait FrameSource: Send + 'static {
    type Image: Send + 'static;

    fn read_frame(&mut self) -> Result<Self::Image>;
}

/// プロデューサーとコンシューマー間の1枠バッファ
///
/// 常に最新フレームで上書きし、取り出される前に次が来たフレームは捨てる。
/// `try_take` は待たない。空、またはプロデューサーが書き込み中なら None。
pub struct FrameSlot<I> {
    latest: Mutex<Option<Frame<I>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl<I> FrameSlot<I> {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, image: I, captured_at: Instant) {
        let sequence = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.latest.lock();
        if slot.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        *slot = Some(Frame {
            image,
            captured_at,
            sequence,
        });
    }

    pub fn try_take(&self) -> Option<Frame<I>> {
        self.latest.try_lock().and_then(|mut slot| slot.take())
    }

    /// publish ごとに増加
    pub fn frame_id(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<I> Default for FrameSlot<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// 別スレッドでキャプチャし続け、最新フレームのみ保持するカメラ
pub struct ThreadedCamera<I> {
    slot: Arc<FrameSlot<I>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<I: Send + 'static> ThreadedCamera<I> {
    pub fn start<S>(name: String, mut source: S) -> Result<Self>
    where
        S: FrameSource<Image = I>,
    {
        let slot = Arc::new(FrameSlot::new());
        let running = Arc::new(AtomicBool::new(true));
        let slot_ref = Arc::clone(&slot);
        let running_ref = Arc::clone(&running);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut errors = 0u32;
            while running_ref.load(Ordering::Acquire) {
                match source.read_frame() {
                    Ok(image) => {
                        errors = 0;
                        slot_ref.publish(image, Instant::now());
                    }
                    Err(e) => {
                        errors += 1;
                        if errors == 1 || errors % 100 == 0 {
                            tracing::warn!(camera = %name, "read error ({errors}): {e:#}");
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            tracing::debug!(camera = %name, "capture thread stopped");
        })?;

        Ok(Self {
            slot,
            running,
            handle: Some(handle),
        })
    }

    pub fn slot(&self) -> Arc<FrameSlot<I>> {
        Arc::clone(&self.slot)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<I> Drop for ThreadedCamera<I> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// OpenCV キャプチャデバイス
#[cfg(feature = "camera")]
pub struct OpenCvCamera {
    capture: VideoCapture,
    width: u32,
    height: u32,
}

#[cfg(feature = "camera")]
impl OpenCvCamera {
    pub fn open(index: i32, width: Option<u32>, height: Option<u32>, fps: Option<u32>) -> Result<Self> {
        let mut capture = VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("failed to open camera {index}"))?;

        if !capture.is_opened()? {
            anyhow::bail!("Camera {} is not available", index);
        }

        if let Some(w) = width {
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)?;
        }
        if let Some(h) = height {
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)?;
        }
        if let Some(f) = fps {
            capture.set(videoio::CAP_PROP_FPS, f as f64)?;
        }
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        let actual_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let actual_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        let actual_fps = capture.get(videoio::CAP_PROP_FPS)?;
        tracing::info!(index, actual_width, actual_height, actual_fps, "camera opened");

        Ok(Self {
            capture,
            width: actual_width,
            height: actual_height,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(feature = "camera")]
impl FrameSource for OpenCvCamera {
    type Image = Mat;

    fn read_frame(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        self.capture
            .read(&mut frame)
            .context("Failed to read frame")?;

        if frame.empty() {
            anyhow::bail!("Empty frame received");
        }

        Ok(frame)
    }
}
