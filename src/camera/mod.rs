//! Camera capture module
//!
//! Captures frames on a background thread using the nokhwa crate and keeps
//! the latest one for the render loop and the detector. The device stream is
//! always stopped before the capture thread exits, on every teardown path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::Mutex;

use crate::error::{MoodMaskError, Result};

/// Camera frame data
#[derive(Clone)]
pub struct CameraFrame {
    /// RGBA pixel data
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub frame_number: u64,
    pub timestamp: Instant,
}

impl CameraFrame {
    /// Nearest-neighbour downscale, used to build reduced inference inputs
    pub fn downscale(&self, target_width: u32, target_height: u32) -> Vec<u8> {
        if self.width == target_width && self.height == target_height {
            return self.data.clone();
        }

        let mut output = vec![0u8; (target_width * target_height * 4) as usize];
        let x_ratio = self.width as f32 / target_width as f32;
        let y_ratio = self.height as f32 / target_height as f32;

        for y in 0..target_height {
            for x in 0..target_width {
                let src_x = (x as f32 * x_ratio) as u32;
                let src_y = (y as f32 * y_ratio) as u32;
                let src_idx = ((src_y * self.width + src_x) * 4) as usize;
                let dst_idx = ((y * target_width + x) * 4) as usize;

                if src_idx + 3 < self.data.len() && dst_idx + 3 < output.len() {
                    output[dst_idx..dst_idx + 4].copy_from_slice(&self.data[src_idx..src_idx + 4]);
                }
            }
        }

        output
    }

    /// Copy into an `image` buffer. `None` if the data does not match the size.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// Raw pixels handed over by a [`FrameSource`]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A camera device. Created and driven entirely on the capture thread.
pub trait FrameSource {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Block until the next frame is available
    fn next_frame(&mut self) -> Result<RawFrame>;

    /// Stop the device stream and release the hardware
    fn stop(&mut self) -> Result<()>;
}

/// nokhwa-backed camera
pub struct NokhwaSource {
    camera: Camera,
}

impl NokhwaSource {
    /// Open camera `camera_index` at `width`x`height`, trying progressively
    /// looser formats
    pub fn open(camera_index: u32, width: u32, height: u32) -> Result<Self> {
        let index = CameraIndex::Index(camera_index);

        let attempts = [
            RequestedFormatType::HighestResolution(nokhwa::utils::Resolution::new(width, height)),
            RequestedFormatType::AbsoluteHighestResolution,
            RequestedFormatType::HighestResolution(nokhwa::utils::Resolution::new(640, 480)),
            RequestedFormatType::None,
        ];

        let mut last_error = None;
        let mut opened = None;
        for format_type in attempts {
            let attempt = format!("{:?}", format_type);
            let requested = RequestedFormat::new::<RgbAFormat>(format_type);
            match Camera::new(index.clone(), requested) {
                Ok(camera) => {
                    opened = Some(camera);
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to open camera with {}: {:?}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let mut camera = opened.ok_or_else(|| {
            MoodMaskError::camera(format!(
                "failed to open camera {} with all format attempts: {:?}",
                camera_index, last_error
            ))
        })?;

        camera
            .open_stream()
            .map_err(|e| MoodMaskError::camera(format!("failed to open camera stream: {:?}", e)))?;

        log::info!(
            "Camera opened: {} ({}x{})",
            camera.info().human_name(),
            camera.resolution().width(),
            camera.resolution().height()
        );

        Ok(Self { camera })
    }
}

impl FrameSource for NokhwaSource {
    fn name(&self) -> String {
        self.camera.info().human_name().to_string()
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| MoodMaskError::camera(format!("failed to capture frame: {:?}", e)))?;
        let image = frame
            .decode_image::<RgbAFormat>()
            .map_err(|e| MoodMaskError::camera(format!("failed to decode frame: {:?}", e)))?;

        Ok(RawFrame {
            width: image.width(),
            height: image.height(),
            data: image.into_raw(),
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.camera
            .stop_stream()
            .map_err(|e| MoodMaskError::camera(format!("failed to stop camera stream: {:?}", e)))
    }
}

/// Information about an available camera
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
}

/// Where the capture thread is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStatus {
    Starting,
    Streaming,
    /// Could not open the device. Terminal for this session.
    Failed,
    Stopped,
}

struct SharedCapture {
    /// Triple buffered latest frames
    frames: [Mutex<Option<CameraFrame>>; 3],
    latest_frame_idx: AtomicU64,
    has_frame: AtomicBool,
    running: AtomicBool,
    frame_count: AtomicU64,
    status: Mutex<CaptureStatus>,
    device_name: Mutex<Option<String>>,
    tracks_stopped: AtomicBool,
}

impl SharedCapture {
    fn new() -> Self {
        Self {
            frames: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
            latest_frame_idx: AtomicU64::new(0),
            has_frame: AtomicBool::new(false),
            running: AtomicBool::new(true),
            frame_count: AtomicU64::new(0),
            status: Mutex::new(CaptureStatus::Starting),
            device_name: Mutex::new(None),
            tracks_stopped: AtomicBool::new(false),
        }
    }

    fn set_status(&self, status: CaptureStatus) {
        *self.status.lock() = status;
    }
}

/// Read side of a capture, shareable with worker threads
pub trait FrameFeed: Send + Sync {
    /// Latest frame if the stream is live and the frame is fresh
    fn playable_frame(&self) -> Option<CameraFrame>;

    /// The source can never produce frames this session
    fn has_failed(&self) -> bool {
        false
    }
}

/// Cloneable read handle onto a [`CameraCapture`]
#[derive(Clone)]
pub struct CaptureFeed {
    shared: Arc<SharedCapture>,
    stale_after: Duration,
}

impl CaptureFeed {
    fn latest_frame(&self) -> Option<CameraFrame> {
        if !self.shared.has_frame.load(Ordering::Acquire) {
            return None;
        }
        let idx = self.shared.latest_frame_idx.load(Ordering::Acquire);
        let slot = (idx % 3) as usize;
        self.shared.frames[slot].lock().clone()
    }
}

impl FrameFeed for CaptureFeed {
    fn playable_frame(&self) -> Option<CameraFrame> {
        if *self.shared.status.lock() != CaptureStatus::Streaming {
            return None;
        }
        self.latest_frame()
            .filter(|frame| frame.age(Instant::now()) <= self.stale_after)
    }

    fn has_failed(&self) -> bool {
        *self.shared.status.lock() == CaptureStatus::Failed
    }
}

/// Camera capture interface
pub struct CameraCapture {
    shared: Arc<SharedCapture>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
    stale_after: Duration,
}

impl CameraCapture {
    /// List available cameras
    pub fn list_cameras() -> Vec<CameraInfo> {
        match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
            Ok(camera_list) => camera_list
                .iter()
                .enumerate()
                .map(|(idx, info)| CameraInfo {
                    index: idx as u32,
                    name: info.human_name().to_string(),
                })
                .collect(),
            Err(e) => {
                log::warn!("Failed to enumerate cameras: {:?}", e);
                Vec::new()
            }
        }
    }

    /// Start capturing from nokhwa camera `camera_index`
    pub fn new(camera_index: u32, width: u32, height: u32, stale_after: Duration) -> Result<Self> {
        Self::with_source(move || NokhwaSource::open(camera_index, width, height), stale_after)
    }

    /// Start capturing from a source built by `open` on the capture thread
    pub fn with_source<F, S>(open: F, stale_after: Duration) -> Result<Self>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
        S: FrameSource,
    {
        let shared = Arc::new(SharedCapture::new());
        let shared_clone = shared.clone();

        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || Self::capture_thread(open, shared_clone))?;

        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
            stale_after,
        })
    }

    fn capture_thread<F, S>(open: F, shared: Arc<SharedCapture>)
    where
        F: FnOnce() -> Result<S>,
        S: FrameSource,
    {
        log::info!("Starting camera capture thread");

        let mut source = match open() {
            Ok(source) => source,
            Err(e) => {
                // Nothing was opened, so there is nothing to release
                log::error!("Camera unavailable: {}", e);
                shared.set_status(CaptureStatus::Failed);
                shared.tracks_stopped.store(true, Ordering::Release);
                shared.running.store(false, Ordering::Release);
                return;
            }
        };

        *shared.device_name.lock() = Some(source.name());
        shared.set_status(CaptureStatus::Streaming);

        let mut write_idx: u64 = 0;

        while shared.running.load(Ordering::Acquire) {
            match source.next_frame() {
                Ok(raw) => {
                    let frame_number = shared.frame_count.fetch_add(1, Ordering::Relaxed);
                    let frame = CameraFrame {
                        data: raw.data,
                        width: raw.width,
                        height: raw.height,
                        frame_number,
                        timestamp: Instant::now(),
                    };

                    let slot = (write_idx % 3) as usize;
                    *shared.frames[slot].lock() = Some(frame);
                    shared.latest_frame_idx.store(write_idx, Ordering::Release);
                    shared.has_frame.store(true, Ordering::Release);
                    write_idx = write_idx.wrapping_add(1);
                }
                Err(e) => {
                    log::warn!("{}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        match source.stop() {
            Ok(()) => {
                shared.tracks_stopped.store(true, Ordering::Release);
                log::info!("Camera stream stopped");
            }
            Err(e) => log::error!("{}", e),
        }
        shared.set_status(CaptureStatus::Stopped);

        log::info!("Camera capture thread stopped");
    }

    /// Read handle for the render loop and the detector
    pub fn feed(&self) -> CaptureFeed {
        CaptureFeed {
            shared: self.shared.clone(),
            stale_after: self.stale_after,
        }
    }

    /// Get the latest captured frame
    pub fn latest_frame(&self) -> Option<CameraFrame> {
        self.feed().latest_frame()
    }

    pub fn status(&self) -> CaptureStatus {
        *self.shared.status.lock()
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.device_name.lock().clone()
    }

    /// Streaming, with a frame younger than the stale limit
    pub fn is_playable(&self) -> bool {
        self.feed().playable_frame().is_some()
    }

    /// Whether the device stream has been released
    pub fn tracks_stopped(&self) -> bool {
        self.shared.tracks_stopped.load(Ordering::Acquire)
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Relaxed)
    }

    /// Stop capturing and release the camera. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Camera capture thread panicked");
            }
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        stopped: Arc<AtomicBool>,
        width: u32,
        height: u32,
    }

    impl FrameSource for FakeSource {
        fn name(&self) -> String {
            "Fake Camera".to_string()
        }

        fn next_frame(&mut self) -> Result<RawFrame> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(RawFrame {
                data: vec![128; (self.width * self.height * 4) as usize],
                width: self.width,
                height: self.height,
            })
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn fake_capture(stopped: Arc<AtomicBool>) -> CameraCapture {
        CameraCapture::with_source(
            move || {
                Ok(FakeSource {
                    stopped,
                    width: 8,
                    height: 6,
                })
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frames_become_playable() {
        let stopped = Arc::new(AtomicBool::new(false));
        let capture = fake_capture(stopped);

        assert!(wait_for(|| capture.is_playable()));
        assert!(!capture.feed().has_failed());
        let frame = capture.latest_frame().unwrap();
        assert_eq!((frame.width, frame.height), (8, 6));
        assert_eq!(capture.device_name().as_deref(), Some("Fake Camera"));
    }

    #[test]
    fn test_stop_releases_device() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut capture = fake_capture(stopped.clone());
        assert!(wait_for(|| capture.frame_count() > 0));

        capture.stop();
        assert!(stopped.load(Ordering::Acquire));
        assert!(capture.tracks_stopped());
        assert_eq!(capture.status(), CaptureStatus::Stopped);
        assert!(!capture.is_playable());

        // Second stop is a no-op
        capture.stop();
    }

    #[test]
    fn test_drop_releases_device() {
        let stopped = Arc::new(AtomicBool::new(false));
        {
            let capture = fake_capture(stopped.clone());
            assert!(wait_for(|| capture.frame_count() > 0));
        }
        assert!(stopped.load(Ordering::Acquire));
    }

    #[test]
    fn test_open_failure_is_terminal() {
        let capture = CameraCapture::with_source(
            || -> Result<FakeSource> { Err(MoodMaskError::camera("permission denied")) },
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(wait_for(|| capture.status() == CaptureStatus::Failed));
        assert!(capture.latest_frame().is_none());
        assert!(!capture.is_playable());
        assert!(capture.feed().has_failed());
    }

    /// Delivers a single frame, then the device goes quiet
    struct OneShotSource {
        sent: bool,
    }

    impl FrameSource for OneShotSource {
        fn name(&self) -> String {
            "One Shot".to_string()
        }

        fn next_frame(&mut self) -> Result<RawFrame> {
            if self.sent {
                std::thread::sleep(Duration::from_millis(20));
                return Err(MoodMaskError::camera("no frame"));
            }
            self.sent = true;
            Ok(RawFrame {
                data: vec![64; 4 * 4 * 4],
                width: 4,
                height: 4,
            })
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stale_frames_are_not_playable() {
        let mut capture = CameraCapture::with_source(
            || Ok(OneShotSource { sent: false }),
            Duration::from_millis(50),
        )
        .unwrap();
        let feed = capture.feed();

        assert!(wait_for(|| capture.frame_count() == 1));
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(capture.status(), CaptureStatus::Streaming);
        assert!(capture.latest_frame().is_some());
        assert!(!capture.is_playable());
        assert!(feed.playable_frame().is_none());

        capture.stop();
        assert_eq!(capture.status(), CaptureStatus::Stopped);
        assert!(capture.latest_frame().is_some());
        assert!(feed.playable_frame().is_none());
    }

    #[test]
    fn test_downscale_picks_nearest_pixels() {
        let mut data = vec![0u8; 4 * 4 * 4];
        // Top-left pixel red
        data[0] = 255;
        let frame = CameraFrame {
            data,
            width: 4,
            height: 4,
            frame_number: 0,
            timestamp: Instant::now(),
        };
        let small = frame.downscale(2, 2);
        assert_eq!(small.len(), 2 * 2 * 4);
        assert_eq!(small[0], 255);
        assert_eq!(small[4], 0);
        assert!(frame.to_rgba_image().is_some());
    }
}
