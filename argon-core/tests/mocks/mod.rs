//! Mock infrastructure for testing
//!
//! A scriptable display back-end and a stub bitstream helper so the capture
//! and encode paths can run without real capture hardware.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argon_core::capture::{Display, DisplayBackend, HwDevice};
use argon_core::cbs::{CodedBitstream, HevcHeaders, NalPair};
use argon_core::config::{SessionConfig, VideoFormat};
use argon_core::types::{CaptureStatus, MemType, PixelFormat};
use argon_core::{Image, ImageFormat, Result};

/// Display returning solid frames, with an optional status script.
pub struct MockDisplay {
    pub w: i32,
    pub h: i32,
    script: Mutex<VecDeque<CaptureStatus>>,
    frames: AtomicUsize,
}

impl MockDisplay {
    pub fn new(w: i32, h: i32) -> Arc<Self> {
        Self::scripted(w, h, Vec::new())
    }

    pub fn scripted(w: i32, h: i32, script: Vec<CaptureStatus>) -> Arc<Self> {
        Arc::new(Self {
            w,
            h,
            script: Mutex::new(script.into()),
            frames: AtomicUsize::new(0),
        })
    }

    pub fn frames_served(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl Display for MockDisplay {
    fn snapshot(&self, img: &mut Image, _timeout: Duration, _show_cursor: bool) -> CaptureStatus {
        let status = self.script.lock().pop_front().unwrap_or(CaptureStatus::Ok);
        if status == CaptureStatus::Ok {
            let n = self.frames.fetch_add(1, Ordering::SeqCst);
            img.data.fill((n % 251) as u8);
        }
        status
    }

    fn alloc_img(&self) -> Image {
        Image {
            data: vec![0; (self.w * 4 * self.h) as usize],
            width: self.w,
            height: self.h,
            row_pitch: self.w * 4,
            format: ImageFormat::Bgr0,
            display: None,
        }
    }

    fn dummy_img(&self, img: &mut Image) -> Result<()> {
        img.data.fill(0x80);
        Ok(())
    }

    fn make_hwdevice(&self, _pix_fmt: PixelFormat) -> Result<Option<Box<dyn HwDevice>>> {
        // No hardware path; sessions fall back to the software scaler
        Ok(None)
    }

    fn width(&self) -> i32 {
        self.w
    }
    fn height(&self) -> i32 {
        self.h
    }
    fn offset_x(&self) -> i32 {
        0
    }
    fn offset_y(&self) -> i32 {
        0
    }
    fn env_width(&self) -> i32 {
        self.w
    }
    fn env_height(&self) -> i32 {
        self.h
    }
}

/// Back-end handing out mock displays, scripted ones first.
pub struct MockBackend {
    w: i32,
    h: i32,
    displays: Mutex<VecDeque<Arc<MockDisplay>>>,
    pub opened: AtomicUsize,
}

impl MockBackend {
    pub fn new(w: i32, h: i32) -> Arc<Self> {
        Arc::new(Self {
            w,
            h,
            displays: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn push_display(&self, display: Arc<MockDisplay>) {
        self.displays.lock().push_back(display);
    }
}

impl DisplayBackend for MockBackend {
    fn open(&self, _mem_type: MemType) -> Option<Arc<dyn Display>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let display = self
            .displays
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockDisplay::new(self.w, self.h));
        Some(display)
    }
}

/// Bitstream helper that reports valid VUI and returns fixed rewrite pairs.
pub struct StubCbs {
    pub vui_valid: bool,
}

impl StubCbs {
    pub fn new() -> Self {
        Self { vui_valid: true }
    }
}

impl Default for StubCbs {
    fn default() -> Self {
        Self::new()
    }
}

impl CodedBitstream for StubCbs {
    fn make_sps_h264(
        &self,
        _ctx: &ffmpeg_next::codec::Context,
        _packet: &ffmpeg_next::Packet,
    ) -> Result<NalPair> {
        Ok(NalPair {
            old: vec![0x67, 0x64, 0x00],
            new: vec![0x67, 0x64, 0x00, 0x2a],
        })
    }

    fn make_sps_hevc(
        &self,
        _ctx: &ffmpeg_next::codec::Context,
        _packet: &ffmpeg_next::Packet,
    ) -> Result<HevcHeaders> {
        Ok(HevcHeaders {
            sps: NalPair {
                old: vec![0x42, 0x01],
                new: vec![0x42, 0x01, 0x2a],
            },
            vps: NalPair {
                old: vec![0x40, 0x01],
                new: vec![0x40, 0x01, 0x2a],
            },
        })
    }

    fn validate_sps(&self, _payload: &[u8], _codec: ffmpeg_next::codec::Id) -> bool {
        self.vui_valid
    }
}

/// A 1080p60 H.264 SDR session config, the common test case.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        width: 1920,
        height: 1080,
        framerate: 60,
        bitrate: 5000,
        slices_per_frame: 1,
        num_ref_frames: 1,
        encoder_csc_mode: 2,
        video_format: VideoFormat::H264,
        dynamic_range: false,
    }
}
