//! Display capture interface and the two capture pipelines
//!
//! This module defines the narrow seam between the platform capture
//! back-ends and the encode core:
//! - [`Display`] / [`DisplayBackend`] — what a capture source must provide
//! - [`Image`] — a captured frame moving through a pipeline
//! - [`HwDevice`] — the conversion device that turns an image into the
//!   encoder's input frame (hardware, or the software scaler)
//!
//! The pipelines themselves live in [`async_pipeline`] (system-memory
//! encoders, one producer thread fanning out to per-session consumers) and
//! [`sync_pipeline`] (hardware-surface encoders, all sessions multiplexed on
//! the capture thread).

pub mod async_pipeline;
pub mod sync_pipeline;

use std::sync::Arc;
use std::time::Duration;

use ffmpeg_next::util::frame;
use tracing::warn;

use crate::config::{SessionConfig, VideoSettings};
use crate::encode::color::{ColorRange, SwsColorSpace};
use crate::encode::hw::HwDeviceCtx;
use crate::error::Result;
use crate::types::{CaptureStatus, DeviceType, MemType, PixelFormat, TouchPort};

/// Pixel layout of a captured image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// 32-bit BGRX, alpha byte ignored
    Bgr0,
    /// 32-bit BGRA
    Bgra,
}

/// A captured display frame.
///
/// Images keep a strong reference to their originating display: a display is
/// not reopened while any image derived from it is still in flight, which the
/// async producer relies on during reinitialization.
pub struct Image {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Bytes per row, including padding
    pub row_pitch: i32,
    pub format: ImageFormat,
    pub display: Option<Arc<dyn Display>>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_pitch", &self.row_pitch)
            .field("format", &self.format)
            .finish()
    }
}

/// Platform handle a display-provided conversion device exposes to the
/// hardware device-context factories.
#[derive(Clone, Copy)]
pub enum DeviceHandle {
    /// No platform handle; the session falls back to software conversion
    None,
    /// Raw `ID3D11Device` pointer from a DXGI display
    #[cfg(windows)]
    D3d11(*mut std::ffi::c_void),
    /// Display-owned FFmpeg device-context factory (EGL-backed VA-API)
    Ffmpeg(fn(&VideoSettings) -> Result<HwDeviceCtx>),
}

/// Conversion device bound to one encode session.
///
/// Either furnished by the display (GPU color conversion into a hardware
/// surface) or the crate's own [`SwScaler`](crate::encode::SwScaler).
pub trait HwDevice: Send {
    /// Convert a captured image into the bound output frame.
    fn convert(&mut self, img: &Image) -> Result<()>;

    /// Bind the encoder's output frame. For hardware devices the frame
    /// carries the encoder's hardware-frames pool; the device allocates the
    /// surface from it.
    fn set_frame(&mut self, frame: frame::Video) -> Result<()>;

    /// Configure the input-to-output color matrices.
    fn set_colorspace(&mut self, space: SwsColorSpace, range: ColorRange) -> Result<()>;

    /// The frame handed to the encoder each call.
    fn frame_mut(&mut self) -> &mut frame::Video;

    /// Platform payload for the hardware device-context factories.
    fn handle(&self) -> DeviceHandle {
        DeviceHandle::None
    }
}

/// A platform capture source.
pub trait Display: Send + Sync {
    /// Capture the next frame into `img`, blocking up to `timeout`.
    fn snapshot(&self, img: &mut Image, timeout: Duration, show_cursor: bool) -> CaptureStatus;

    /// Allocate an image sized for this display.
    fn alloc_img(&self) -> Image;

    /// Fill an image with a neutral pattern, used for encoder probing.
    fn dummy_img(&self, img: &mut Image) -> Result<()>;

    /// Build a conversion device targeting `pix_fmt`. `Ok(None)` means the
    /// display has no hardware path and the session should use the software
    /// scaler.
    fn make_hwdevice(&self, pix_fmt: PixelFormat) -> Result<Option<Box<dyn HwDevice>>>;

    fn width(&self) -> i32;
    fn height(&self) -> i32;
    /// Position of this display inside the combined desktop
    fn offset_x(&self) -> i32;
    fn offset_y(&self) -> i32;
    /// Combined desktop dimensions
    fn env_width(&self) -> i32;
    fn env_height(&self) -> i32;
}

/// Opens platform displays for a given memory domain.
pub trait DisplayBackend: Send + Sync {
    fn open(&self, mem_type: MemType) -> Option<Arc<dyn Display>>;
}

/// Reopen a display after transient loss, with one retry on a 200 ms
/// backoff.
pub(crate) fn reset_display(
    backend: &dyn DisplayBackend,
    dev_type: DeviceType,
) -> Option<Arc<dyn Display>> {
    for attempt in 0..2 {
        if let Some(disp) = backend.open(dev_type.mem_type()) {
            return Some(disp);
        }
        if attempt == 0 {
            std::thread::sleep(Duration::from_millis(200));
        }
    }
    warn!(?dev_type, "display did not come back after reinit");
    None
}

/// Compute the pointer-mapping rectangle for a session on a display.
///
/// `client_scalar` is the reciprocal of the aspect-preserving scale the
/// scaler applies, so the input subsystem can project client coordinates
/// back onto the display.
pub fn make_touch_port(display: &dyn Display, config: &SessionConfig) -> TouchPort {
    let wd = display.width() as f32;
    let hd = display.height() as f32;

    let wt = config.width as f32;
    let ht = config.height as f32;

    let scalar = (wt / wd).min(ht / hd);

    TouchPort {
        offset_x: display.offset_x(),
        offset_y: display.offset_y(),
        width: (scalar * wd) as i32,
        height: (scalar * hd) as i32,
        env_width: display.env_width(),
        env_height: display.env_height(),
        client_scalar: 1.0 / scalar,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Shared fakes for the pipeline unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cbs::{CodedBitstream, HevcHeaders, NalPair};

    pub(crate) struct MockDisplay {
        pub w: i32,
        pub h: i32,
        /// Statuses returned by successive snapshots; empty means `Ok`
        pub script: Mutex<VecDeque<CaptureStatus>>,
        pub frames: AtomicUsize,
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
    }

    impl Display for MockDisplay {
        fn snapshot(
            &self,
            img: &mut Image,
            _timeout: Duration,
            _show_cursor: bool,
        ) -> CaptureStatus {
            let status = self
                .script
                .lock()
                .pop_front()
                .unwrap_or(CaptureStatus::Ok);
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

    pub(crate) struct MockBackend {
        w: i32,
        h: i32,
        /// Scripted displays handed out first, then fresh defaults
        pub displays: Mutex<VecDeque<Arc<MockDisplay>>>,
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

    pub(crate) struct StubCbs;

    impl CodedBitstream for StubCbs {
        fn make_sps_h264(
            &self,
            _ctx: &ffmpeg_next::codec::Context,
            _packet: &ffmpeg_next::Packet,
        ) -> Result<NalPair> {
            Ok(NalPair {
                old: vec![0x67, 0x64],
                new: vec![0x67, 0x64, 0x10],
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
                    new: vec![0x42, 0x01, 0x10],
                },
                vps: NalPair {
                    old: vec![0x40, 0x01],
                    new: vec![0x40, 0x01, 0x10],
                },
            })
        }

        fn validate_sps(&self, _payload: &[u8], _codec: ffmpeg_next::codec::Id) -> bool {
            true
        }
    }
}
