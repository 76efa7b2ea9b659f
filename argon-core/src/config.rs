//! Configuration types for Argon
//!
//! `VideoSettings` carries the host-wide tuning knobs the encoder registry
//! reads; `SessionConfig` is the per-stream negotiation result handed to the
//! control surface by the RTSP layer. Loading these from disk is the host
//! application's job — this crate only consumes them.

use serde::{Deserialize, Serialize};

/// Video codec negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// H.264 / AVC (most compatible)
    #[default]
    H264,
    /// H.265 / HEVC (better compression)
    Hevc,
}

impl VideoFormat {
    /// Wire value used by the client protocol (0 = H.264, 1 = HEVC)
    pub fn index(self) -> i64 {
        match self {
            Self::H264 => 0,
            Self::Hevc => 1,
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::Hevc => write!(f, "HEVC"),
        }
    }
}

/// HEVC negotiation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HevcMode {
    /// Resolve from the probed encoder capabilities
    #[default]
    Auto,
    /// Advertise H.264 only
    H264Only,
    /// Allow HEVC for SDR streams
    HevcSdr,
    /// Require HEVC with HDR support
    HevcHdr,
}

/// NVENC pass-through options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NvSettings {
    pub preset: String,
    pub rc: String,
    pub coder: String,
}

impl Default for NvSettings {
    fn default() -> Self {
        Self {
            preset: "llhq".into(),
            rc: "cbr_ld_hq".into(),
            coder: String::new(),
        }
    }
}

/// AMD VCE pass-through options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmdSettings {
    pub quality: String,
    pub rc: String,
}

impl Default for AmdSettings {
    fn default() -> Self {
        Self {
            quality: "balanced".into(),
            rc: "vbr_latency".into(),
        }
    }
}

/// libx264/libx265 pass-through options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwSettings {
    pub preset: String,
    pub tune: String,
}

impl Default for SwSettings {
    fn default() -> Self {
        Self {
            preset: "superfast".into(),
            tune: "zerolatency".into(),
        }
    }
}

/// Host-wide encoder tuning, read-only for this crate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Pin the encoder family by name; empty selects the first family that
    /// survives probing
    pub encoder: String,
    /// HEVC negotiation policy
    pub hevc_mode: HevcMode,
    /// Constant quantization parameter, used when the bitrate is too low for
    /// CBR and the encoder has no CRF
    pub qp: i64,
    /// Constant rate factor; 0 leaves it unset
    pub crf: i64,
    /// Lower bound on software slice count, for encode parallelism
    pub min_threads: i64,
    /// VA-API render node override (e.g. /dev/dri/renderD129)
    pub adapter_name: String,
    pub nv: NvSettings,
    pub amd: AmdSettings,
    pub sw: SwSettings,
    /// Always rewrite SPS/VPS headers, even when the encoder's VUI looks valid
    pub force_video_header_replace: bool,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            encoder: String::new(),
            hevc_mode: HevcMode::Auto,
            qp: 28,
            crf: 0,
            min_threads: 1,
            adapter_name: String::new(),
            nv: NvSettings::default(),
            amd: AmdSettings::default(),
            sw: SwSettings::default(),
            force_video_header_replace: false,
        }
    }
}

/// Per-session stream parameters negotiated with the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output width in pixels
    pub width: i32,
    /// Output height in pixels
    pub height: i32,
    /// Target framerate
    pub framerate: i32,
    /// Target bitrate in kbps; ≤ 500 falls back to CRF/QP
    pub bitrate: i32,
    /// Requested slices per frame
    pub slices_per_frame: i32,
    /// Client decoder's reference-frame limit; 0 lets the encoder choose
    pub num_ref_frames: i32,
    /// Bit 0: range (0 = MPEG/limited, 1 = JPEG/full); bits 1..: colorspace
    /// (0 = Rec.601, 1 = Rec.709, 2 = Rec.2020)
    pub encoder_csc_mode: u32,
    /// Negotiated codec
    pub video_format: VideoFormat,
    /// true = HDR (10-bit dynamic pixel format)
    pub dynamic_range: bool,
}

impl SessionConfig {
    /// Frame interval for this session's framerate
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.framerate.max(1) as u32
    }
}
