//! Encoder family registry
//!
//! Each supported encoder family is declared once as an immutable
//! [`EncoderDesc`]; the probe fills a separate mutable
//! [`CodecCapabilities`] record per codec at startup. Families are listed in
//! preference order with software as the final fallback.

use ffmpeg_next::format::Pixel;

use crate::capture::DeviceHandle;
use crate::config::{VideoFormat, VideoSettings};
use crate::encode::hw::HwDeviceCtx;
use crate::error::Result;
use crate::types::DeviceType;

/// avcodec profile constants for the families that use FFmpeg's numbering
mod profile {
    pub const H264_HIGH: i32 = 100;
    pub const HEVC_MAIN: i32 = 1;
    pub const HEVC_MAIN_10: i32 = 2;
}

/// NVENC's private profile numbering
#[cfg(windows)]
mod nv_profile {
    pub const H264_HIGH: i32 = 2;
    pub const HEVC_MAIN: i32 = 0;
    pub const HEVC_MAIN_10: i32 = 1;
}

/// Value of a fixed encoder option. The `*Ref` variants read the host video
/// settings at session-build time.
pub enum OptionValue {
    Int(i64),
    IntRef(fn(&VideoSettings) -> i64),
    /// Skipped when the accessor returns `None`
    OptionalIntRef(fn(&VideoSettings) -> Option<i64>),
    Str(&'static str),
    /// Skipped when the accessor returns an empty string
    StrRef(fn(&VideoSettings) -> &str),
}

/// A named option handed to the encoder's option dictionary.
pub struct EncoderOption {
    pub name: &'static str,
    pub value: OptionValue,
}

/// Per-codec half of an encoder family declaration.
pub struct CodecDesc {
    /// Back-end codec name, e.g. "h264_nvenc" or "libx265"
    pub name: &'static str,
    pub options: &'static [EncoderOption],
    pub crf: Option<EncoderOption>,
    pub qp: Option<EncoderOption>,
}

/// H.264-high / HEVC-main / HEVC-main-10 profile constants in the back-end's
/// numbering for this family.
#[derive(Debug, Clone, Copy)]
pub struct ProfileTriple {
    pub h264_high: i32,
    pub hevc_main: i32,
    pub hevc_main_10: i32,
}

/// Static behavior flags of an encoder family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderFlags {
    /// Frames must round-trip through CPU memory; sessions attach to the
    /// async pipeline
    pub system_memory: bool,
    /// Family cannot encode HEVC
    pub h264_only: bool,
    /// Encoder cannot express an effectively infinite GOP in 32 bits
    pub limited_gop_size: bool,
}

/// Immutable declaration of an encoder family.
pub struct EncoderDesc {
    pub name: &'static str,
    pub profile: ProfileTriple,
    pub dev_type: DeviceType,
    /// Frame format when surfaces live on the device
    pub dev_pix_fmt: Pixel,
    /// SDR software format
    pub static_pix_fmt: Pixel,
    /// HDR 10-bit software format
    pub dynamic_pix_fmt: Pixel,
    pub hevc: CodecDesc,
    pub h264: CodecDesc,
    pub flags: EncoderFlags,
    /// Builds the FFmpeg hardware device context from a display-provided
    /// handle; `None` for software-only families
    pub make_hwdevice_ctx: Option<fn(&VideoSettings, &DeviceHandle) -> Result<HwDeviceCtx>>,
}

impl EncoderDesc {
    /// The codec half matching a negotiated video format.
    pub fn codec(&self, format: VideoFormat) -> &CodecDesc {
        match format {
            VideoFormat::H264 => &self.h264,
            VideoFormat::Hevc => &self.hevc,
        }
    }

    /// Software pixel format for the session's dynamic range.
    pub fn sw_pix_fmt(&self, dynamic_range: bool) -> Pixel {
        if dynamic_range {
            self.dynamic_pix_fmt
        } else {
            self.static_pix_fmt
        }
    }
}

/// Capability bits for one codec of one family, produced by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecCapabilities {
    /// Codec is usable at all
    pub passed: bool,
    /// Encoder honors an explicit reference-frame limit
    pub ref_frames_restrict: bool,
    /// Encoder can pick its own reference-frame count
    pub ref_frames_autoselect: bool,
    /// Frames may be partitioned into multiple slices
    pub slice: bool,
    /// 10-bit HDR encoding works
    pub dynamic_range: bool,
    /// Emitted SPS already carries valid VUI parameters
    pub vui_parameters: bool,
    /// Payload uses the 4-byte NAL start-code prefix clients expect
    pub nalu_prefix_5b: bool,
}

impl CodecCapabilities {
    /// All bits set; the working assumption while probing.
    pub fn all() -> Self {
        Self {
            passed: true,
            ref_frames_restrict: true,
            ref_frames_autoselect: true,
            slice: true,
            dynamic_range: true,
            vui_parameters: true,
            nalu_prefix_5b: true,
        }
    }

    /// Named bits for capability logging.
    pub fn entries(&self) -> [(&'static str, bool); 7] {
        [
            ("PASSED", self.passed),
            ("REF_FRAMES_RESTRICT", self.ref_frames_restrict),
            ("REF_FRAMES_AUTOSELECT", self.ref_frames_autoselect),
            ("SLICE", self.slice),
            ("DYNAMIC_RANGE", self.dynamic_range),
            ("VUI_PARAMETERS", self.vui_parameters),
            ("NALU_PREFIX_5b", self.nalu_prefix_5b),
        ]
    }
}

/// Probed capabilities for both codecs of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderCaps {
    pub h264: CodecCapabilities,
    pub hevc: CodecCapabilities,
}

impl EncoderCaps {
    pub fn codec(&self, format: VideoFormat) -> &CodecCapabilities {
        match format {
            VideoFormat::H264 => &self.h264,
            VideoFormat::Hevc => &self.hevc,
        }
    }
}

/// An encoder family that survived probing: the static descriptor plus its
/// measured capabilities.
#[derive(Clone, Copy)]
pub struct Encoder {
    pub desc: &'static EncoderDesc,
    pub caps: EncoderCaps,
}

#[cfg(windows)]
pub static NVENC: EncoderDesc = EncoderDesc {
    name: "nvenc",
    profile: ProfileTriple {
        h264_high: nv_profile::H264_HIGH,
        hevc_main: nv_profile::HEVC_MAIN,
        hevc_main_10: nv_profile::HEVC_MAIN_10,
    },
    dev_type: DeviceType::D3d11va,
    dev_pix_fmt: Pixel::D3D11,
    static_pix_fmt: Pixel::NV12,
    dynamic_pix_fmt: Pixel::P010LE,
    hevc: CodecDesc {
        name: "hevc_nvenc",
        options: &[
            EncoderOption { name: "forced-idr", value: OptionValue::Int(1) },
            EncoderOption { name: "zerolatency", value: OptionValue::Int(1) },
            EncoderOption { name: "preset", value: OptionValue::StrRef(|s| s.nv.preset.as_str()) },
            EncoderOption { name: "rc", value: OptionValue::StrRef(|s| s.nv.rc.as_str()) },
        ],
        crf: None,
        qp: None,
    },
    h264: CodecDesc {
        name: "h264_nvenc",
        options: &[
            EncoderOption { name: "forced-idr", value: OptionValue::Int(1) },
            EncoderOption { name: "zerolatency", value: OptionValue::Int(1) },
            EncoderOption { name: "preset", value: OptionValue::StrRef(|s| s.nv.preset.as_str()) },
            EncoderOption { name: "rc", value: OptionValue::StrRef(|s| s.nv.rc.as_str()) },
            EncoderOption { name: "coder", value: OptionValue::StrRef(|s| s.nv.coder.as_str()) },
        ],
        crf: None,
        qp: Some(EncoderOption { name: "qp", value: OptionValue::IntRef(|s| s.qp) }),
    },
    flags: EncoderFlags {
        system_memory: false,
        h264_only: false,
        limited_gop_size: false,
    },
    make_hwdevice_ctx: Some(crate::encode::hw::dxgi_device_ctx),
};

#[cfg(windows)]
pub static AMDVCE: EncoderDesc = EncoderDesc {
    name: "amdvce",
    profile: ProfileTriple {
        h264_high: profile::H264_HIGH,
        hevc_main: profile::HEVC_MAIN,
        hevc_main_10: profile::HEVC_MAIN_10,
    },
    dev_type: DeviceType::D3d11va,
    dev_pix_fmt: Pixel::D3D11,
    static_pix_fmt: Pixel::NV12,
    dynamic_pix_fmt: Pixel::P010LE,
    hevc: CodecDesc {
        name: "hevc_amf",
        options: &[
            EncoderOption { name: "header_insertion_mode", value: OptionValue::Str("idr") },
            EncoderOption { name: "gops_per_idr", value: OptionValue::Int(30) },
            EncoderOption { name: "usage", value: OptionValue::Str("ultralowlatency") },
            EncoderOption { name: "quality", value: OptionValue::StrRef(|s| s.amd.quality.as_str()) },
            EncoderOption { name: "rc", value: OptionValue::StrRef(|s| s.amd.rc.as_str()) },
        ],
        crf: None,
        qp: Some(EncoderOption { name: "qp", value: OptionValue::IntRef(|s| s.qp) }),
    },
    h264: CodecDesc {
        name: "h264_amf",
        options: &[
            EncoderOption { name: "usage", value: OptionValue::Str("ultralowlatency") },
            EncoderOption { name: "quality", value: OptionValue::StrRef(|s| s.amd.quality.as_str()) },
            EncoderOption { name: "rc", value: OptionValue::StrRef(|s| s.amd.rc.as_str()) },
        ],
        crf: None,
        qp: Some(EncoderOption { name: "qp", value: OptionValue::IntRef(|s| s.qp) }),
    },
    flags: EncoderFlags {
        system_memory: false,
        h264_only: false,
        limited_gop_size: false,
    },
    make_hwdevice_ctx: Some(crate::encode::hw::dxgi_device_ctx),
};

#[cfg(target_os = "linux")]
pub static VAAPI: EncoderDesc = EncoderDesc {
    name: "vaapi",
    profile: ProfileTriple {
        h264_high: profile::H264_HIGH,
        hevc_main: profile::HEVC_MAIN,
        hevc_main_10: profile::HEVC_MAIN_10,
    },
    dev_type: DeviceType::Vaapi,
    dev_pix_fmt: Pixel::VAAPI,
    static_pix_fmt: Pixel::NV12,
    dynamic_pix_fmt: Pixel::YUV420P10LE,
    hevc: CodecDesc {
        name: "hevc_vaapi",
        options: &[
            EncoderOption { name: "sei", value: OptionValue::Int(0) },
            EncoderOption { name: "idr_interval", value: OptionValue::Int(i32::MAX as i64) },
        ],
        crf: None,
        qp: None,
    },
    h264: CodecDesc {
        name: "h264_vaapi",
        options: &[
            EncoderOption { name: "sei", value: OptionValue::Int(0) },
            EncoderOption { name: "idr_interval", value: OptionValue::Int(i32::MAX as i64) },
        ],
        crf: None,
        qp: None,
    },
    flags: EncoderFlags {
        system_memory: true,
        h264_only: false,
        limited_gop_size: true,
    },
    make_hwdevice_ctx: Some(crate::encode::hw::vaapi_device_ctx),
};

pub static SOFTWARE: EncoderDesc = EncoderDesc {
    name: "software",
    profile: ProfileTriple {
        h264_high: profile::H264_HIGH,
        hevc_main: profile::HEVC_MAIN,
        hevc_main_10: profile::HEVC_MAIN_10,
    },
    dev_type: DeviceType::None,
    dev_pix_fmt: Pixel::None,
    static_pix_fmt: Pixel::YUV420P,
    dynamic_pix_fmt: Pixel::YUV420P10LE,
    hevc: CodecDesc {
        name: "libx265",
        // x265's info SEI pushes the IDR slice into the second packet of the
        // frame, which breaks client parsers, and x265 ignores gop_size, so
        // keyint goes in the parameter string.
        options: &[
            EncoderOption { name: "forced-idr", value: OptionValue::Int(1) },
            EncoderOption { name: "x265-params", value: OptionValue::Str("info=0:keyint=-1") },
            EncoderOption { name: "preset", value: OptionValue::StrRef(|s| s.sw.preset.as_str()) },
            EncoderOption { name: "tune", value: OptionValue::StrRef(|s| s.sw.tune.as_str()) },
        ],
        crf: Some(EncoderOption { name: "crf", value: OptionValue::IntRef(|s| s.crf) }),
        qp: Some(EncoderOption { name: "qp", value: OptionValue::IntRef(|s| s.qp) }),
    },
    h264: CodecDesc {
        name: "libx264",
        options: &[
            EncoderOption { name: "preset", value: OptionValue::StrRef(|s| s.sw.preset.as_str()) },
            EncoderOption { name: "tune", value: OptionValue::StrRef(|s| s.sw.tune.as_str()) },
        ],
        crf: Some(EncoderOption { name: "crf", value: OptionValue::IntRef(|s| s.crf) }),
        qp: Some(EncoderOption { name: "qp", value: OptionValue::IntRef(|s| s.qp) }),
    },
    flags: EncoderFlags {
        system_memory: true,
        h264_only: true,
        limited_gop_size: false,
    },
    make_hwdevice_ctx: None,
};

/// Candidate families in probe order, software always last.
pub fn candidates() -> Vec<&'static EncoderDesc> {
    vec![
        #[cfg(windows)]
        &NVENC,
        #[cfg(windows)]
        &AMDVCE,
        #[cfg(target_os = "linux")]
        &VAAPI,
        &SOFTWARE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_is_final_fallback() {
        let list = candidates();
        assert_eq!(list.last().map(|e| e.name), Some("software"));
    }

    #[test]
    fn test_software_flags() {
        assert!(SOFTWARE.flags.system_memory);
        assert!(SOFTWARE.flags.h264_only);
        assert!(!SOFTWARE.flags.limited_gop_size);
        assert!(SOFTWARE.make_hwdevice_ctx.is_none());
    }

    #[test]
    fn test_codec_selection() {
        assert_eq!(SOFTWARE.codec(VideoFormat::H264).name, "libx264");
        assert_eq!(SOFTWARE.codec(VideoFormat::Hevc).name, "libx265");
    }

    #[test]
    fn test_sw_pix_fmt_tracks_dynamic_range() {
        assert_eq!(SOFTWARE.sw_pix_fmt(false), Pixel::YUV420P);
        assert_eq!(SOFTWARE.sw_pix_fmt(true), Pixel::YUV420P10LE);
    }

    #[test]
    fn test_software_has_quality_fallbacks() {
        assert!(SOFTWARE.h264.crf.is_some());
        assert!(SOFTWARE.h264.qp.is_some());
        let settings = VideoSettings::default();
        match &SOFTWARE.h264.qp.as_ref().map(|o| &o.value) {
            Some(OptionValue::IntRef(get)) => assert_eq!(get(&settings), 28),
            _ => panic!("qp should be an int ref"),
        }
    }
}
