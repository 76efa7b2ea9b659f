//! Color mode mapping and YUV conversion matrices
//!
//! Maps the client's `encoder_csc_mode` word onto FFmpeg color metadata and
//! the swscale coefficient index, and precomputes the YUV color matrices GPU
//! converters consume.

use ffmpeg_next::util::color;
use tracing::info;

/// Quantization range of the encoded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    /// Limited/studio range (16–235)
    Mpeg,
    /// Full range (0–255)
    Jpeg,
}

impl ColorRange {
    pub fn av(self) -> color::Range {
        match self {
            Self::Mpeg => color::Range::MPEG,
            Self::Jpeg => color::Range::JPEG,
        }
    }

    /// swscale's range flag (0 = limited, 1 = full)
    pub fn sws_range(self) -> i32 {
        match self {
            Self::Mpeg => 0,
            Self::Jpeg => 1,
        }
    }
}

/// swscale coefficient table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwsColorSpace {
    Smpte170m,
    Bt709,
    Bt2020,
}

impl SwsColorSpace {
    /// The SWS_CS_* index swscale expects.
    pub fn index(self) -> i32 {
        match self {
            Self::Bt709 => ffmpeg_next::ffi::SWS_CS_ITU709 as i32,
            Self::Smpte170m => ffmpeg_next::ffi::SWS_CS_SMPTE170M as i32,
            Self::Bt2020 => ffmpeg_next::ffi::SWS_CS_BT2020 as i32,
        }
    }
}

/// Encoder color metadata derived from a session's `encoder_csc_mode`.
#[derive(Debug, Clone, Copy)]
pub struct ColorMapping {
    pub primaries: color::Primaries,
    pub transfer: color::TransferCharacteristic,
    pub space: color::Space,
    pub range: ColorRange,
    pub sws_space: SwsColorSpace,
}

/// Decode `encoder_csc_mode`: bit 0 selects the range, the remaining bits
/// the colorimetry standard.
pub fn map_csc(mode: u32) -> ColorMapping {
    let range = if mode & 0x1 != 0 {
        ColorRange::Jpeg
    } else {
        ColorRange::Mpeg
    };

    let mapping = match mode >> 1 {
        1 => {
            info!("color coding [Rec. 709]");
            ColorMapping {
                primaries: color::Primaries::BT709,
                transfer: color::TransferCharacteristic::BT709,
                space: color::Space::BT709,
                range,
                sws_space: SwsColorSpace::Bt709,
            }
        }
        2 => {
            info!("color coding [Rec. 2020]");
            ColorMapping {
                primaries: color::Primaries::BT2020,
                transfer: color::TransferCharacteristic::BT2020_10,
                space: color::Space::BT2020NCL,
                range,
                sws_space: SwsColorSpace::Bt2020,
            }
        }
        _ => {
            info!("color coding [Rec. 601]");
            ColorMapping {
                primaries: color::Primaries::SMPTE170M,
                transfer: color::TransferCharacteristic::SMPTE170M,
                space: color::Space::SMPTE170M,
                range,
                sws_space: SwsColorSpace::Smpte170m,
            }
        }
    };

    info!(
        "color range [{}]",
        match range {
            ColorRange::Jpeg => "JPEG",
            ColorRange::Mpeg => "MPEG",
        }
    );

    mapping
}

/// The four standard coding/range combinations GPU converters are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorCoding {
    Rec601Mpeg,
    Rec601Jpeg,
    Rec709Mpeg,
    Rec709Jpeg,
}

/// RGB→YUV conversion matrix expanded for a GPU shader: one row per output
/// component plus the scale/shift pair applied after the dot product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix {
    pub y: [f32; 4],
    pub u: [f32; 4],
    pub v: [f32; 4],
    /// (scale, shift) for Y
    pub range_y: [f32; 2],
    /// (scale, shift) for U/V
    pub range_uv: [f32; 2],
}

#[allow(clippy::too_many_arguments)]
fn make_color_matrix(
    cr: f32,
    cb: f32,
    u_max: f32,
    v_max: f32,
    add_y: f32,
    add_uv: f32,
    range_y: [f32; 2],
    range_uv: [f32; 2],
) -> ColorMatrix {
    let cg = 1.0 - cr - cb;

    let cr_i = 1.0 - cr;
    let cb_i = 1.0 - cb;

    let shift_y = range_y[0] / 256.0;
    let shift_uv = range_uv[0] / 256.0;

    let scale_y = (range_y[1] - range_y[0]) / 256.0;
    let scale_uv = (range_uv[1] - range_uv[0]) / 256.0;

    ColorMatrix {
        y: [cr, cg, cb, add_y],
        u: [-(cr * u_max / cb_i), -(cg * u_max / cb_i), u_max, add_uv],
        v: [v_max, -(cg * v_max / cr_i), -(cb * v_max / cr_i), add_uv],
        range_y: [scale_y, shift_y],
        range_uv: [scale_uv, shift_uv],
    }
}

/// Conversion matrix for one of the four canonical coding/range pairs.
pub fn color_matrix(coding: ColorCoding) -> ColorMatrix {
    match coding {
        ColorCoding::Rec601Mpeg => make_color_matrix(
            0.299, 0.114, 0.436, 0.615, 0.0625, 0.5, [16.0, 235.0], [16.0, 240.0],
        ),
        ColorCoding::Rec601Jpeg => {
            make_color_matrix(0.299, 0.114, 0.5, 0.5, 0.0, 0.5, [0.0, 255.0], [0.0, 255.0])
        }
        ColorCoding::Rec709Mpeg => make_color_matrix(
            0.2126, 0.0722, 0.436, 0.615, 0.0625, 0.5, [16.0, 235.0], [16.0, 240.0],
        ),
        ColorCoding::Rec709Jpeg => make_color_matrix(
            0.2126, 0.0722, 0.5, 0.5, 0.0, 0.5, [0.0, 255.0], [0.0, 255.0],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csc_mode_range_bit() {
        assert_eq!(map_csc(0).range, ColorRange::Mpeg);
        assert_eq!(map_csc(1).range, ColorRange::Jpeg);
        assert_eq!(map_csc(2).range, ColorRange::Mpeg);
        assert_eq!(map_csc(3).range, ColorRange::Jpeg);
    }

    #[test]
    fn test_csc_mode_standard_bits() {
        assert_eq!(map_csc(0).sws_space, SwsColorSpace::Smpte170m);
        assert_eq!(map_csc(2).sws_space, SwsColorSpace::Bt709);
        assert_eq!(map_csc(3).sws_space, SwsColorSpace::Bt709);
        assert_eq!(map_csc(4).sws_space, SwsColorSpace::Bt2020);
        // Unknown standards fall back to Rec. 601
        assert_eq!(map_csc(6).sws_space, SwsColorSpace::Smpte170m);
    }

    #[test]
    fn test_sws_range_encoding() {
        assert_eq!(ColorRange::Mpeg.sws_range(), 0);
        assert_eq!(ColorRange::Jpeg.sws_range(), 1);
    }

    #[test]
    fn test_color_matrix_row_sums() {
        // Y coefficients of any standard sum to 1
        for coding in [
            ColorCoding::Rec601Mpeg,
            ColorCoding::Rec601Jpeg,
            ColorCoding::Rec709Mpeg,
            ColorCoding::Rec709Jpeg,
        ] {
            let m = color_matrix(coding);
            let sum: f32 = m.y[..3].iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "{coding:?}: {sum}");
            // Chroma offset is always mid-scale
            assert_eq!(m.u[3], 0.5);
            assert_eq!(m.v[3], 0.5);
        }
    }

    #[test]
    fn test_color_matrix_ranges() {
        let mpeg = color_matrix(ColorCoding::Rec709Mpeg);
        assert!((mpeg.range_y[0] - (235.0 - 16.0) / 256.0).abs() < 1e-6);
        assert!((mpeg.range_y[1] - 16.0 / 256.0).abs() < 1e-6);

        let jpeg = color_matrix(ColorCoding::Rec709Jpeg);
        assert!((jpeg.range_y[0] - 255.0 / 256.0).abs() < 1e-6);
        assert_eq!(jpeg.range_y[1], 0.0);
        assert_eq!(jpeg.range_uv, jpeg.range_y);
    }
}
