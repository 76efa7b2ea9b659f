//! Software conversion device
//!
//! CPU fallback used when the chosen encoder has no hardware path for the
//! active display: converts captured BGR0 images to the encoder's YUV format,
//! rescales with aspect preserved, and letterboxes the remainder with black.
//! When the encoder's frame lives in a hardware pool the converted frame is
//! uploaded afterwards.

use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame;
use tracing::{debug, error};

use crate::capture::{HwDevice, Image};
use crate::encode::color::{ColorRange, SwsColorSpace};
use crate::error::{ArgonError, Result};

/// Placement of the scaled picture inside the output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub scaled_width: i32,
    pub scaled_height: i32,
    /// Luma plane offset of the picture origin, in pixels
    pub offset_y: usize,
    /// Chroma plane offset of the picture origin, in pixels
    pub offset_uv: usize,
}

/// Aspect-preserving placement of an `in_w`×`in_h` picture centered in an
/// `out_w`×`out_h` frame.
pub fn letterbox(in_w: i32, in_h: i32, out_w: i32, out_h: i32) -> Letterbox {
    let scalar = (out_w as f32 / in_w as f32).min(out_h as f32 / in_h as f32);

    let scaled_width = (in_w as f32 * scalar) as i32;
    let scaled_height = (in_h as f32 * scalar) as i32;

    // Result is always non-negative
    let x_off = (out_w - scaled_width) / 2;
    let y_off = (out_h - scaled_height) / 2;

    Letterbox {
        scaled_width,
        scaled_height,
        offset_y: (x_off + y_off * out_w) as usize,
        offset_uv: ((x_off + y_off * out_w / 2) / 2) as usize,
    }
}

/// Software scaler bound to one encode session.
pub struct SwScaler {
    in_width: i32,
    in_height: i32,
    sw_format: Pixel,
    /// Frame handed to the encoder; hardware-backed when the session uses a
    /// hardware-frames pool
    target: frame::Video,
    /// CPU staging frame, present when `target` is hardware-backed
    sw_frame: Option<frame::Video>,
    sws: Option<scaling::Context>,
    placement: Letterbox,
}

impl SwScaler {
    /// Create a scaler for a capture source of `in_width`×`in_height` BGR0
    /// converting to `sw_format`. The output geometry comes from the frame
    /// bound later through [`HwDevice::set_frame`].
    pub fn new(in_width: i32, in_height: i32, sw_format: Pixel) -> Self {
        Self {
            in_width,
            in_height,
            sw_format,
            target: frame::Video::empty(),
            sw_frame: None,
            sws: None,
            placement: Letterbox {
                scaled_width: 0,
                scaled_height: 0,
                offset_y: 0,
                offset_uv: 0,
            },
        }
    }

    fn target_is_hw(&self) -> bool {
        unsafe { !(*self.target.as_ptr()).hw_frames_ctx.is_null() }
    }

    /// Fill the CPU-visible frame with black so letterbox bars never decode
    /// to garbage.
    fn prefill(&mut self) -> Result<()> {
        let cpu = self.sw_frame.as_mut().unwrap_or(&mut self.target);
        let width = cpu.width();
        let height = cpu.height();
        let format = cpu.format();

        let mut black = frame::Video::new(Pixel::BGRZ, width, height);
        black.data_mut(0).fill(0);

        let mut sws = scaling::Context::get(
            Pixel::BGRZ,
            width,
            height,
            format,
            width,
            height,
            Flags::LANCZOS | Flags::ACCURATE_RND,
        )
        .map_err(|e| ArgonError::scaler(format!("prefill scaler setup failed: {e}")))?;

        sws.run(&black, cpu)
            .map_err(|e| ArgonError::scaler(format!("prefill conversion failed: {e}")))?;

        Ok(())
    }
}

impl HwDevice for SwScaler {
    fn set_frame(&mut self, frame: frame::Video) -> Result<()> {
        self.target = frame;

        if self.target_is_hw() {
            // The encoder's pool owns the surface; conversion goes through a
            // CPU staging frame and is uploaded per frame.
            unsafe {
                let raw = self.target.as_mut_ptr();
                let err = ffi::av_hwframe_get_buffer((*raw).hw_frames_ctx, raw, 0);
                if err < 0 {
                    return Err(ArgonError::scaler(format!(
                        "failed to allocate a hardware surface: {}",
                        ffmpeg_next::Error::from(err)
                    )));
                }
            }
            self.sw_frame = Some(frame::Video::new(
                self.sw_format,
                self.target.width(),
                self.target.height(),
            ));
        } else {
            let err = unsafe { ffi::av_frame_get_buffer(self.target.as_mut_ptr(), 0) };
            if err < 0 {
                return Err(ArgonError::scaler(format!(
                    "failed to allocate the output frame: {}",
                    ffmpeg_next::Error::from(err)
                )));
            }
        }

        self.prefill()?;

        let out_w = self.target.width() as i32;
        let out_h = self.target.height() as i32;
        self.placement = letterbox(self.in_width, self.in_height, out_w, out_h);

        debug!(
            in_w = self.in_width,
            in_h = self.in_height,
            out_w,
            out_h,
            scaled_w = self.placement.scaled_width,
            scaled_h = self.placement.scaled_height,
            "software scaler bound"
        );

        self.sws = Some(
            scaling::Context::get(
                Pixel::BGRZ,
                self.in_width as u32,
                self.in_height as u32,
                self.sw_format,
                self.placement.scaled_width as u32,
                self.placement.scaled_height as u32,
                Flags::LANCZOS | Flags::ACCURATE_RND,
            )
            .map_err(|e| ArgonError::scaler(format!("scaler setup failed: {e}")))?,
        );

        Ok(())
    }

    fn set_colorspace(&mut self, space: SwsColorSpace, range: ColorRange) -> Result<()> {
        let Some(sws) = self.sws.as_mut() else {
            return Err(ArgonError::scaler("set_colorspace before set_frame"));
        };

        unsafe {
            ffi::sws_setColorspaceDetails(
                sws.as_mut_ptr(),
                ffi::sws_getCoefficients(ffi::SWS_CS_DEFAULT as i32),
                0,
                ffi::sws_getCoefficients(space.index()),
                range.sws_range(),
                0,
                1 << 16,
                1 << 16,
            );
        }

        Ok(())
    }

    fn convert(&mut self, img: &Image) -> Result<()> {
        let Some(sws) = self.sws.as_mut() else {
            return Err(ArgonError::scaler("convert before set_frame"));
        };

        let semi_planar = self.sw_format == Pixel::NV12 || self.sw_format == Pixel::P010LE;
        let offset_y = self.placement.offset_y;
        let offset_uv = self.placement.offset_uv;

        let cpu = self.sw_frame.as_mut().unwrap_or(&mut self.target);

        let ret = unsafe {
            let raw = cpu.as_mut_ptr();
            if ffi::av_frame_make_writable(raw) < 0 {
                return Err(ArgonError::scaler("output frame is not writable"));
            }

            let mut dst: [*mut u8; 4] = [std::ptr::null_mut(); 4];
            dst[0] = (*raw).data[0].add(offset_y);
            dst[1] = (*raw).data[1].add(offset_uv);
            if !semi_planar {
                dst[2] = (*raw).data[2].add(offset_uv);
            }

            let src: [*const u8; 4] = [img.data.as_ptr(), std::ptr::null(), std::ptr::null(), std::ptr::null()];
            let src_stride: [libc::c_int; 4] = [img.row_pitch, 0, 0, 0];

            ffi::sws_scale(
                sws.as_mut_ptr(),
                src.as_ptr(),
                src_stride.as_ptr(),
                0,
                img.height,
                dst.as_ptr(),
                (*raw).linesize.as_ptr(),
            )
        };

        if ret <= 0 {
            error!("couldn't convert image to required format and/or size");
            return Err(ArgonError::scaler("conversion failed"));
        }

        // The frame still has to travel from main memory to the device pool
        if let Some(sw) = &self.sw_frame {
            let status =
                unsafe { ffi::av_hwframe_transfer_data(self.target.as_mut_ptr(), sw.as_ptr(), 0) };
            if status < 0 {
                let err = ffmpeg_next::Error::from(status);
                error!(%err, "failed to transfer image data to hardware frame");
                return Err(ArgonError::scaler(format!(
                    "hardware frame upload failed: {err}"
                )));
            }
        }

        Ok(())
    }

    fn frame_mut(&mut self) -> &mut frame::Video {
        &mut self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_matching_aspect() {
        let lb = letterbox(1920, 1080, 1920, 1080);
        assert_eq!(lb.scaled_width, 1920);
        assert_eq!(lb.scaled_height, 1080);
        assert_eq!(lb.offset_y, 0);
        assert_eq!(lb.offset_uv, 0);
    }

    #[test]
    fn test_letterbox_wider_source() {
        // 21:9 source into a 16:9 frame: bars above and below
        let lb = letterbox(3440, 1440, 1920, 1080);
        assert_eq!(lb.scaled_width, 1920);
        assert!(lb.scaled_height < 1080);
        let y_off = (1080 - lb.scaled_height) / 2;
        assert_eq!(lb.offset_y, (y_off * 1920) as usize);
        assert_eq!(lb.offset_uv, ((y_off * 1920 / 2) / 2) as usize);
    }

    #[test]
    fn test_letterbox_taller_source() {
        // 4:3 source into a 16:9 frame: pillarbox bars left and right
        let lb = letterbox(1600, 1200, 1920, 1080);
        assert_eq!(lb.scaled_height, 1080);
        assert!(lb.scaled_width < 1920);
        let x_off = (1920 - lb.scaled_width) / 2;
        assert_eq!(lb.offset_y, x_off as usize);
        assert_eq!(lb.offset_uv, (x_off / 2) as usize);
    }

    #[test]
    fn test_letterbox_upscale() {
        let lb = letterbox(1280, 720, 2560, 1440);
        assert_eq!(lb.scaled_width, 2560);
        assert_eq!(lb.scaled_height, 1440);
        assert_eq!(lb.offset_y, 0);
    }
}
