//! FFmpeg hardware device and frame contexts
//!
//! The display back-end hands the core a platform handle; the factories here
//! wrap it into the `AVBufferRef`-based device context the encoder wants, and
//! `hwframe_ctx` binds a dynamically growing surface pool to an encoder
//! context.

use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use std::ptr::NonNull;

use crate::error::{ArgonError, Result};
use crate::types::PixelFormat;

#[cfg(target_os = "linux")]
use crate::capture::DeviceHandle;
#[cfg(target_os = "linux")]
use crate::config::VideoSettings;
#[cfg(target_os = "linux")]
use tracing::error;

/// Owned reference to an FFmpeg hardware device context.
pub struct HwDeviceCtx(NonNull<ffi::AVBufferRef>);

// AVBufferRef refcounting is thread-safe.
unsafe impl Send for HwDeviceCtx {}

impl HwDeviceCtx {
    /// Take ownership of a device-context reference.
    ///
    /// # Safety
    /// `ptr` must be a valid `AVBufferRef` wrapping an `AVHWDeviceContext`,
    /// and the caller's reference is consumed.
    pub unsafe fn from_raw(ptr: *mut ffi::AVBufferRef) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut ffi::AVBufferRef {
        self.0.as_ptr()
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        let mut ptr = self.0.as_ptr();
        unsafe { ffi::av_buffer_unref(&mut ptr) };
    }
}

/// Open a VA-API device context for an encode session.
///
/// A display that already owns an FFmpeg device (the EGL import path) passes
/// its own factory through the handle; otherwise a fresh context is opened on
/// the configured render node, or the driver default.
#[cfg(target_os = "linux")]
pub fn vaapi_device_ctx(settings: &VideoSettings, handle: &DeviceHandle) -> Result<HwDeviceCtx> {
    if let DeviceHandle::Ffmpeg(factory) = handle {
        return factory(settings);
    }

    let render_node = if settings.adapter_name.is_empty() {
        None
    } else {
        Some(
            std::ffi::CString::new(settings.adapter_name.as_str())
                .map_err(|_| ArgonError::config("adapter_name contains a NUL byte"))?,
        )
    };

    let mut buf: *mut ffi::AVBufferRef = std::ptr::null_mut();
    let status = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut buf,
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            render_node
                .as_ref()
                .map_or(std::ptr::null(), |node| node.as_ptr()),
            std::ptr::null_mut(),
            0,
        )
    };
    if status < 0 {
        let err = ffmpeg_next::Error::from(status);
        error!(%err, "failed to create a VAAPI device");
        return Err(ArgonError::encoder(format!(
            "failed to create a VAAPI device: {err}"
        )));
    }

    unsafe { HwDeviceCtx::from_raw(buf) }
        .ok_or_else(|| ArgonError::encoder("VAAPI device context is null"))
}

#[cfg(windows)]
unsafe extern "C" fn do_nothing(_ctx: *mut std::ffi::c_void) {}

/// Wrap the `ID3D11Device` a DXGI display captured with.
///
/// Lock/unlock are no-ops: the capture pipeline serializes all access to the
/// device itself.
#[cfg(windows)]
pub fn dxgi_device_ctx(
    _settings: &crate::config::VideoSettings,
    handle: &crate::capture::DeviceHandle,
) -> Result<HwDeviceCtx> {
    let crate::capture::DeviceHandle::D3d11(device) = *handle else {
        return Err(ArgonError::encoder("display did not provide a D3D11 device"));
    };

    unsafe {
        let buf = ffi::av_hwdevice_ctx_alloc(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA);
        let Some(ctx_buf) = HwDeviceCtx::from_raw(buf) else {
            return Err(ArgonError::encoder("failed to allocate a D3D11VA context"));
        };

        let device_ctx = (*ctx_buf.as_ptr()).data as *mut ffi::AVHWDeviceContext;
        let d3d11 = (*device_ctx).hwctx as *mut ffi::AVD3D11VADeviceContext;
        std::ptr::write_bytes(d3d11, 0, 1);

        (*d3d11).device = device as *mut _;
        (*d3d11).lock_ctx = 1 as *mut _;
        (*d3d11).lock = Some(do_nothing);
        (*d3d11).unlock = Some(do_nothing);

        let err = ffi::av_hwdevice_ctx_init(ctx_buf.as_ptr());
        if err < 0 {
            return Err(ArgonError::encoder(format!(
                "failed to init the D3D11VA device context: {}",
                ffmpeg_next::Error::from(err)
            )));
        }

        Ok(ctx_buf)
    }
}

/// Attach a hardware-frames pool to an encoder context.
///
/// `initial_pool_size = 0` lets the pool grow on demand; the pipelines keep
/// at most a handful of surfaces in flight.
pub(crate) fn hwframe_ctx(
    ctx: *mut ffi::AVCodecContext,
    device: &HwDeviceCtx,
    sw_format: Pixel,
) -> Result<()> {
    unsafe {
        let frame_ref = ffi::av_hwframe_ctx_alloc(device.as_ptr());
        let Some(frame_ref) = HwDeviceCtx::from_raw(frame_ref) else {
            return Err(ArgonError::encoder("failed to allocate a hwframe context"));
        };

        let frames = (*frame_ref.as_ptr()).data as *mut ffi::AVHWFramesContext;
        (*frames).format = (*ctx).pix_fmt;
        (*frames).sw_format = sw_format.into();
        (*frames).width = (*ctx).width;
        (*frames).height = (*ctx).height;
        (*frames).initial_pool_size = 0;

        let err = ffi::av_hwframe_ctx_init(frame_ref.as_ptr());
        if err < 0 {
            return Err(ArgonError::encoder(format!(
                "failed to init the hwframe context: {}",
                ffmpeg_next::Error::from(err)
            )));
        }

        (*ctx).hw_frames_ctx = ffi::av_buffer_ref(frame_ref.as_ptr());
        if (*ctx).hw_frames_ctx.is_null() {
            return Err(ArgonError::encoder("failed to reference the hwframe context"));
        }
    }

    Ok(())
}

/// Map a back-end pixel format to the internal tag displays understand.
pub fn map_pix_fmt(fmt: Pixel) -> PixelFormat {
    match fmt {
        Pixel::YUV420P => PixelFormat::Yuv420p,
        Pixel::YUV420P10LE => PixelFormat::Yuv420p10,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::P010LE => PixelFormat::P010,
        _ => PixelFormat::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_pix_fmt() {
        assert_eq!(map_pix_fmt(Pixel::YUV420P), PixelFormat::Yuv420p);
        assert_eq!(map_pix_fmt(Pixel::YUV420P10LE), PixelFormat::Yuv420p10);
        assert_eq!(map_pix_fmt(Pixel::NV12), PixelFormat::Nv12);
        assert_eq!(map_pix_fmt(Pixel::P010LE), PixelFormat::P010);
        assert_eq!(map_pix_fmt(Pixel::BGRZ), PixelFormat::Unknown);
    }
}
