//! Core types shared between the capture and encode halves of the pipeline.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Opaque per-session tag attached to every emitted packet so the muxer can
/// route it back to the owning stream.
pub type ChannelTag = Option<Arc<dyn Any + Send + Sync>>;

/// Internal pixel-format tag, mapped to the back-end's format by the encoder
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit planar 4:2:0
    Yuv420p,
    /// 10-bit planar 4:2:0
    Yuv420p10,
    /// 8-bit semi-planar 4:2:0
    Nv12,
    /// 10-bit semi-planar 4:2:0
    P010,
    /// Unrecognized back-end format
    Unknown,
}

/// Memory domain a display back-end captures into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// D3D11 textures (Windows desktop duplication)
    Dxgi,
    /// VA-API surfaces
    Vaapi,
    /// Plain system memory
    System,
    /// Unmapped hardware-device type
    Unknown,
}

/// Hardware device family an encoder descriptor binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Software encoder, frames stay in system memory
    None,
    /// D3D11VA device (Windows)
    D3d11va,
    /// VA-API device (Linux)
    Vaapi,
}

impl DeviceType {
    /// Memory domain a display must capture into for this device family.
    pub fn mem_type(self) -> MemType {
        match self {
            Self::D3d11va => MemType::Dxgi,
            Self::Vaapi => MemType::Vaapi,
            Self::None => MemType::System,
        }
    }
}

/// Outcome of a single display snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// A new frame was written into the image
    Ok,
    /// No frame arrived before the timeout
    Timeout,
    /// The display was lost and must be reopened
    Reinit,
    /// Unrecoverable capture failure
    Error,
}

/// IDR request consumed from the session mailbox: re-anchor the frame counter
/// at `end_frame` and emit a keyframe immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdrRequest {
    pub start_frame: i64,
    pub end_frame: i64,
}

impl IdrRequest {
    /// New frame counter and next scheduled keyframe after consuming this
    /// request: the counter re-anchors at `end_frame` and the following
    /// keyframe lands one second later.
    pub fn schedule(&self, framerate: i32) -> (i64, i64) {
        (self.end_frame, self.end_frame + framerate as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idr_schedule() {
        let request = IdrRequest {
            start_frame: 0,
            end_frame: 120,
        };
        assert_eq!(request.schedule(60), (120, 180));
    }

    #[test]
    fn test_device_type_mem_mapping() {
        assert_eq!(DeviceType::D3d11va.mem_type(), MemType::Dxgi);
        assert_eq!(DeviceType::Vaapi.mem_type(), MemType::Vaapi);
        assert_eq!(DeviceType::None.mem_type(), MemType::System);
    }
}

/// Screen rectangle mapping client pointer coordinates to host coordinates.
///
/// Raised once per sync session start and once per async session (re)init so
/// the input subsystem can translate absolute positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchPort {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: i32,
    pub height: i32,
    pub env_width: i32,
    pub env_height: i32,
    /// Reciprocal of the aspect-preserving scale factor applied by the scaler
    pub client_scalar: f32,
}
