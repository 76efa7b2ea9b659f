//! Video encoding via FFmpeg
//!
//! This module provides:
//! - The encoder family registry and startup capability probe
//! - Encode session construction and the send-frame/receive-packet protocol
//! - The software scaler fallback and color mapping
//! - Hardware device- and frame-context plumbing

pub mod color;
pub mod hw;
pub mod probe;
pub mod registry;
pub mod scaler;
pub mod session;

pub use color::{color_matrix, map_csc, ColorCoding, ColorMapping, ColorMatrix, ColorRange, SwsColorSpace};
pub use hw::{map_pix_fmt, HwDeviceCtx};
pub use probe::ValidateFlags;
pub use registry::{
    CodecCapabilities, CodecDesc, Encoder, EncoderCaps, EncoderDesc, EncoderFlags, EncoderOption,
    OptionValue, ProfileTriple,
};
pub use scaler::{letterbox, Letterbox, SwScaler};
pub use session::{make_session, EncodeSession, Packet, Replacement, ReplacementTable};
