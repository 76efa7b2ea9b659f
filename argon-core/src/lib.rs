//! Argon Core Library
//!
//! The capture-and-encode core of a low-latency screen-streaming host for
//! Moonlight-style clients.
//!
//! This library provides:
//! - Encoder family probing (NVENC, AMD VCE, VA-API, software x264/x265)
//! - Encode sessions with on-demand keyframes and SPS/VPS header rewriting
//! - A multi-consumer async capture pipeline for system-memory encoders
//! - A multiplexed sync capture pipeline for hardware-surface encoders
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌───────────────┐    ┌──────────────────┐
//! │ Display Backend │───▶│ Scaler/Upload │───▶│ Encode Session   │
//! │ (platform)      │    │ (sws / GPU)   │    │ (FFmpeg)         │
//! └─────────────────┘    └───────────────┘    │ + packet rewrite │
//!                                             └──────────────────┘
//! ```
//!
//! Transport, input, audio and configuration loading are the host
//! application's problem; they talk to this crate through the narrow traits
//! in [`capture`], [`cbs`] and [`mail`].

pub mod capture;
pub mod cbs;
pub mod config;
pub mod coordinator;
pub mod encode;
pub mod error;
pub mod mail;
pub mod types;

pub use capture::{Display, DisplayBackend, HwDevice, Image, ImageFormat};
pub use cbs::{CodedBitstream, HevcHeaders, NalPair};
pub use config::{HevcMode, SessionConfig, VideoFormat, VideoSettings};
pub use coordinator::VideoCore;
pub use encode::{
    color_matrix, letterbox, make_session, ColorCoding, ColorMatrix, EncodeSession, Encoder,
    EncoderCaps, EncoderDesc, Packet, Replacement, SwScaler,
};
pub use error::{ArgonError, Result};
pub use mail::{Event, Queue, SessionMail, Signal};
pub use types::{CaptureStatus, ChannelTag, IdrRequest, MemType, PixelFormat, TouchPort};
