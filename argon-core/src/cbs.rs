//! Coded-bitstream helper interface
//!
//! Some encoder families emit SPS headers with missing or wrong VUI
//! parameters, and clients cannot decode the stream without them. The host
//! links a bitstream rewriter (FFmpeg's cbs in practice) behind this trait;
//! the encode session only needs the old/new byte pairs to seed its packet
//! replacement table.

use ffmpeg_next::codec;

use crate::error::Result;

/// A parameter-set NAL unit as the encoder emitted it (`old`) and as it must
/// reach the client (`new`, with corrected VUI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalPair {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// SPS and VPS rewrites extracted from an HEVC IDR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcHeaders {
    pub sps: NalPair,
    pub vps: NalPair,
}

/// External bitstream inspection and rewriting, consulted once per session on
/// the first keyframe and once per probe.
pub trait CodedBitstream: Send + Sync {
    /// Extract the SPS from an H.264 IDR packet and rebuild it with the VUI
    /// the codec context declares.
    fn make_sps_h264(&self, ctx: &codec::Context, packet: &ffmpeg_next::Packet)
        -> Result<NalPair>;

    /// Extract SPS and VPS from an HEVC IDR packet, rebuilt the same way.
    fn make_sps_hevc(
        &self,
        ctx: &codec::Context,
        packet: &ffmpeg_next::Packet,
    ) -> Result<HevcHeaders>;

    /// True if the payload's SPS already carries valid VUI parameters for the
    /// given codec.
    fn validate_sps(&self, payload: &[u8], codec: codec::Id) -> bool;
}
