//! Encode session construction and the per-frame encode protocol

use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::ffi;
use ffmpeg_next::util::{frame, picture};
use ffmpeg_next::{Dictionary, Rational};
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::capture::{DeviceHandle, HwDevice, Image};
use crate::cbs::CodedBitstream;
use crate::config::{SessionConfig, VideoFormat, VideoSettings};
use crate::encode::color::map_csc;
use crate::encode::registry::{CodecCapabilities, Encoder, EncoderOption, OptionValue};
use crate::encode::scaler::SwScaler;
use crate::encode::hw;
use crate::error::{ArgonError, Result};
use crate::mail::Queue;
use crate::types::{ChannelTag, DeviceType};

/// 4-byte start code plus the IDR-slice NAL type byte clients search for.
pub(crate) const H264_NALU: [u8; 5] = [0, 0, 0, 1, 0x65];
pub(crate) const HEVC_NALU: [u8; 5] = [0, 0, 0, 1, 0x28];

// AV_FRAME_FLAG_KEY; kept local, the constant moved headers across FFmpeg
// major versions.
const FRAME_FLAG_KEY: i32 = 1 << 1;

/// A byte-range rewrite the muxer applies to every packet of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Shared, read-mostly rewrite table. Outlives every packet that references
/// it; entries are appended before the first packet referencing them is
/// pushed.
pub type ReplacementTable = Arc<RwLock<Vec<Replacement>>>;

/// One encoded bitstream chunk on its way to the muxer.
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: i64,
    pub keyframe: bool,
    pub replacements: ReplacementTable,
    pub channel: ChannelTag,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pts", &self.pts)
            .field("size", &self.data.len())
            .field("keyframe", &self.keyframe)
            .finish()
    }
}

/// Pending one-shot SPS/VPS extraction, armed at session build when the
/// encoder's VUI is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inject {
    None,
    H264,
    Hevc,
}

/// Which headers need rewriting for this session.
pub(crate) fn inject_mode(vui_parameters: bool, format: VideoFormat) -> Inject {
    if vui_parameters {
        Inject::None
    } else {
        match format {
            VideoFormat::H264 => Inject::H264,
            VideoFormat::Hevc => Inject::Hevc,
        }
    }
}

/// Reference-frame count for the encoder context.
///
/// Clients with restricted decoders ask for an explicit limit; everyone else
/// gets the encoder's own choice, or the codec maximum when the encoder
/// cannot autoselect.
pub(crate) fn select_refs(caps: &CodecCapabilities, num_ref_frames: i32) -> i32 {
    if num_ref_frames == 0 {
        if caps.ref_frames_autoselect {
            0
        } else {
            16
        }
    } else if caps.ref_frames_restrict {
        num_ref_frames
    } else {
        0
    }
}

/// Effectively infinite GOP; keyframes are client-driven.
pub(crate) fn gop_size(limited_gop_size: bool) -> i32 {
    if limited_gop_size {
        i16::MAX as i32
    } else {
        i32::MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateControlMode {
    Cbr,
    Crf,
    Qp,
}

/// The CBR / CRF / QP decision ladder. `None` means the session cannot be
/// built.
pub(crate) fn rate_control_mode(
    bitrate_kbps: i32,
    has_crf: bool,
    crf_configured: bool,
    has_qp: bool,
) -> Option<RateControlMode> {
    if bitrate_kbps > 500 {
        Some(RateControlMode::Cbr)
    } else if has_crf && crf_configured {
        Some(RateControlMode::Crf)
    } else if has_qp {
        Some(RateControlMode::Qp)
    } else {
        None
    }
}

fn apply_option(dict: &mut Dictionary, option: &EncoderOption, settings: &VideoSettings) {
    match &option.value {
        OptionValue::Int(v) => dict.set(option.name, &v.to_string()),
        OptionValue::IntRef(get) => dict.set(option.name, &get(settings).to_string()),
        OptionValue::OptionalIntRef(get) => {
            if let Some(v) = get(settings) {
                dict.set(option.name, &v.to_string());
            }
        }
        OptionValue::Str(v) => dict.set(option.name, v),
        OptionValue::StrRef(get) => {
            let v = get(settings);
            if !v.is_empty() {
                dict.set(option.name, v);
            }
        }
    }
}

/// One encoder bound to one stream: context, conversion device and the
/// header-replacement table shared with every packet it emits.
pub struct EncodeSession {
    // Dropped before the encoder context, the device's frame may reference
    // the context's hardware-frames pool.
    device: Box<dyn HwDevice>,
    encoder: ffmpeg::encoder::video::Encoder,
    replacements: ReplacementTable,
    inject: Inject,
    cbs: Arc<dyn CodedBitstream>,
}

/// Build a session for `encoder` against a capture source of
/// `in_width`×`in_height`, using the display-provided conversion device or
/// falling back to the software scaler.
pub fn make_session(
    encoder: &Encoder,
    settings: &VideoSettings,
    config: &SessionConfig,
    in_width: i32,
    in_height: i32,
    hwdevice: Option<Box<dyn HwDevice>>,
    cbs: Arc<dyn CodedBitstream>,
) -> Result<EncodeSession> {
    let desc = encoder.desc;
    let caps = encoder.caps.codec(config.video_format);
    let codec_desc = desc.codec(config.video_format);
    let hardware = desc.dev_type != DeviceType::None;

    if !caps.passed {
        error!(
            encoder = desc.name,
            codec = codec_desc.name,
            "codec mode not supported"
        );
        return Err(ArgonError::unsupported(format!(
            "{}: {} mode not supported",
            desc.name, codec_desc.name
        )));
    }

    if config.dynamic_range && !caps.dynamic_range {
        error!(codec = codec_desc.name, "dynamic range not supported");
        return Err(ArgonError::unsupported(format!(
            "{}: dynamic range not supported",
            codec_desc.name
        )));
    }

    let codec = ffmpeg::encoder::find_by_name(codec_desc.name)
        .ok_or_else(|| ArgonError::encoder(format!("couldn't open [{}]", codec_desc.name)))?;

    let mut enc = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()?;

    enc.set_width(config.width as u32);
    enc.set_height(config.height as u32);
    enc.set_time_base(Rational::new(1, config.framerate));
    enc.set_frame_rate(Some(Rational::new(config.framerate, 1)));

    // B-frames delay decoder output, so never use them
    enc.set_max_b_frames(0);
    enc.set_gop(gop_size(desc.flags.limited_gop_size) as u32);

    enc.set_flags(codec::Flags::CLOSED_GOP | codec::Flags::LOW_DELAY);

    let mapping = map_csc(config.encoder_csc_mode);
    enc.set_colorspace(mapping.space);
    enc.set_color_range(mapping.range.av());

    let profile = if config.video_format == VideoFormat::H264 {
        desc.profile.h264_high
    } else if config.dynamic_range {
        desc.profile.hevc_main_10
    } else {
        desc.profile.hevc_main
    };

    let sw_fmt = desc.sw_pix_fmt(config.dynamic_range);
    let refs = select_refs(caps, config.num_ref_frames);

    let mut slices = if hardware {
        config.slices_per_frame
    } else {
        // Clients request the fewest slices for decode efficiency; encode
        // latency needs a floor on parallelism.
        config.slices_per_frame.max(settings.min_threads as i32)
    };
    if !caps.slice {
        slices = 1;
    }

    unsafe {
        let p = enc.as_mut_ptr();
        (*p).profile = profile;
        (*p).keyint_min = i32::MAX;
        (*p).refs = refs;
        (*p).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
        (*p).color_primaries = mapping.primaries.into();
        (*p).color_trc = mapping.transfer.into();
        // The header rewriter reads the software format off the context
        (*p).sw_pix_fmt = ffi::AVPixelFormat::from(sw_fmt);
        (*p).slices = slices;
        (*p).thread_type = ffi::FF_THREAD_SLICE as i32;
        (*p).thread_count = slices;
    }

    let device_handle = hwdevice
        .as_ref()
        .map(|d| d.handle())
        .unwrap_or(DeviceHandle::None);

    if hardware {
        enc.set_format(desc.dev_pix_fmt);

        let factory = desc.make_hwdevice_ctx.ok_or_else(|| {
            ArgonError::encoder(format!("{}: no hardware device-context factory", desc.name))
        })?;
        let device_ctx = factory(settings, &device_handle)?;
        hw::hwframe_ctx(unsafe { enc.as_mut_ptr() }, &device_ctx, sw_fmt)?;
    } else {
        enc.set_format(sw_fmt);
    }

    let mut opts = Dictionary::new();
    for option in codec_desc.options {
        apply_option(&mut opts, option, settings);
    }

    let mode = rate_control_mode(
        config.bitrate,
        codec_desc.crf.is_some(),
        settings.crf != 0,
        codec_desc.qp.is_some(),
    )
    .ok_or_else(|| {
        error!(
            encoder = desc.name,
            "couldn't set video quality: encoder supports neither crf nor qp"
        );
        ArgonError::config(format!(
            "couldn't set video quality: encoder {} doesn't support either crf or qp",
            desc.name
        ))
    })?;

    match mode {
        RateControlMode::Cbr => {
            let bitrate = config.bitrate as i64 * 1000;
            unsafe {
                let p = enc.as_mut_ptr();
                (*p).rc_max_rate = bitrate;
                (*p).rc_min_rate = bitrate;
                (*p).bit_rate = bitrate;
                (*p).rc_buffer_size = (bitrate / config.framerate as i64) as i32;
            }
        }
        RateControlMode::Crf => {
            if let Some(crf) = &codec_desc.crf {
                apply_option(&mut opts, crf, settings);
            }
        }
        RateControlMode::Qp => {
            if let Some(qp) = &codec_desc.qp {
                apply_option(&mut opts, qp, settings);
            }
        }
    }

    debug!(
        encoder = desc.name,
        codec = codec_desc.name,
        width = config.width,
        height = config.height,
        framerate = config.framerate,
        refs,
        slices,
        ?mode,
        "opening encoder"
    );

    let opened = enc.open_with(opts).map_err(|e| {
        error!(codec = codec_desc.name, %e, "could not open codec");
        ArgonError::encoder(format!("could not open codec [{}]: {e}", codec_desc.name))
    })?;

    let mut frame = frame::Video::empty();
    unsafe {
        let f = frame.as_mut_ptr();
        (*f).format = ffi::AVPixelFormat::from(if hardware { desc.dev_pix_fmt } else { sw_fmt }) as i32;
        (*f).width = config.width;
        (*f).height = config.height;
        if hardware {
            (*f).hw_frames_ctx = ffi::av_buffer_ref((*opened.as_ptr().cast_mut()).hw_frames_ctx);
        }
    }

    let mut device: Box<dyn HwDevice> = match hwdevice {
        Some(dev) => dev,
        None => Box::new(SwScaler::new(in_width, in_height, sw_fmt)),
    };

    device.set_frame(frame)?;
    device.set_colorspace(mapping.sws_space, mapping.range)?;

    let mut session = EncodeSession {
        device,
        encoder: opened,
        replacements: Arc::new(RwLock::new(Vec::new())),
        inject: inject_mode(caps.vui_parameters, config.video_format),
        cbs,
    };

    if !caps.nalu_prefix_5b {
        let nalu: &[u8] = if config.video_format == VideoFormat::Hevc {
            &HEVC_NALU
        } else {
            &H264_NALU
        };
        session.replacements.write().push(Replacement {
            old: nalu[1..].to_vec(),
            new: nalu.to_vec(),
        });
    }

    Ok(session)
}

impl EncodeSession {
    /// Mark the next frame as a forced IDR picture.
    pub fn mark_idr(&mut self) {
        let frame = self.device.frame_mut();
        frame.set_kind(picture::Type::I);
        unsafe { (*frame.as_mut_ptr()).flags |= FRAME_FLAG_KEY };
    }

    /// Clear the forced-IDR marking after an encode call.
    pub fn clear_idr(&mut self) {
        let frame = self.device.frame_mut();
        frame.set_kind(picture::Type::None);
        unsafe { (*frame.as_mut_ptr()).flags &= !FRAME_FLAG_KEY };
    }

    /// Convert a captured image into the session's encoder frame.
    pub fn convert(&mut self, img: &Image) -> Result<()> {
        self.device.convert(img)
    }

    /// The replacement table shared with emitted packets.
    pub fn replacements(&self) -> ReplacementTable {
        Arc::clone(&self.replacements)
    }

    /// Encode the bound frame at `frame_nr` and push every ready packet.
    pub fn encode(
        &mut self,
        frame_nr: i64,
        packets: &Queue<Packet>,
        channel: &ChannelTag,
    ) -> Result<()> {
        let frame = self.device.frame_mut();
        frame.set_pts(Some(frame_nr));

        self.encoder.send_frame(frame).map_err(|e| {
            error!(%e, "could not send a frame for encoding");
            ArgonError::encoder(format!("could not send a frame for encoding: {e}"))
        })?;

        let mut packet = ffmpeg::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    self.harvest_headers(&packet)?;

                    let out = Packet {
                        data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                        pts: packet.pts().unwrap_or(frame_nr),
                        keyframe: packet.is_key(),
                        replacements: Arc::clone(&self.replacements),
                        channel: channel.clone(),
                    };
                    trace!(pts = out.pts, size = out.data.len(), keyframe = out.keyframe, "packet");
                    packets.raise(out);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    return Ok(())
                }
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// On the first packet after session build with broken VUI: extract the
    /// parameter sets and append their rewrites, exactly once.
    fn harvest_headers(&mut self, packet: &ffmpeg::Packet) -> Result<()> {
        match self.inject {
            Inject::None => {}
            Inject::H264 => {
                let ctx: &codec::Context = &self.encoder;
                let sps = self.cbs.make_sps_h264(ctx, packet)?;
                self.inject = Inject::None;
                self.replacements.write().push(Replacement {
                    old: sps.old,
                    new: sps.new,
                });
            }
            Inject::Hevc => {
                let ctx: &codec::Context = &self.encoder;
                let headers = self.cbs.make_sps_hevc(ctx, packet)?;
                self.inject = Inject::None;
                let mut table = self.replacements.write();
                table.push(Replacement {
                    old: headers.vps.old,
                    new: headers.vps.new,
                });
                table.push(Replacement {
                    old: headers.sps.old,
                    new: headers.sps.new,
                });
            }
        }
        Ok(())
    }
}
