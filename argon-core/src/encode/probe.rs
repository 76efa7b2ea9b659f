//! Encoder probing
//!
//! At startup every registered family is exercised against a real display
//! before it is trusted: a full session is built, one forced-IDR frame is
//! encoded, and the resulting packet is inspected for the deficiencies the
//! session layer has to work around (missing VUI, 3-byte NAL prefixes).
//! Probes run per codec under a pair of reference configurations; each
//! failure only clears the matching capability bit.

use std::sync::Arc;

use ffmpeg_next::codec;
use tracing::{debug, error, info, warn};

use crate::capture::{reset_display, DisplayBackend};
use crate::cbs::CodedBitstream;
use crate::config::{HevcMode, SessionConfig, VideoFormat, VideoSettings};
use crate::encode::hw::map_pix_fmt;
use crate::encode::registry::{CodecCapabilities, Encoder, EncoderCaps, EncoderDesc};
use crate::encode::session::{make_session, H264_NALU, HEVC_NALU};
use crate::mail::Queue;

/// Packet-deficiency bits measured by one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidateFlags {
    /// The emitted SPS already carried valid VUI parameters
    pub vui_params: bool,
    /// The payload contained the 4-byte NAL start-code prefix
    pub nalu_prefix_5b: bool,
}

/// Reference configuration all probes derive from: 1080p60 at 1000 kbps.
fn probe_config(video_format: VideoFormat) -> SessionConfig {
    SessionConfig {
        width: 1920,
        height: 1080,
        framerate: 60,
        bitrate: 1000,
        slices_per_frame: 1,
        num_ref_frames: 1,
        encoder_csc_mode: 1,
        video_format,
        dynamic_range: false,
    }
}

/// Build a probe session and encode one forced-IDR frame from a dummy image;
/// inspect the first packet. `None` means the (encoder × config) combination
/// does not work at all.
pub(crate) fn validate_config(
    backend: &dyn DisplayBackend,
    cbs: &Arc<dyn CodedBitstream>,
    settings: &VideoSettings,
    desc: &'static EncoderDesc,
    caps: &EncoderCaps,
    config: &SessionConfig,
) -> Option<ValidateFlags> {
    let disp = reset_display(backend, desc.dev_type)?;

    let pix_fmt = map_pix_fmt(desc.sw_pix_fmt(config.dynamic_range));
    let hwdevice = disp.make_hwdevice(pix_fmt).ok()?;

    let probe = Encoder { desc, caps: *caps };
    let mut session = make_session(
        &probe,
        settings,
        config,
        disp.width(),
        disp.height(),
        hwdevice,
        Arc::clone(cbs),
    )
    .ok()?;

    let mut img = disp.alloc_img();
    disp.dummy_img(&mut img).ok()?;
    session.convert(&img).ok()?;

    session.mark_idr();

    let packets = Queue::new();
    while !packets.peek() {
        session.encode(1, &packets, &None).ok()?;
    }

    let packet = packets.try_pop()?;
    if !packet.keyframe {
        error!("first packet type is not an IDR frame");
        return None;
    }

    let codec_id = match config.video_format {
        VideoFormat::H264 => codec::Id::H264,
        VideoFormat::Hevc => codec::Id::HEVC,
    };

    let nalu: &[u8] = match config.video_format {
        VideoFormat::H264 => &H264_NALU,
        VideoFormat::Hevc => &HEVC_NALU,
    };

    Some(ValidateFlags {
        vui_params: cbs.validate_sps(&packet.data, codec_id),
        nalu_prefix_5b: packet.data.windows(nalu.len()).any(|w| w == nalu),
    })
}

/// Fold the two reference probes into one codec's capability record. SLICE
/// and DYNAMIC_RANGE stay optimistic here; their dedicated probes decide
/// them afterwards.
pub(crate) fn derive_codec_caps(
    max_ref_frames: Option<ValidateFlags>,
    autoselect: Option<ValidateFlags>,
) -> CodecCapabilities {
    CodecCapabilities {
        passed: max_ref_frames.is_some() || autoselect.is_some(),
        ref_frames_restrict: max_ref_frames.is_some(),
        ref_frames_autoselect: autoselect.is_some(),
        slice: true,
        dynamic_range: true,
        vui_parameters: max_ref_frames.is_none_or(|f| f.vui_params)
            && autoselect.is_none_or(|f| f.vui_params),
        nalu_prefix_5b: max_ref_frames.is_none_or(|f| f.nalu_prefix_5b)
            && autoselect.is_none_or(|f| f.nalu_prefix_5b),
    }
}

/// Probe every capability of one encoder family. `None` removes the family
/// from the candidate list.
pub(crate) fn validate_encoder(
    desc: &'static EncoderDesc,
    settings: &VideoSettings,
    backend: &dyn DisplayBackend,
    cbs: &Arc<dyn CodedBitstream>,
) -> Option<EncoderCaps> {
    info!("trying encoder [{}]", desc.name);

    let force_hevc = matches!(settings.hevc_mode, HevcMode::HevcSdr | HevcMode::HevcHdr);
    let test_hevc =
        force_hevc || (settings.hevc_mode == HevcMode::Auto && !desc.flags.h264_only);

    // Work from optimistic capabilities while probing
    let mut caps = EncoderCaps {
        h264: CodecCapabilities::all(),
        hevc: CodecCapabilities::all(),
    };
    caps.hevc.passed = test_hevc;

    let config_max_ref_frames = probe_config(VideoFormat::H264);
    let config_autoselect = SessionConfig {
        num_ref_frames: 0,
        ..probe_config(VideoFormat::H264)
    };

    let max_ref_h264 = validate_config(backend, cbs, settings, desc, &caps, &config_max_ref_frames);
    let autoselect_h264 = validate_config(backend, cbs, settings, desc, &caps, &config_autoselect);

    if max_ref_h264.is_none() && autoselect_h264.is_none() {
        info!("encoder [{}] failed", desc.name);
        return None;
    }

    caps.h264 = derive_codec_caps(max_ref_h264, autoselect_h264);

    if test_hevc {
        let max_ref_hevc = validate_config(
            backend,
            cbs,
            settings,
            desc,
            &caps,
            &probe_config(VideoFormat::Hevc),
        );
        let autoselect_hevc = validate_config(
            backend,
            cbs,
            settings,
            desc,
            &caps,
            &SessionConfig {
                num_ref_frames: 0,
                ..probe_config(VideoFormat::Hevc)
            },
        );

        if force_hevc && max_ref_hevc.is_none() && autoselect_hevc.is_none() {
            info!("encoder [{}] failed", desc.name);
            return None;
        }

        caps.hevc = derive_codec_caps(max_ref_hevc, autoselect_hevc);
    } else {
        caps.hevc.passed = false;
    }

    // HDR: 10-bit Rec.2020-shaped config, probed per codec
    let dynamic_range_config = SessionConfig {
        num_ref_frames: 0,
        encoder_csc_mode: 3,
        dynamic_range: true,
        ..probe_config(VideoFormat::H264)
    };
    caps.h264.dynamic_range =
        validate_config(backend, cbs, settings, desc, &caps, &dynamic_range_config).is_some();
    if caps.hevc.passed {
        let hevc = SessionConfig {
            video_format: VideoFormat::Hevc,
            ..dynamic_range_config
        };
        caps.hevc.dynamic_range =
            validate_config(backend, cbs, settings, desc, &caps, &hevc).is_some();
    }

    // Slicing: two slices per frame
    let slice_config = SessionConfig {
        slices_per_frame: 2,
        ..probe_config(VideoFormat::H264)
    };
    caps.h264.slice =
        validate_config(backend, cbs, settings, desc, &caps, &slice_config).is_some();
    if caps.hevc.passed {
        let hevc = SessionConfig {
            video_format: VideoFormat::Hevc,
            ..slice_config
        };
        caps.hevc.slice = validate_config(backend, cbs, settings, desc, &caps, &hevc).is_some();
    }

    caps.h264.vui_parameters &= !settings.force_video_header_replace;
    caps.hevc.vui_parameters &= !settings.force_video_header_replace;

    if !caps.h264.vui_parameters {
        warn!("{}: h264 missing sps->vui parameters", desc.name);
    }
    if caps.hevc.passed && !caps.hevc.vui_parameters {
        warn!("{}: hevc missing sps->vui parameters", desc.name);
    }
    if !caps.h264.nalu_prefix_5b {
        warn!("{}: h264: replacing nalu prefix data", desc.name);
    }
    if caps.hevc.passed && !caps.hevc.nalu_prefix_5b {
        warn!("{}: hevc: replacing nalu prefix data", desc.name);
    }

    debug!("------  h264 ------");
    for (name, supported) in caps.h264.entries() {
        debug!(
            "{name}: {}",
            if supported { "supported" } else { "unsupported" }
        );
    }
    if caps.hevc.passed {
        debug!("------  hevc ------");
        for (name, supported) in caps.hevc.entries() {
            debug!(
                "{name}: {}",
                if supported { "supported" } else { "unsupported" }
            );
        }
    }
    debug!("-------------------");

    Some(caps)
}
