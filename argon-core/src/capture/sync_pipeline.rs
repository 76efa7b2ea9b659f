//! Sync capture pipeline
//!
//! Used when the encoder accepts hardware surfaces directly: capture and
//! every encode session share one GPU image on a single thread. Sessions are
//! swept in a soonest-deadline order, each with its own frame interval, so
//! the snapshot cadence follows the fastest session without per-session
//! threads.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::capture::{make_touch_port, reset_display, Display, DisplayBackend};
use crate::cbs::CodedBitstream;
use crate::config::{SessionConfig, VideoSettings};
use crate::encode::hw::map_pix_fmt;
use crate::encode::registry::Encoder;
use crate::encode::session::{make_session, EncodeSession, Packet};
use crate::mail::{Event, Queue, Signal};
use crate::types::{CaptureStatus, ChannelTag, IdrRequest, TouchPort};

/// Per-session control channel registered with the sync capture thread.
pub(crate) struct SyncSessionCtx {
    /// Raised when the pipeline has erased the session
    pub join: Signal,
    pub shutdown: Event<bool>,
    pub packets: Queue<Packet>,
    pub idr: Event<IdrRequest>,
    pub touch_port: Event<TouchPort>,
    pub config: SessionConfig,
    pub frame_nr: i64,
    pub key_frame_nr: i64,
    pub channel: ChannelTag,
}

/// A live session inside the sweep: the encode session plus its cadence.
struct SyncStream {
    session: EncodeSession,
    next_frame: Instant,
    delay: Duration,
    /// An adopted capture that has not been converted yet
    pending: bool,
}

fn make_sync_stream(
    disp: &Arc<dyn Display>,
    encoder: &Encoder,
    settings: &VideoSettings,
    cbs: &Arc<dyn CodedBitstream>,
    ctx: &SyncSessionCtx,
    in_width: i32,
    in_height: i32,
) -> Option<SyncStream> {
    let pix_fmt = map_pix_fmt(encoder.desc.sw_pix_fmt(ctx.config.dynamic_range));
    // `Ok(None)` means the display has no hardware path; the session falls
    // back to the software scaler
    let hwdevice = disp.make_hwdevice(pix_fmt).ok()?;

    // Absolute pointer coordinates need the current screen geometry
    ctx.touch_port.raise(make_touch_port(&**disp, &ctx.config));

    let session = make_session(
        encoder,
        settings,
        &ctx.config,
        in_width,
        in_height,
        hwdevice,
        Arc::clone(cbs),
    )
    .ok()?;

    Some(SyncStream {
        session,
        next_frame: Instant::now(),
        delay: ctx.config.frame_interval(),
        pending: true,
    })
}

/// One run of the multiplexed capture-and-encode loop. Returns `Reinit` when
/// the display was lost and the supervisor should start over with the same
/// session contexts.
fn encode_run_sync(
    ctxs: &mut Vec<SyncSessionCtx>,
    incoming: &Queue<SyncSessionCtx>,
    backend: &dyn DisplayBackend,
    encoder: &Encoder,
    settings: &VideoSettings,
    cbs: &Arc<dyn CodedBitstream>,
) -> CaptureStatus {
    let mut disp = None;
    while incoming.running() {
        disp = reset_display(backend, encoder.desc.dev_type);
        if disp.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let Some(disp) = disp else {
        return CaptureStatus::Error;
    };

    let mut img = disp.alloc_img();
    if disp.dummy_img(&mut img).is_err() {
        return CaptureStatus::Error;
    }

    let mut streams = Vec::with_capacity(ctxs.len());
    let mut i = 0;
    while i < ctxs.len() {
        match make_sync_stream(&disp, encoder, settings, cbs, &ctxs[i], img.width, img.height) {
            Some(stream) => {
                streams.push(stream);
                i += 1;
            }
            None => {
                // Session-fatal: this session goes down, the sweep lives on
                let ctx = ctxs.remove(i);
                error!("couldn't create a sync session");
                ctx.shutdown.raise(true);
                ctx.join.raise();
            }
        }
    }

    let mut next_frame = Instant::now();
    while incoming.running() {
        while incoming.peek() {
            let Some(ctx) = incoming.try_pop() else {
                return CaptureStatus::Ok;
            };

            match make_sync_stream(&disp, encoder, settings, cbs, &ctx, img.width, img.height) {
                Some(stream) => {
                    ctxs.push(ctx);
                    streams.push(stream);
                    next_frame = Instant::now();
                }
                None => {
                    // Session-fatal: release the waiting thread, keep the
                    // other sessions running
                    error!("couldn't create a sync session");
                    ctx.shutdown.raise(true);
                    ctx.join.raise();
                }
            }
        }

        let timeout = next_frame.saturating_duration_since(Instant::now());
        let captured = match disp.snapshot(&mut img, timeout, true) {
            CaptureStatus::Reinit => return CaptureStatus::Reinit,
            CaptureStatus::Error => return CaptureStatus::Error,
            CaptureStatus::Timeout => false,
            CaptureStatus::Ok => true,
        };

        let now = Instant::now();
        next_frame = now + Duration::from_secs(1);

        let mut i = 0;
        while i < streams.len() {
            let ctx = &mut ctxs[i];
            let stream = &mut streams[i];

            if ctx.shutdown.peek() {
                // Let the waiting session thread know it can return
                ctx.join.raise();

                ctxs.remove(i);
                streams.remove(i);

                if streams.is_empty() {
                    return CaptureStatus::Ok;
                }
                continue;
            }

            if ctx.idr.peek() {
                stream.session.mark_idr();

                if let Some(event) = ctx.idr.pop() {
                    (ctx.frame_nr, ctx.key_frame_nr) = event.schedule(ctx.config.framerate);
                }
            } else if ctx.frame_nr == ctx.key_frame_nr {
                stream.session.mark_idr();
            }

            if captured {
                stream.pending = true;
            }

            let due = now > stream.next_frame;
            if due {
                stream.next_frame += stream.delay;
            }
            next_frame = next_frame.min(stream.next_frame);
            if !due {
                i += 1;
                continue;
            }

            if stream.pending {
                if stream.session.convert(&img).is_err() {
                    error!("could not convert image");
                    ctx.shutdown.raise(true);
                    continue;
                }
                stream.pending = false;
            }

            let frame_nr = ctx.frame_nr;
            ctx.frame_nr += 1;
            if stream.session.encode(frame_nr, &ctx.packets, &ctx.channel).is_err() {
                error!("could not encode video packet");
                ctx.shutdown.raise(true);
                continue;
            }

            stream.session.clear_idr();

            i += 1;
        }
    }

    CaptureStatus::Ok
}

fn run_sync(
    incoming: Queue<SyncSessionCtx>,
    backend: Arc<dyn DisplayBackend>,
    encoder: Encoder,
    settings: VideoSettings,
    cbs: Arc<dyn CodedBitstream>,
) {
    let mut ctxs = Vec::new();

    while encode_run_sync(&mut ctxs, &incoming, &*backend, &encoder, &settings, &cbs)
        == CaptureStatus::Reinit
    {}

    // Stop every live and still-queued session
    for ctx in ctxs {
        ctx.shutdown.raise(true);
        ctx.join.raise();
    }
    for ctx in incoming.stop() {
        ctx.shutdown.raise(true);
        ctx.join.raise();
    }
}

/// The reference-counted sync capture thread; one per process while any
/// hardware-surface session is live.
pub(crate) struct SyncCaptureThread {
    sessions: Queue<SyncSessionCtx>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCaptureThread {
    pub(crate) fn start(
        backend: Arc<dyn DisplayBackend>,
        encoder: Encoder,
        settings: VideoSettings,
        cbs: Arc<dyn CodedBitstream>,
    ) -> Arc<Self> {
        let sessions = Queue::new();
        let thread = {
            let sessions = sessions.clone();
            std::thread::spawn(move || run_sync(sessions, backend, encoder, settings, cbs))
        };

        Arc::new(Self {
            sessions,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a session; hands the context back when the thread already
    /// wound down so the caller can retry against a fresh pipeline.
    pub(crate) fn register(&self, ctx: SyncSessionCtx) -> std::result::Result<(), SyncSessionCtx> {
        self.sessions.try_raise(ctx)
    }
}

impl Drop for SyncCaptureThread {
    fn drop(&mut self) {
        for ctx in self.sessions.stop() {
            ctx.shutdown.raise(true);
            ctx.join.raise();
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        info!("sync capture thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{MockBackend, StubCbs};
    use crate::config::VideoFormat;
    use crate::encode::registry::{CodecCapabilities, EncoderCaps, SOFTWARE};

    fn test_encoder() -> Encoder {
        Encoder {
            desc: &SOFTWARE,
            caps: EncoderCaps {
                h264: CodecCapabilities::all(),
                hevc: CodecCapabilities::all(),
            },
        }
    }

    /// An encoder whose HEVC half never probed; HEVC sessions fail to build
    /// before any codec is touched.
    fn h264_only_encoder() -> Encoder {
        let mut caps = EncoderCaps {
            h264: CodecCapabilities::all(),
            hevc: CodecCapabilities::all(),
        };
        caps.hevc.passed = false;
        Encoder {
            desc: &SOFTWARE,
            caps,
        }
    }

    fn test_ctx(join: Signal, shutdown: Event<bool>, format: VideoFormat) -> SyncSessionCtx {
        SyncSessionCtx {
            join,
            shutdown,
            packets: Queue::new(),
            idr: Event::new(),
            touch_port: Event::new(),
            config: SessionConfig {
                width: 1280,
                height: 720,
                framerate: 60,
                bitrate: 5000,
                slices_per_frame: 1,
                num_ref_frames: 1,
                encoder_csc_mode: 0,
                video_format: format,
                dynamic_range: false,
            },
            frame_nr: 1,
            key_frame_nr: 1,
            channel: None,
        }
    }

    #[test]
    fn test_failed_session_is_shut_down_individually() {
        // A session whose build fails is torn down alone; the pipeline
        // thread keeps sweeping and accepts later registrations
        let backend = MockBackend::new(1280, 720);
        let pipeline = SyncCaptureThread::start(
            backend,
            h264_only_encoder(),
            VideoSettings::default(),
            Arc::new(StubCbs),
        );

        let join = Signal::new();
        let shutdown = Event::new();
        let ctx = test_ctx(join.clone(), shutdown.clone(), VideoFormat::Hevc);
        assert!(pipeline.register(ctx).is_ok());

        assert!(
            join.wait_timeout(Duration::from_secs(5)),
            "join signal never raised"
        );
        assert!(shutdown.peek());

        // The sweep survived the failure: a second doomed session is still
        // accepted and released the same way
        let join2 = Signal::new();
        let shutdown2 = Event::new();
        let ctx = test_ctx(join2.clone(), shutdown2.clone(), VideoFormat::Hevc);
        assert!(pipeline.register(ctx).is_ok());
        assert!(join2.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_drop_releases_queued_sessions() {
        let backend = MockBackend::new(1280, 720);
        let pipeline = SyncCaptureThread::start(
            backend,
            h264_only_encoder(),
            VideoSettings::default(),
            Arc::new(StubCbs),
        );

        let join = Signal::new();
        let shutdown = Event::new();
        let ctx = test_ctx(join.clone(), shutdown.clone(), VideoFormat::Hevc);
        let _ = pipeline.register(ctx);
        drop(pipeline);

        assert!(join.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    #[ignore = "requires an FFmpeg build with libx264"]
    fn test_session_builds_with_software_scaler_fallback() {
        // The mock display furnishes no conversion device (`Ok(None)`); the
        // session must still come up on the software scaler and stream
        ffmpeg_next::init().expect("ffmpeg init");

        let backend = MockBackend::new(1280, 720);
        let pipeline = SyncCaptureThread::start(
            backend,
            test_encoder(),
            VideoSettings::default(),
            Arc::new(StubCbs),
        );

        let join = Signal::new();
        let shutdown = Event::new();
        let ctx = test_ctx(join.clone(), shutdown.clone(), VideoFormat::H264);
        let packets = ctx.packets.clone();
        let touch_port = ctx.touch_port.clone();
        assert!(pipeline.register(ctx).is_ok());

        // Counters start at frame 1 == keyframe 1, so the first packet out
        // is an IDR frame
        let first = packets
            .pop_timeout(Duration::from_secs(10))
            .expect("first packet");
        assert!(first.keyframe);
        assert_eq!(first.pts, 1);
        assert!(touch_port.peek());
        assert!(!shutdown.peek());

        shutdown.raise(true);
        assert!(join.wait_timeout(Duration::from_secs(5)));
    }
}
