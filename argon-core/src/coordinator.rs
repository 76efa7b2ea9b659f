//! Control surface
//!
//! `VideoCore` owns everything with process lifetime: the probed encoder
//! selection and the two lazily-started capture pipelines. Sessions enter
//! through [`VideoCore::capture`], which picks the pipeline matching the
//! encoder's memory model and blocks for the lifetime of the stream.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::capture::async_pipeline::{capture_async, AsyncCaptureThread};
use crate::capture::sync_pipeline::{SyncCaptureThread, SyncSessionCtx};
use crate::capture::DisplayBackend;
use crate::cbs::CodedBitstream;
use crate::config::{HevcMode, SessionConfig, VideoSettings};
use crate::encode::probe::validate_encoder;
use crate::encode::registry::{self, Encoder};
use crate::error::{ArgonError, Result};
use crate::mail::{SessionMail, Signal};
use crate::types::{ChannelTag, IdrRequest};

/// Process-wide capture-and-encode coordinator.
pub struct VideoCore {
    settings: VideoSettings,
    backend: Arc<dyn DisplayBackend>,
    cbs: Arc<dyn CodedBitstream>,
    encoder: Encoder,
    hevc_mode: HevcMode,
    async_pipeline: Mutex<Weak<AsyncCaptureThread>>,
    sync_pipeline: Mutex<Weak<SyncCaptureThread>>,
}

impl VideoCore {
    /// Probe the registered encoder families and keep the first survivor.
    ///
    /// Families are removed when their probe fails, when they don't match a
    /// pinned `encoder` name, or when HDR is required but unsupported.
    pub fn init(
        settings: VideoSettings,
        backend: Arc<dyn DisplayBackend>,
        cbs: Arc<dyn CodedBitstream>,
    ) -> Result<Arc<Self>> {
        ffmpeg_next::init()
            .map_err(|e| ArgonError::encoder(format!("FFmpeg init failed: {e}")))?;

        info!("testing for available encoders, this may generate errors you can safely ignore");

        let mut selected = None;
        for desc in registry::candidates() {
            if !settings.encoder.is_empty() && desc.name != settings.encoder {
                continue;
            }
            let Some(caps) = validate_encoder(desc, &settings, &*backend, &cbs) else {
                continue;
            };
            if settings.hevc_mode == HevcMode::HevcHdr && !caps.hevc.dynamic_range {
                continue;
            }
            selected = Some(Encoder { desc, caps });
            break;
        }

        let Some(encoder) = selected else {
            if settings.encoder.is_empty() {
                error!("couldn't find any working encoder");
            } else {
                error!("couldn't find any encoder matching [{}]", settings.encoder);
            }
            return Err(ArgonError::probe("no usable encoder"));
        };

        if encoder.caps.hevc.passed {
            info!(
                "found encoder {}: [{}, {}]",
                encoder.desc.name, encoder.desc.h264.name, encoder.desc.hevc.name
            );
        } else {
            info!(
                "found encoder {}: [{}]",
                encoder.desc.name, encoder.desc.h264.name
            );
        }

        let hevc_mode = match settings.hevc_mode {
            HevcMode::Auto => {
                if !encoder.caps.hevc.passed {
                    HevcMode::H264Only
                } else if encoder.caps.hevc.dynamic_range {
                    HevcMode::HevcHdr
                } else {
                    HevcMode::HevcSdr
                }
            }
            mode => mode,
        };

        Ok(Arc::new(Self {
            settings,
            backend,
            cbs,
            encoder,
            hevc_mode,
            async_pipeline: Mutex::new(Weak::new()),
            sync_pipeline: Mutex::new(Weak::new()),
        }))
    }

    /// The encoder family selected at probe time.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// The HEVC policy after probing resolved `auto`.
    pub fn hevc_mode(&self) -> HevcMode {
        self.hevc_mode
    }

    fn async_pipeline(&self) -> Arc<AsyncCaptureThread> {
        let mut slot = self.async_pipeline.lock();
        if let Some(pipeline) = slot.upgrade() {
            return pipeline;
        }
        let pipeline = AsyncCaptureThread::start(Arc::clone(&self.backend), self.encoder);
        *slot = Arc::downgrade(&pipeline);
        pipeline
    }

    fn sync_pipeline(&self) -> Arc<SyncCaptureThread> {
        let mut slot = self.sync_pipeline.lock();
        if let Some(pipeline) = slot.upgrade() {
            return pipeline;
        }
        let pipeline = SyncCaptureThread::start(
            Arc::clone(&self.backend),
            self.encoder,
            self.settings.clone(),
            Arc::clone(&self.cbs),
        );
        *slot = Arc::downgrade(&pipeline);
        pipeline
    }

    /// Run one streaming session, blocking until it shuts down.
    ///
    /// The session joins the async pipeline when the encoder works from
    /// system memory, otherwise it registers with the sync pipeline and waits
    /// for its join signal. Either way the first emitted packet is an IDR
    /// frame.
    pub fn capture(&self, mail: SessionMail, config: SessionConfig, channel: ChannelTag) -> Result<()> {
        mail.idr.raise(IdrRequest {
            start_frame: 0,
            end_frame: 1,
        });

        if self.encoder.desc.flags.system_memory {
            let pipeline = self.async_pipeline();
            capture_async(
                &pipeline,
                &self.encoder,
                &self.settings,
                &self.cbs,
                mail,
                config,
                channel,
            )
        } else {
            let join = Signal::new();
            let mut ctx = SyncSessionCtx {
                join: join.clone(),
                shutdown: mail.shutdown.clone(),
                packets: mail.packets.clone(),
                idr: mail.idr.clone(),
                touch_port: mail.touch_port.clone(),
                config,
                frame_nr: 1,
                key_frame_nr: 1,
                channel,
            };

            loop {
                let pipeline = self.sync_pipeline();
                match pipeline.register(ctx) {
                    Ok(()) => {
                        join.wait();
                        return Ok(());
                    }
                    Err(returned) => {
                        // The thread wound down between upgrade and register
                        ctx = returned;
                        *self.sync_pipeline.lock() = Weak::new();
                    }
                }
            }
        }
    }
}
