//! Async capture pipeline
//!
//! Used when the chosen encoder works from system memory: one capture thread
//! snapshots the display into a ring of reusable images and fans the frames
//! out to any number of consumer sessions, each running its own encode loop
//! on the caller's thread. The producer paces itself to the fastest
//! subscriber and owns display reinitialization.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::capture::{make_touch_port, reset_display, Display, DisplayBackend, HwDevice, Image};
use crate::cbs::CodedBitstream;
use crate::config::{SessionConfig, VideoSettings};
use crate::encode::hw::map_pix_fmt;
use crate::encode::registry::Encoder;
use crate::encode::session::make_session;
use crate::error::Result;
use crate::mail::{Event, Queue, SessionMail, Signal};
use crate::types::{CaptureStatus, ChannelTag};

/// Number of reusable images the producer cycles through.
const IMAGE_RING_SIZE: usize = 12;

/// A consumer's registration with the capture thread.
pub(crate) struct CaptureSubscription {
    /// Latest-wins frame slot the producer raises into
    pub images: Event<Arc<Image>>,
    /// The subscriber's frame interval
    pub delay: Duration,
}

/// The reference-counted capture thread. Starts when the first async session
/// acquires it through the coordinator and stops when the last drops it.
pub(crate) struct AsyncCaptureThread {
    subscriptions: Queue<CaptureSubscription>,
    pub(crate) reinit: Signal,
    display: Arc<Mutex<Option<Weak<dyn Display>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncCaptureThread {
    pub(crate) fn start(backend: Arc<dyn DisplayBackend>, encoder: Encoder) -> Arc<Self> {
        let subscriptions = Queue::new();
        let reinit = Signal::new();
        let display: Arc<Mutex<Option<Weak<dyn Display>>>> = Arc::new(Mutex::new(None));

        let thread = {
            let subscriptions = subscriptions.clone();
            let reinit = reinit.clone();
            let display = Arc::clone(&display);
            std::thread::spawn(move || {
                run_capture(subscriptions, display, reinit, backend, encoder)
            })
        };

        Arc::new(Self {
            subscriptions,
            reinit,
            display,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn subscribe(&self, subscription: CaptureSubscription) {
        self.subscriptions.raise(subscription);
    }

    pub(crate) fn running(&self) -> bool {
        self.subscriptions.running()
    }

    /// The live display, if the producer currently holds one.
    pub(crate) fn display(&self) -> Option<Arc<dyn Display>> {
        self.display.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for AsyncCaptureThread {
    fn drop(&mut self) {
        for subscription in self.subscriptions.stop() {
            subscription.images.stop();
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        info!("async capture thread stopped");
    }
}

/// Thread body: run the capture loop, then stop every subscription so no
/// consumer blocks on a dead producer.
fn run_capture(
    subscriptions: Queue<CaptureSubscription>,
    display_slot: Arc<Mutex<Option<Weak<dyn Display>>>>,
    reinit: Signal,
    backend: Arc<dyn DisplayBackend>,
    encoder: Encoder,
) {
    let mut active = Vec::new();

    capture_loop(
        &subscriptions,
        &display_slot,
        &reinit,
        &*backend,
        &encoder,
        &mut active,
    );

    for subscription in active {
        subscription.images.stop();
    }
    for subscription in subscriptions.stop() {
        subscription.images.stop();
    }
}

fn alloc_ring(disp: &Arc<dyn Display>) -> Vec<Arc<Image>> {
    (0..IMAGE_RING_SIZE)
        .map(|_| Arc::new(disp.alloc_img()))
        .collect()
}

fn capture_loop(
    subscriptions: &Queue<CaptureSubscription>,
    display_slot: &Mutex<Option<Weak<dyn Display>>>,
    reinit: &Signal,
    backend: &dyn DisplayBackend,
    encoder: &Encoder,
    active: &mut Vec<CaptureSubscription>,
) {
    let mut delay = Duration::from_secs(1);

    let Some(mut disp) = backend.open(encoder.desc.dev_type.mem_type()) else {
        error!("couldn't open a display for capture");
        return;
    };
    *display_slot.lock() = Some(Arc::downgrade(&disp));

    let mut ring = alloc_ring(&disp);
    let mut index = ring.len() - 1;

    if let Some(subscription) = subscriptions.pop() {
        delay = subscription.delay;
        active.push(subscription);
    }

    let mut next_frame = Instant::now();
    while subscriptions.running() {
        while let Some(subscription) = subscriptions.try_pop() {
            delay = delay.min(subscription.delay);
            active.push(subscription);
        }

        let now = Instant::now();

        index = (index + 1) % ring.len();
        // Reuse the slot only once every consumer has let go of it
        while Arc::strong_count(&ring[index]) > 1 {
            std::hint::spin_loop();
        }
        let Some(img) = Arc::get_mut(&mut ring[index]) else {
            continue;
        };

        match disp.snapshot(img, Duration::from_secs(1), true) {
            CaptureStatus::Ok => {}
            CaptureStatus::Timeout => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            CaptureStatus::Reinit => {
                match reinitialize(disp, &mut ring, display_slot, reinit, subscriptions, backend, encoder)
                {
                    Some(display) => {
                        disp = display;
                        index = ring.len() - 1;
                        continue;
                    }
                    None => return,
                }
            }
            CaptureStatus::Error => {
                error!("capture failed, stopping the capture thread");
                return;
            }
        }

        let frame = Arc::clone(&ring[index]);
        let mut dropped_min = false;
        active.retain(|subscription| {
            if subscription.images.running() {
                subscription.images.raise(Arc::clone(&frame));
                true
            } else {
                if subscription.delay == delay {
                    dropped_min = true;
                }
                false
            }
        });
        if dropped_min {
            delay = active
                .iter()
                .map(|subscription| subscription.delay)
                .min()
                .unwrap_or(delay);
        }

        if next_frame > now {
            std::thread::sleep(next_frame - now);
        }
        next_frame += delay;
    }
}

/// Display-loss protocol: tell consumers to pause, release every image and
/// the display itself, wait for all outside references to expire, then
/// reopen and re-allocate.
fn reinitialize(
    disp: Arc<dyn Display>,
    ring: &mut Vec<Arc<Image>>,
    display_slot: &Mutex<Option<Weak<dyn Display>>>,
    reinit: &Signal,
    subscriptions: &Queue<CaptureSubscription>,
    backend: &dyn DisplayBackend,
    encoder: &Encoder,
) -> Option<Arc<dyn Display>> {
    warn!("display lost, reinitializing");
    reinit.raise();

    // Images reference the display; it won't close until they're gone
    ring.clear();

    let expired = Arc::downgrade(&disp);
    drop(disp);
    while expired.upgrade().is_some() {
        std::thread::sleep(Duration::from_millis(100));
    }

    let mut reopened = None;
    while subscriptions.running() {
        if let Some(display) = reset_display(backend, encoder.desc.dev_type) {
            reopened = Some(display);
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let disp = reopened?;

    *display_slot.lock() = Some(Arc::downgrade(&disp));
    *ring = alloc_ring(&disp);

    reinit.reset();
    debug!("display reinitialized");
    Some(disp)
}

/// One consumer's encode loop: build a session, then pace frames at the
/// session's interval until shutdown, display reinit, or stream stop.
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_run(
    frame_nr: &mut i64,
    key_frame_nr: &mut i64,
    mail: &SessionMail,
    images: &Event<Arc<Image>>,
    config: &SessionConfig,
    in_width: i32,
    in_height: i32,
    hwdevice: Option<Box<dyn HwDevice>>,
    reinit: &Signal,
    encoder: &Encoder,
    settings: &VideoSettings,
    cbs: &Arc<dyn CodedBitstream>,
    channel: &ChannelTag,
) {
    let Ok(mut session) = make_session(
        encoder,
        settings,
        config,
        in_width,
        in_height,
        hwdevice,
        Arc::clone(cbs),
    ) else {
        return;
    };

    let delay = config.frame_interval();
    let mut next_frame = Instant::now();

    loop {
        if mail.shutdown.peek() || reinit.peek() || !images.running() {
            // Let go of any held frame so the producer's display can expire
            images.clear();
            break;
        }

        if mail.idr.peek() {
            session.mark_idr();

            let Some(event) = mail.idr.pop() else {
                return;
            };
            (*frame_nr, *key_frame_nr) = event.schedule(config.framerate);
        } else if *frame_nr == *key_frame_nr {
            session.mark_idr();
        }

        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        }
        next_frame += delay;

        // When the client demands an IDR frame, keep sending even without a
        // fresh capture
        if *frame_nr > *key_frame_nr || images.peek() {
            if let Some(img) = images.pop_timeout(delay) {
                if session.convert(&img).is_err() {
                    error!("could not convert image");
                    return;
                }
            } else if images.running() {
                continue;
            } else {
                break;
            }
        }

        if session
            .encode(*frame_nr, &mail.packets, channel)
            .is_err()
        {
            error!("could not encode video packet");
            return;
        }
        *frame_nr += 1;

        session.clear_idr();
    }
}

/// Stops the image stream and raises shutdown when an async session unwinds.
struct SessionGuard<'a> {
    images: &'a Event<Arc<Image>>,
    mail: &'a SessionMail,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.images.stop();
        self.mail.shutdown.raise(true);
    }
}

/// Run one async session against the shared capture thread, blocking until
/// the session ends. Survives display reinitialization by rebuilding the
/// encode session against the reopened display.
pub(crate) fn capture_async(
    pipeline: &AsyncCaptureThread,
    encoder: &Encoder,
    settings: &VideoSettings,
    cbs: &Arc<dyn CodedBitstream>,
    mail: SessionMail,
    config: SessionConfig,
    channel: ChannelTag,
) -> Result<()> {
    let images: Event<Arc<Image>> = Event::new();
    let _guard = SessionGuard {
        images: &images,
        mail: &mail,
    };

    pipeline.subscribe(CaptureSubscription {
        images: images.clone(),
        delay: config.frame_interval(),
    });

    if !pipeline.running() {
        return Ok(());
    }

    let mut frame_nr: i64 = 1;
    let mut key_frame_nr: i64 = 1;

    while !mail.shutdown.peek() && images.running() {
        // Hold back while the producer reinitializes the display
        if pipeline.reinit.peek() {
            images.clear();
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }

        let Some(display) = pipeline.display() else {
            continue;
        };

        let pix_fmt = map_pix_fmt(encoder.desc.sw_pix_fmt(config.dynamic_range));
        let Ok(hwdevice) = display.make_hwdevice(pix_fmt) else {
            return Ok(());
        };

        // Seed the stream so the first encode has content even before the
        // first real snapshot lands
        let mut dummy = display.alloc_img();
        if display.dummy_img(&mut dummy).is_err() {
            return Ok(());
        }
        images.raise(Arc::new(dummy));

        // Absolute pointer coordinates need the current screen geometry
        mail.touch_port.raise(make_touch_port(&*display, &config));

        encode_run(
            &mut frame_nr,
            &mut key_frame_nr,
            &mail,
            &images,
            &config,
            display.width(),
            display.height(),
            hwdevice,
            &pipeline.reinit,
            encoder,
            settings,
            cbs,
            &channel,
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{MockBackend, MockDisplay};
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

    #[test]
    fn test_fanout_reaches_every_subscriber() {
        let backend = MockBackend::new(320, 180);
        let pipeline = AsyncCaptureThread::start(backend, test_encoder());

        let fast: Event<Arc<Image>> = Event::new();
        let slow: Event<Arc<Image>> = Event::new();
        pipeline.subscribe(CaptureSubscription {
            images: fast.clone(),
            delay: Duration::from_millis(5),
        });
        pipeline.subscribe(CaptureSubscription {
            images: slow.clone(),
            delay: Duration::from_millis(20),
        });

        let a = fast.pop_timeout(Duration::from_secs(2)).expect("fast frame");
        let b = slow.pop_timeout(Duration::from_secs(2)).expect("slow frame");
        assert_eq!((a.width, a.height), (320, 180));
        assert_eq!((b.width, b.height), (320, 180));
    }

    #[test]
    fn test_dropping_fast_subscriber_keeps_slow_one() {
        let backend = MockBackend::new(160, 90);
        let pipeline = AsyncCaptureThread::start(backend, test_encoder());

        let fast: Event<Arc<Image>> = Event::new();
        let slow: Event<Arc<Image>> = Event::new();
        pipeline.subscribe(CaptureSubscription {
            images: fast.clone(),
            delay: Duration::from_millis(3),
        });
        pipeline.subscribe(CaptureSubscription {
            images: slow.clone(),
            delay: Duration::from_millis(15),
        });

        assert!(fast.pop_timeout(Duration::from_secs(2)).is_some());
        assert!(slow.pop_timeout(Duration::from_secs(2)).is_some());

        // The fastest consumer leaves; the producer re-derives its pace and
        // keeps serving the remaining one
        fast.stop();
        for _ in 0..3 {
            assert!(
                slow.pop_timeout(Duration::from_secs(2)).is_some(),
                "slow subscriber starved after the fast one left"
            );
        }
    }

    #[test]
    fn test_reinit_keeps_subscriptions_alive() {
        let backend = MockBackend::new(320, 180);
        backend.push_display(MockDisplay::scripted(
            320,
            180,
            vec![
                CaptureStatus::Ok,
                CaptureStatus::Ok,
                CaptureStatus::Reinit,
            ],
        ));
        let pipeline = AsyncCaptureThread::start(Arc::clone(&backend) as _, test_encoder());

        let images: Event<Arc<Image>> = Event::new();
        pipeline.subscribe(CaptureSubscription {
            images: images.clone(),
            delay: Duration::from_millis(5),
        });

        assert!(images.pop_timeout(Duration::from_secs(2)).is_some());

        // Frames resume on the reopened display and the subscription was
        // never terminated
        let mut after_reinit = 0;
        for _ in 0..50 {
            if images.pop_timeout(Duration::from_millis(200)).is_some() {
                after_reinit += 1;
                if after_reinit >= 3 {
                    break;
                }
            }
        }
        assert!(after_reinit >= 3, "frames did not resume after reinit");
        assert!(images.running());
        assert!(backend.opened.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_drop_stops_subscriptions() {
        let backend = MockBackend::new(160, 90);
        let pipeline = AsyncCaptureThread::start(backend, test_encoder());

        let images: Event<Arc<Image>> = Event::new();
        pipeline.subscribe(CaptureSubscription {
            images: images.clone(),
            delay: Duration::from_millis(5),
        });
        assert!(images.pop_timeout(Duration::from_secs(2)).is_some());

        drop(pipeline);
        assert!(!images.running());
    }
}
