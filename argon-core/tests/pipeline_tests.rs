//! Integration tests for the capture pipelines and session plumbing
//!
//! Tests that need a real FFmpeg encoder are marked with #[ignore].

mod mocks;

use std::sync::Arc;
use std::time::Duration;

use argon_core::capture::make_touch_port;
use argon_core::config::VideoSettings;
use argon_core::encode::letterbox;
use argon_core::mail::SessionMail;
use argon_core::types::IdrRequest;
use argon_core::VideoCore;

use mocks::{session_config, MockBackend, MockDisplay, StubCbs};

#[test]
fn test_session_mail_topics_are_independent() {
    let mail = SessionMail::new();

    mail.idr.raise(IdrRequest {
        start_frame: 0,
        end_frame: 1,
    });
    assert!(mail.idr.peek());
    assert!(!mail.shutdown.peek());
    assert!(!mail.packets.peek());

    let request = mail.idr.pop().expect("idr request");
    assert_eq!(request.schedule(60), (1, 61));
}

#[test]
fn test_touch_port_reports_scaled_rect() {
    let display = MockDisplay::new(2560, 1440);
    let mut config = session_config();
    config.width = 1280;
    config.height = 720;

    let port = make_touch_port(&*display, &config);
    assert_eq!(port.width, 1280);
    assert_eq!(port.height, 720);
    assert_eq!(port.env_width, 2560);
    assert!((port.client_scalar - 2.0).abs() < 1e-6);
}

#[test]
fn test_letterbox_centers_the_picture() {
    let lb = letterbox(3440, 1440, 1920, 1080);
    // 21:9 into 16:9: full width, bars above and below
    assert_eq!(lb.scaled_width, 1920);
    assert!(lb.scaled_height < 1080);
    assert!(lb.offset_y > 0);
}

#[test]
#[ignore = "requires an FFmpeg build with libx264"]
fn test_async_session_streams_idr_first() {
    let backend = MockBackend::new(1280, 720);
    let core = VideoCore::init(
        VideoSettings::default(),
        backend,
        Arc::new(StubCbs::new()),
    )
    .expect("init");

    let mail = SessionMail::new();
    let packets = mail.packets.clone();
    let shutdown = mail.shutdown.clone();

    let session_core = Arc::clone(&core);
    let mut config = session_config();
    config.width = 1280;
    config.height = 720;
    let session = std::thread::spawn(move || session_core.capture(mail, config, None));

    // The control surface seeds an IDR request for frame 1, so the first
    // packet that comes out must be a keyframe with pts 1
    let first = packets
        .pop_timeout(Duration::from_secs(10))
        .expect("first packet");
    assert!(first.keyframe);
    assert_eq!(first.pts, 1);

    // And the stream stays strictly monotonic afterwards
    let mut last_pts = first.pts;
    for _ in 0..10 {
        let Some(packet) = packets.pop_timeout(Duration::from_secs(5)) else {
            break;
        };
        assert!(packet.pts > last_pts);
        last_pts = packet.pts;
    }

    shutdown.raise(true);
    session.join().expect("session thread").expect("capture");
}
