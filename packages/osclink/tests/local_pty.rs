//! Non-interactive local sessions: a scripted shell on a real PTY.

use std::time::{Duration, Instant};

use osclink::{LinkError, LocalConfig, LocalLink, Transport};

fn scripted(script: &str) -> LocalLink {
    LocalLink::new(LocalConfig {
        shell: Some("/bin/sh".into()),
        args: vec!["-c".into(), script.into()],
        interactive: false,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    })
}

#[test]
fn frame_printed_by_the_shell_lands_in_the_inbox() {
    let mut link = scripted(r"printf 'hello\r\n\033]9998;VE9QT0xPR1k7WFla\007bye\r\n'; sleep 2");
    link.start().unwrap();

    let payload = link.inbox().wait_timeout_and_pop(Duration::from_secs(5));
    assert_eq!(payload, Some(b"TOPOLOGY;XYZ".to_vec()));
    assert_eq!(link.try_pull(), None);

    link.finish();
    assert!(!link.is_running());
}

#[test]
fn sent_frame_reaches_the_shell() {
    // Answers OK only if the line it reads carries the encoded request.
    let mut link = scripted(
        r#"read -r line; case "$line" in *UkVRVUVTVC9UT1BPTE9HWQ==*) printf '\033]9998;T0s=\007' ;; esac; sleep 2"#,
    );
    link.start().unwrap();
    link.send(b"REQUEST/TOPOLOGY").unwrap();

    let payload = link.inbox().wait_timeout_and_pop(Duration::from_secs(5));
    assert_eq!(payload, Some(b"OK".to_vec()));
    link.finish();
}

#[test]
fn reader_stops_when_the_shell_exits() {
    let mut link = scripted("exit 0");
    link.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while link.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!link.is_running());
    link.finish();
}

#[test]
fn start_twice_is_rejected() {
    let mut link = scripted("sleep 2");
    link.start().unwrap();
    assert!(matches!(link.start(), Err(LinkError::AlreadyStarted)));
    link.finish();
    // finish is idempotent
    link.finish();
}

#[test]
fn shell_that_never_reads_cannot_wedge_send_or_finish() {
    let mut link = scripted("sleep 10");
    link.start().unwrap();

    // Far more than the PTY input queue holds.
    let started = Instant::now();
    for _ in 0..4000 {
        link.send(b"REQUEST/HEATMAP-DATA").unwrap();
    }
    assert!(link.is_running());
    link.finish();

    assert!(!link.is_running());
    assert!(started.elapsed() < Duration::from_secs(5));
}
