//! End-to-end tests driving the sink over real sockets.

mod support;

use std::time::{Duration, Instant};

use blackhole_common::mode::{Delay, ResponseMode};
use support::{SinkHarness, SmtpClient};

const BOUNCE_CODES: [u16; 10] = [450, 451, 452, 458, 521, 550, 551, 552, 553, 571];

fn reply_code(reply: &str) -> u16 {
    reply[..3].parse().expect("reply starts with a code")
}

#[tokio::test]
async fn banner_then_quit() {
    let harness = SinkHarness::start(ResponseMode::Accept).await;
    let mut client = SmtpClient::connect(harness.addr).await;

    let banner = client.recv().await;
    assert!(banner.starts_with("220 "), "got {banner}");
    assert!(banner.ends_with("ESMTP Blackhole"), "got {banner}");

    client.send("QUIT").await;
    let bye = client.recv().await;
    assert!(bye.starts_with("221 "), "got {bye}");
    client.expect_close().await;

    harness.shutdown().await;
}

#[tokio::test]
async fn accept_happy_path() {
    let harness = SinkHarness::start(ResponseMode::Accept).await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let reply = client
        .transact(&["Subject: t", "", "hi"])
        .await;
    assert!(reply.starts_with("250 OK: queued as "), "got {reply}");
    let token = reply.rsplit(' ').next().unwrap();
    assert_eq!(token.len(), 16);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    harness.shutdown().await;
}

#[tokio::test]
async fn bounce_mode_uses_the_fixed_code_set() {
    let harness = SinkHarness::start(ResponseMode::Bounce).await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    for _ in 0..8 {
        let reply = client.transact(&["hello"]).await;
        assert!(
            BOUNCE_CODES.contains(&reply_code(&reply)),
            "got {reply}"
        );
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn header_override_bounces_on_an_accept_listener() {
    let harness = SinkHarness::start(ResponseMode::Accept).await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let reply = client
        .transact(&["X-Blackhole-Mode: bounce", "", "body"])
        .await;
    assert!(reply_code(&reply) >= 400, "got {reply}");

    // The override was message scoped; the next message is accepted again.
    let reply = client.transact(&["plain body"]).await;
    assert!(reply.starts_with("250 "), "got {reply}");

    harness.shutdown().await;
}

#[tokio::test]
async fn header_override_is_inert_when_switch_is_off() {
    let harness = SinkHarness::builder()
        .with_mode(ResponseMode::Accept)
        .with_dynamic_switch(false)
        .start()
        .await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let reply = client
        .transact(&["X-Blackhole-Mode: bounce", "", "body"])
        .await;
    assert!(reply.starts_with("250 "), "got {reply}");

    harness.shutdown().await;
}

#[tokio::test]
async fn oversize_message_gets_552() {
    let harness = SinkHarness::builder()
        .with_max_message_size(64)
        .start()
        .await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let long_line = "x".repeat(40);
    let body: Vec<&str> = (0..8).map(|_| long_line.as_str()).collect();
    let reply = client.transact(&body).await;
    assert_eq!(reply_code(&reply), 552, "got {reply}");

    harness.shutdown().await;
}

#[tokio::test]
async fn dot_stuffing_is_undone_before_counting() {
    // ".hello" plus CRLF is exactly 8 bytes once the extra dot is gone.
    let harness = SinkHarness::builder()
        .with_max_message_size(8)
        .start()
        .await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let reply = client.transact(&["..hello"]).await;
    assert!(reply.starts_with("250 "), "got {reply}");

    harness.shutdown().await;
}

#[tokio::test]
async fn idle_client_gets_421_timeout() {
    let harness = SinkHarness::builder().with_timeout(1).start().await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let started = Instant::now();
    let reply = client.recv().await;
    assert_eq!(reply, "421 Timeout");
    assert!(started.elapsed() >= Duration::from_secs(1));
    client.expect_close().await;

    harness.shutdown().await;
}

#[tokio::test]
async fn offline_listener_closes_without_bytes() {
    let harness = SinkHarness::start(ResponseMode::Offline).await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.expect_close().await;

    harness.shutdown().await;
}

#[tokio::test]
async fn listeners_shadow_each_other_with_their_own_modes() {
    let accepting = SinkHarness::start(ResponseMode::Accept).await;
    let bouncing = SinkHarness::start(ResponseMode::Bounce).await;

    let mut client = SmtpClient::connect(accepting.addr).await;
    client.recv().await;
    assert!(client.transact(&["body"]).await.starts_with("250 "));

    let mut client = SmtpClient::connect(bouncing.addr).await;
    client.recv().await;
    assert!(reply_code(&client.transact(&["body"]).await) >= 400);

    accepting.shutdown().await;
    bouncing.shutdown().await;
}

#[tokio::test]
async fn delayed_sessions_run_concurrently() {
    let harness = SinkHarness::builder()
        .with_delay(Delay::Fixed(1))
        .with_timeout(10)
        .start()
        .await;

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let addr = harness.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = SmtpClient::connect(addr).await;
            client.recv().await;
            client.transact(&["body"]).await
        }));
    }

    for task in tasks {
        let reply = task.await.unwrap();
        assert!(reply.starts_with("250 "), "got {reply}");
    }

    // Four delayed sessions take about one delay, not four.
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(2500),
        "four sessions took {elapsed:?}"
    );
    assert!(elapsed >= Duration::from_secs(1), "delay was skipped");

    harness.shutdown().await;
}

#[tokio::test]
async fn delay_range_is_respected() {
    let harness = SinkHarness::builder()
        .with_delay(Delay::Range(1, 2))
        .with_timeout(10)
        .start()
        .await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let started = Instant::now();
    let reply = client.transact(&["body"]).await;
    let waited = started.elapsed();

    assert!(reply.starts_with("250 "), "got {reply}");
    assert!(waited >= Duration::from_secs(1), "waited {waited:?}");

    harness.shutdown().await;
}

#[tokio::test]
async fn header_delay_override_stalls_the_reply() {
    let harness = SinkHarness::builder().with_timeout(10).start().await;
    let mut client = SmtpClient::connect(harness.addr).await;
    client.recv().await;

    let started = Instant::now();
    let reply = client
        .transact(&["X-Blackhole-Delay: 1", "", "body"])
        .await;
    let waited = started.elapsed();

    assert!(reply.starts_with("250 "), "got {reply}");
    assert!(waited >= Duration::from_secs(1), "waited {waited:?}");

    harness.shutdown().await;
}
