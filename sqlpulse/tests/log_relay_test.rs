//! Log relay over a live run loop: disconnect buffering, reconnect
//! flushing, level changes, file sink.

use sqlpulse::log::{Relay, BUFFER_SIZE};
use sqlpulse::proto::{LogEntry, LogLevel};
use sqlpulse::transport::{ChannelClient, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn recv_non_internal(
    rx: &mut tokio::sync::mpsc::Receiver<LogEntry>,
) -> Option<LogEntry> {
    // The relay logs its own connect transitions under service "log";
    // tests usually care about everything else.
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(e)) if e.service == "log" => continue,
            Ok(Some(e)) => return Some(e),
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_entries_ship_in_order_while_connected() {
    let (client, link, mut remote) = ChannelClient::new("log");
    let (relay, handle) = Relay::new(
        Some(client as Arc<dyn Client>),
        Some(link.connect_rx),
        LogLevel::Debug,
        None,
        false,
    );
    tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logger = handle.logger("qan");
    for i in 0..5 {
        logger.info(format!("entry {i}"));
    }
    for i in 0..5 {
        let e = recv_non_internal(&mut remote.entry_rx).await.unwrap();
        assert_eq!(e.msg, format!("entry {i}"), "enqueue order preserved");
    }
}

#[tokio::test]
async fn test_disconnect_buffers_and_reconnect_flushes() {
    let (client, link, mut remote) = ChannelClient::new("log");
    let (relay, handle) = Relay::new(
        Some(Arc::clone(&client) as Arc<dyn Client>),
        Some(link.connect_rx),
        LogLevel::Debug,
        None,
        false,
    );
    tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logger = handle.logger("agent");
    for i in 0..3 {
        logger.warn(format!("offline {i}"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nothing shipped while disconnected (drain the pre-disconnect
    // internals first).
    while remote.entry_rx.try_recv().is_ok() {}

    client.connect();

    // Raw wire order, no filtering: the buffered entries (including the
    // relay's own buffered "connected: false" note, first to enter the
    // buffer) drain first; the live "connected: true" note ships only
    // after the flush completes.
    let mut raw = Vec::new();
    loop {
        match timeout(Duration::from_secs(2), remote.entry_rx.recv()).await {
            Ok(Some(e)) => {
                let is_live_note = e.msg == "connected: true";
                raw.push(e.msg);
                if is_live_note {
                    break;
                }
            }
            _ => break,
        }
    }
    assert_eq!(
        raw,
        vec![
            "connected: false",
            "offline 0",
            "offline 1",
            "offline 2",
            "connected: true",
        ],
        "flushed buffers precede the live connected note"
    );
}

#[tokio::test]
async fn test_overflow_yields_lost_count_entry() {
    let (client, link, mut remote) = ChannelClient::new("log");
    let (relay, handle) = Relay::new(
        Some(Arc::clone(&client) as Arc<dyn Client>),
        Some(link.connect_rx),
        LogLevel::Debug,
        None,
        false,
    );
    tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logger = handle.logger("agent");
    // Overfill both tiers: 2*BUFFER_SIZE retained, the rest tallied.
    let total = 2 * BUFFER_SIZE + 3;
    for i in 0..total {
        logger.info(format!("e{i}"));
        // The relay channel is bounded; give the consumer room.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    while remote.entry_rx.try_recv().is_ok() {}
    client.connect();

    let mut msgs = Vec::new();
    loop {
        match timeout(Duration::from_millis(500), remote.entry_rx.recv()).await {
            Ok(Some(e)) => msgs.push(e.msg),
            _ => break,
        }
    }
    // 23 app entries plus the relay's own "connected: false" note were
    // buffered; 2*BUFFER_SIZE survive, 4 are tallied as lost. The raw
    // wire order is: first tier, lost warning, sliding window, and the
    // live "connected: true" note strictly last.
    assert_eq!(msgs.len(), 2 * BUFFER_SIZE + 2, "got: {msgs:?}");
    assert_eq!(msgs[0], "connected: false", "first entry buffered leads");
    assert_eq!(msgs[1], "e0", "first tier preserves the earliest entries");
    assert_eq!(msgs[BUFFER_SIZE - 1], format!("e{}", BUFFER_SIZE - 2));
    assert_eq!(msgs[BUFFER_SIZE], "Lost 4 log entries");
    assert_eq!(
        msgs[msgs.len() - 2],
        format!("e{}", total - 1),
        "sliding window ends at the most recent entry"
    );
    assert_eq!(
        msgs.last().unwrap().as_str(),
        "connected: true",
        "the live note ships only after the buffers drain"
    );
}

#[tokio::test]
async fn test_level_change_filters_verbose_entries() {
    let (client, link, mut remote) = ChannelClient::new("log");
    let (relay, handle) = Relay::new(
        Some(client as Arc<dyn Client>),
        Some(link.connect_rx),
        LogLevel::Debug,
        None,
        false,
    );
    tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.set_level(LogLevel::Warning);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logger = handle.logger("mm");
    logger.debug("too chatty");
    logger.error("this matters");

    let e = recv_non_internal(&mut remote.entry_rx).await.unwrap();
    assert_eq!(e.msg, "this matters", "debug entry was filtered");
}

#[tokio::test]
async fn test_file_sink_receives_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("agent.log");
    let (relay, handle) = Relay::new(
        None,
        None,
        LogLevel::Debug,
        Some(path.to_str().unwrap().to_string()),
        true,
    );
    tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.logger("qan").info("to the file");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("to the file"));
    assert!(contents.contains("qan"));
    assert!(contents.contains("info"));
}
