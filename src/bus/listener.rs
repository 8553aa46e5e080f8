use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::bus::messages::parse_change_frame;
use crate::bus::ChangeBus;
use crate::config::{RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS};
use crate::error::Result;

/// Owns the persistent WebSocket to the change-notification service and
/// republishes parsed notifications onto the in-process bus.
pub struct BusListener {
    ws_url: String,
    tables: Vec<String>,
    bus: Arc<ChangeBus>,
    health: Arc<HealthState>,
    shutdown_rx: watch::Receiver<bool>,
    /// Total frames received since process start (flow diagnostics).
    frames_received: AtomicU64,
    /// Notifications successfully parsed and published.
    notifications_published: AtomicU64,
}

impl BusListener {
    pub fn new(
        ws_url: String,
        tables: Vec<String>,
        bus: Arc<ChangeBus>,
        health: Arc<HealthState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ws_url,
            tables,
            bus,
            health,
            shutdown_rx,
            frames_received: AtomicU64::new(0),
            notifications_published: AtomicU64::new(0),
        }
    }

    pub async fn run(mut self) {
        let mut backoff_idx = 0usize;

        loop {
            if *self.shutdown_rx.borrow() {
                info!("bus listener stopped");
                return;
            }

            info!("bus connecting to {}", self.ws_url);
            match self.connect_once().await {
                Ok(true) => {
                    self.health.set_bus_connected(false);
                    info!("bus listener stopped");
                    return;
                }
                Ok(false) => {
                    info!("bus connection closed cleanly");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("bus connection error: {e}");
                }
            }
            self.health.set_bus_connected(false);

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .copied()
                .unwrap_or(*RECONNECT_BACKOFF_MS.last().unwrap());
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

            warn!("bus reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// One connection lifetime. Returns Ok(true) when shutdown was
    /// requested, Ok(false) when the server closed cleanly.
    async fn connect_once(&mut self) -> Result<bool> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Re-subscribing on every (re)connect keeps the table set and the
        // connection lifetime paired — a reconnect can never leave a table
        // silently unwatched.
        for table in &self.tables {
            let join = build_join_frame(table);
            write.send(Message::Text(join.into())).await?;
            debug!(table, "bus table subscription sent");
        }
        info!("bus subscribed to {} table(s)", self.tables.len());
        self.health.set_bus_connected(true);

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(false);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("bus ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let total_frames = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
        if total_frames % 500 == 0 {
            let published = self.notifications_published.load(Ordering::Relaxed);
            info!(
                frames = total_frames,
                published,
                "[BUS] {total_frames} frames | {published} notifications published"
            );
        }

        for notification in parse_change_frame(text) {
            let delivered = self.bus.publish(&notification);
            self.notifications_published.fetch_add(1, Ordering::Relaxed);
            debug!(
                table = %notification.table,
                event = %notification.event,
                delivered,
                "change notification published"
            );
        }
    }
}

/// Build a per-table subscription frame for the notification service.
fn build_join_frame(table: &str) -> String {
    serde_json::json!({
        "action": "subscribe",
        "table": table,
        "event": "*"
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_carries_table_and_wildcard() {
        let frame = build_join_frame("markets");
        let v: serde_json::Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(v["action"], "subscribe");
        assert_eq!(v["table"], "markets");
        assert_eq!(v["event"], "*");
    }
}
