//! OKX public WebSocket adapter for the `tickers` channel.
//!
//! Feeds [`FeedMessage`]s into an mpsc channel. Reconnects with exponential
//! backoff and resubscribes; after `max_reconnect_attempts` consecutive
//! failures it sends `Lost` and stops.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::okx_rest::parse_ticker;
use crate::config::FeedConfig;
use crate::coordination::ShutdownToken;
use crate::domain::MarketConditions;
use crate::error::{KeeperError, Result};
use crate::exchange::ExponentialBackoff;
use crate::strategy::feeds::FeedMessage;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// One decoded text frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Tickers(Vec<MarketConditions>),
    Pong,
    Subscribed(String),
    Error(String),
    Other,
}

pub fn subscribe_message(pairs: &[String]) -> String {
    let args: Vec<Value> = pairs
        .iter()
        .map(|p| json!({ "channel": "tickers", "instId": p }))
        .collect();
    json!({ "op": "subscribe", "args": args }).to_string()
}

pub fn parse_frame(text: &str) -> FeedFrame {
    if text == "pong" {
        return FeedFrame::Pong;
    }
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return FeedFrame::Other;
    };

    match value.get("event").and_then(Value::as_str) {
        Some("subscribe") => {
            let pair = value
                .pointer("/arg/instId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return FeedFrame::Subscribed(pair.to_string());
        }
        Some("error") => {
            let code = value.get("code").and_then(Value::as_str).unwrap_or("");
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or("");
            return FeedFrame::Error(format!("{}: {}", code, msg));
        }
        Some(_) => return FeedFrame::Other,
        None => {}
    }

    if value.pointer("/arg/channel").and_then(Value::as_str) != Some("tickers") {
        return FeedFrame::Other;
    }
    let tickers = value
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match parse_ticker(item) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!("malformed ticker dropped: {}", e);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    FeedFrame::Tickers(tickers)
}

/// How a streaming session ended
enum SessionEnd {
    Shutdown,
    /// Dropped after delivering data; reconnect with a fresh backoff
    Dropped(String),
}

pub struct OkxTickerFeed {
    url: String,
    pairs: Vec<String>,
    config: FeedConfig,
}

impl OkxTickerFeed {
    pub fn new(url: &str, pairs: Vec<String>, config: FeedConfig) -> Self {
        Self {
            url: url.to_string(),
            pairs,
            config,
        }
    }

    /// Stream until shutdown or until reconnects are exhausted
    pub async fn run(&self, tx: mpsc::Sender<FeedMessage>, mut shutdown: ShutdownToken) {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(self.config.reconnect_base_delay_ms),
            Duration::from_millis(self.config.reconnect_max_delay_ms),
            0.25,
        );
        let mut connected_before = false;
        info!(pairs = ?self.pairs, "starting ticker feed");

        loop {
            match self.session(&tx, &mut shutdown, connected_before).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("ticker feed stopped");
                    return;
                }
                Ok(SessionEnd::Dropped(reason)) => {
                    connected_before = true;
                    backoff.reset();
                    warn!(%reason, "ticker feed dropped, reconnecting");
                }
                Err(e) => {
                    error!(attempt = backoff.attempt() + 1, "ticker feed error: {}", e);
                }
            }

            if backoff.attempt() >= self.config.max_reconnect_attempts {
                let reason = format!(
                    "{} reconnect attempts exhausted",
                    self.config.max_reconnect_attempts
                );
                error!(%reason, "ticker feed lost");
                let _ = tx.send(FeedMessage::Lost(reason)).await;
                return;
            }

            let delay = backoff.next_delay();
            info!(
                "reconnecting ticker feed in {:?} (attempt {}/{})",
                delay,
                backoff.attempt(),
                self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<FeedMessage>,
        shutdown: &mut ShutdownToken,
        connected_before: bool,
    ) -> Result<SessionEnd> {
        let (ws, _) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| KeeperError::FeedLoss("connect timeout".into()))??;
        info!(url = %self.url, "ticker feed connected");

        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(subscribe_message(&self.pairs)))
            .await?;

        let mut ping = interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));
        ping.tick().await;
        let stale_after = Duration::from_secs(self.config.stale_after_secs.max(1));
        let mut last_message = Instant::now();
        let mut delivered = false;

        let dropped = |delivered: bool, reason: String| {
            if delivered {
                Ok(SessionEnd::Dropped(reason))
            } else {
                Err(KeeperError::FeedLoss(reason))
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                msg = read.next() => {
                    last_message = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                            FeedFrame::Tickers(tickers) => {
                                if !delivered {
                                    delivered = true;
                                    if connected_before {
                                        let _ = tx.send(FeedMessage::Reconnected).await;
                                    }
                                }
                                for t in tickers {
                                    if tx.send(FeedMessage::Ticker(t)).await.is_err() {
                                        return Ok(SessionEnd::Shutdown);
                                    }
                                }
                            }
                            FeedFrame::Subscribed(pair) => debug!(%pair, "subscribed"),
                            FeedFrame::Error(e) => {
                                return dropped(delivered, format!("subscription error {}", e));
                            }
                            FeedFrame::Pong | FeedFrame::Other => {}
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return dropped(delivered, format!("pong failed: {}", e));
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return dropped(delivered, "close frame".into());
                        }
                        Some(Err(e)) => return dropped(delivered, e.to_string()),
                        None => return dropped(delivered, "stream ended".into()),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    if last_message.elapsed() > stale_after {
                        return dropped(
                            delivered,
                            format!("no data for {}s", stale_after.as_secs()),
                        );
                    }
                    if let Err(e) = write.send(Message::Text("ping".into())).await {
                        return dropped(delivered, format!("ping failed: {}", e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn subscribe_message_lists_every_pair() {
        let msg = subscribe_message(&["BTC-USDT".to_string(), "ETH-USDT".to_string()]);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][1]["channel"], "tickers");
        assert_eq!(v["args"][1]["instId"], "ETH-USDT");
    }

    #[test]
    fn ticker_frame_is_decoded() {
        let text = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","last":"43000","bidPx":"42999","askPx":"43001","volCcy24h":"5000000","ts":"1704067200000"}]}"#;
        match parse_frame(text) {
            FeedFrame::Tickers(t) => {
                assert_eq!(t.len(), 1);
                assert_eq!(t[0].last, dec!(43000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn control_frames_are_recognized() {
        assert_eq!(parse_frame("pong"), FeedFrame::Pong);
        assert_eq!(
            parse_frame(r#"{"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT"}}"#),
            FeedFrame::Subscribed("BTC-USDT".into())
        );
        assert_eq!(
            parse_frame(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#),
            FeedFrame::Error("60012: Invalid request".into())
        );
        assert_eq!(parse_frame("not json"), FeedFrame::Other);
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_loss() {
        let feed = OkxTickerFeed::new(
            "ws://127.0.0.1:1/ws",
            vec!["BTC-USDT".into()],
            FeedConfig {
                reconnect_base_delay_ms: 1,
                reconnect_max_delay_ms: 2,
                max_reconnect_attempts: 2,
                ping_interval_secs: 20,
                stale_after_secs: 30,
            },
        );
        let shutdown = crate::coordination::GracefulShutdown::with_defaults();
        let (tx, mut rx) = mpsc::channel(8);
        feed.run(tx, shutdown.token()).await;
        assert!(matches!(rx.recv().await, Some(FeedMessage::Lost(_))));
    }
}
