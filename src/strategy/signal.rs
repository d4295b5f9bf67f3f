//! Where trade intents come from.
//!
//! Signal generation itself is out of scope for the agent core; a source
//! only has to yield [`TradeIntent`]s. Two are provided: an in-process
//! channel and newline-delimited JSON (stdin in the runtime).

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::TradeIntent;

#[async_trait]
pub trait SignalSource: Send {
    /// Next intent, or `None` once the source is exhausted
    async fn next_intent(&mut self) -> Option<TradeIntent>;
}

pub struct ChannelSignalSource {
    rx: mpsc::Receiver<TradeIntent>,
}

impl ChannelSignalSource {
    pub fn new(rx: mpsc::Receiver<TradeIntent>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<TradeIntent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_intent(&mut self) -> Option<TradeIntent> {
        self.rx.recv().await
    }
}

/// One JSON-encoded intent per line. Blank and malformed lines are skipped.
pub struct JsonLinesSignalSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSignalSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SignalSource for JsonLinesSignalSource<R> {
    async fn next_intent(&mut self) -> Option<TradeIntent> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("signal input failed: {}", e);
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeIntent>(line) {
                Ok(intent) => return Some(intent),
                Err(e) => warn!(line, "unparseable intent skipped: {}", e),
            }
        }
    }
}
