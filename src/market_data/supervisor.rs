// =============================================================================
// Kline-stream supervisor — explicit stop()/subscribe() over the cyclic
// "restart by re-invoking the constructor" gesture the reference used.
// =============================================================================
//
// Each `(symbol, interval)` pair gets its own reconnect-loop task. Symbol
// refresh calls `stop()` then `subscribe(new_symbols)` instead of tearing
// down and rebuilding the whole WebSocket manager object, per spec.md §9's
// design note.
// =============================================================================

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use super::kline_stream::{run_kline_stream, ClosedBar};

const RECONNECT_DELAY_SECS: u64 = 5;

pub struct KlineStreamSupervisor {
    tx: mpsc::Sender<ClosedBar>,
    handles: Vec<JoinHandle<()>>,
}

impl KlineStreamSupervisor {
    pub fn new(tx: mpsc::Sender<ClosedBar>) -> Self {
        Self { tx, handles: Vec::new() }
    }

    /// Spawns one reconnect-loop task per `(symbol, interval)` pair. Call
    /// [`Self::stop`] first if streams are already running for a different
    /// symbol set.
    pub fn subscribe(&mut self, symbols: &[String], intervals: &[String]) {
        for symbol in symbols {
            for interval in intervals {
                let tx = self.tx.clone();
                let symbol = symbol.clone();
                let interval = interval.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        if let Err(e) = run_kline_stream(&symbol, &interval, tx.clone()).await {
                            error!(symbol = %symbol, interval = %interval, error = %e, "kline stream error, reconnecting");
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS))
                            .await;
                    }
                });
                self.handles.push(handle);
            }
        }
    }

    /// Aborts every running stream task. Best-effort: an in-flight read is
    /// simply dropped, matching spec.md §5's "best-effort stream stop".
    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for KlineStreamSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
