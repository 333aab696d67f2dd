use std::sync::{Arc, RwLock};

use pxw_core::{Address, PxwError, PxwResult};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::decoder::Decoder;
use crate::ledger::PixelWallLedger;

/// Stroke counters of one canvas. `None` means "not decrypted", which is
/// distinct from a decrypted zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CanvasStats {
    pub total: Option<u64>,
    pub own: Option<u64>,
}

/// Reads the global and caller-scoped encrypted stroke counters.
///
/// Reads run one at a time and each one is published to [`watch`]ers, so
/// the latest value never goes backwards.
///
/// [`watch`]: StatsReader::watch
pub struct StatsReader {
    ledger: Arc<dyn PixelWallLedger>,
    canvas_id: u64,
    user: Address,
    decoder: RwLock<Option<Decoder>>,
    reading: Mutex<()>,
    latest: watch::Sender<CanvasStats>,
}

impl StatsReader {
    pub fn new(ledger: Arc<dyn PixelWallLedger>, canvas_id: u64, user: Address) -> Self {
        Self {
            ledger,
            canvas_id,
            user,
            decoder: RwLock::new(None),
            reading: Mutex::new(()),
            latest: watch::Sender::new(CanvasStats::default()),
        }
    }

    /// Result of the last completed read.
    pub fn latest(&self) -> CanvasStats {
        *self.latest.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<CanvasStats> {
        self.latest.subscribe()
    }

    pub fn set_decryption(&self, decoder: Option<Decoder>) {
        *self.decoder.write().unwrap_or_else(|e| e.into_inner()) = decoder;
    }

    /// Fetch both counters and, with `decrypt`, decode them in one batch.
    ///
    /// Asking to decrypt before a decoder is installed fails with
    /// [`PxwError::NotReady`].
    pub async fn refresh(&self, decrypt: bool, force_new: bool) -> PxwResult<CanvasStats> {
        let decoder = if decrypt {
            let decoder = self.decoder.read().unwrap_or_else(|e| e.into_inner()).clone();
            Some(decoder.ok_or(PxwError::NotReady)?)
        } else {
            None
        };

        let _reading = self.reading.lock().await;
        let total = self.ledger.canvas_stroke_count(self.canvas_id).await?;
        let own = self.ledger.painter_contribution(self.canvas_id, &self.user).await?;

        let Some(decoder) = decoder else {
            self.latest.send_replace(CanvasStats::default());
            return Ok(CanvasStats::default());
        };

        let values = decoder.decode([total, own], force_new).await?;
        // the zero handle is a counter that was never written
        let read = |h: pxw_core::Handle| {
            if h.is_zero() {
                Some(0)
            } else {
                values.get(&h).copied()
            }
        };
        let stats = CanvasStats {
            total: read(total),
            own: read(own),
        };
        debug!(canvas_id = self.canvas_id, ?stats, "stroke counters decoded");
        self.latest.send_replace(stats);
        Ok(stats)
    }
}
