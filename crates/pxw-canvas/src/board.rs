//! Canvas reconstruction from the pixel event log.
//!
//! A [`Board`] is rebuilt wholesale by [`CanvasReconstructor::refresh`] and
//! patched one cell at a time by the live subscription. The two paths are
//! ordered by:
//!
//! - refresh tickets: each refresh takes a ticket and commits only if no
//!   newer refresh has already committed
//! - log positions: a cell is only overwritten by a write later in the
//!   ledger's order, whichever path delivers it
//! - the patch journal: patches applied while a refresh is in flight are
//!   replayed onto its snapshot if they are newer than the snapshot's head

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::StreamExt;
use pxw_core::{Cell, Handle, LogPosition, PxwError, PxwResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::color::format_color;
use crate::decoder::Decoder;
use crate::ledger::{LedgerEvent, LiveEvent, PixelUpdate, PixelWallLedger};

/// Decoded canvas state, keyed by `(row, column)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Board {
    cells: BTreeMap<(u32, u32), Cell>,
    head: LogPosition,
    generation: u64,
}

impl Board {
    pub fn get(&self, x: u32, y: u32) -> Option<&Cell> {
        self.cells.get(&(y, x))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Last log position reflected in the board.
    pub fn head(&self) -> LogPosition {
        self.head
    }

    /// Ticket of the refresh that built this board; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cells in display order: row, then column.
    pub fn ordered_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Write `cell` unless the board already holds a later write for that
    /// coordinate. Returns whether the board changed.
    pub fn apply(&mut self, cell: Cell) -> bool {
        let key = (cell.y, cell.x);
        if let Some(existing) = self.cells.get(&key) {
            if existing.position >= cell.position {
                return false;
            }
        }
        self.head = self.head.max(cell.position);
        self.cells.insert(key, cell);
        true
    }

    /// Replay `events` in log order. A handle missing from `colors` leaves
    /// the cell's colour pending.
    pub fn from_events(events: &[PixelUpdate], colors: &HashMap<Handle, u64>) -> Self {
        let mut board = Board::default();
        for event in events {
            board.apply(cell_from(event, colors.get(&event.handle).copied()));
        }
        board
    }
}

fn cell_from(update: &PixelUpdate, value: Option<u64>) -> Cell {
    Cell {
        x: update.x,
        y: update.y,
        handle: update.handle,
        painter: update.painter,
        updated_at: update.timestamp,
        color: value.map(format_color),
        position: update.position,
    }
}

struct ReconState {
    board: Board,
    next_ticket: u64,
    committed: u64,
    in_flight: usize,
    /// Live patches applied while at least one refresh was in flight.
    journal: Vec<Cell>,
}

struct Inner {
    ledger: Arc<dyn PixelWallLedger>,
    canvas_id: u64,
    decoder: RwLock<Option<Decoder>>,
    state: Mutex<ReconState>,
    live: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ReconState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decoder(&self) -> Option<Decoder> {
        self.decoder.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Decrements the in-flight refresh count however the refresh ends,
/// dropping the journal once nothing is in flight.
struct RefreshGuard<'a> {
    inner: &'a Inner,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.inner.state();
        st.in_flight = st.in_flight.saturating_sub(1);
        if st.in_flight == 0 {
            st.journal.clear();
        }
    }
}

/// Owns the board of one canvas and its single live subscription.
#[derive(Clone)]
pub struct CanvasReconstructor {
    inner: Arc<Inner>,
}

impl CanvasReconstructor {
    pub fn new(ledger: Arc<dyn PixelWallLedger>, canvas_id: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                canvas_id,
                decoder: RwLock::new(None),
                state: Mutex::new(ReconState {
                    board: Board::default(),
                    next_ticket: 1,
                    committed: 0,
                    in_flight: 0,
                    journal: Vec::new(),
                }),
                live: Mutex::new(None),
            }),
        }
    }

    pub fn canvas_id(&self) -> u64 {
        self.inner.canvas_id
    }

    /// Install or remove the decoder. While one is installed, decrypting
    /// refreshes are possible and every live patch is decoded.
    pub fn set_decryption(&self, decoder: Option<Decoder>) {
        *self.inner.decoder.write().unwrap_or_else(|e| e.into_inner()) = decoder;
    }

    pub fn board(&self) -> Board {
        self.inner.state().board.clone()
    }

    /// Rebuild the board from the full event log.
    ///
    /// With `decrypt`, every distinct non-zero handle is decoded in one
    /// batch. The result replaces the board atomically unless a newer
    /// refresh committed first, in which case the current board is returned
    /// unchanged.
    pub async fn refresh(&self, decrypt: bool, force_new: bool) -> PxwResult<Board> {
        let inner = &*self.inner;
        let decoder = if decrypt {
            Some(inner.decoder().ok_or(PxwError::NotReady)?)
        } else {
            None
        };

        let ticket = {
            let mut st = inner.state();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.in_flight += 1;
            ticket
        };
        let _guard = RefreshGuard { inner };

        let log = inner.ledger.query_pixel_updates(inner.canvas_id, 0).await?;
        let colors = match &decoder {
            Some(decoder) if !log.events.is_empty() => {
                decoder
                    .decode(log.events.iter().map(|e| e.handle), force_new)
                    .await?
            }
            _ => HashMap::new(),
        };

        let mut board = Board::from_events(&log.events, &colors);
        board.head = board.head.max(log.head);
        board.generation = ticket;

        let mut st = inner.state();
        if ticket <= st.committed {
            debug!(ticket, committed = st.committed, "discarding superseded canvas refresh");
            return Ok(st.board.clone());
        }
        let mut replayed = 0usize;
        for cell in st.journal.iter().filter(|c| c.position > log.head) {
            if board.apply(cell.clone()) {
                replayed += 1;
            }
        }
        st.committed = ticket;
        st.board = board;
        info!(
            canvas_id = inner.canvas_id,
            ticket,
            cells = st.board.len(),
            events = log.events.len(),
            replayed,
            decrypt,
            "canvas refreshed"
        );
        Ok(st.board.clone())
    }

    /// Patch one live event into the board. Returns the cell written, or
    /// `None` when the board already holds a later write for it.
    pub async fn apply_update(&self, update: &PixelUpdate) -> PxwResult<Option<Cell>> {
        let inner = &*self.inner;
        if update.canvas_id != inner.canvas_id {
            return Ok(None);
        }

        let value = match inner.decoder() {
            Some(decoder) if !update.handle.is_zero() => {
                match decoder.decode([update.handle], false).await {
                    Ok(values) => values.get(&update.handle).copied(),
                    Err(e) => {
                        warn!(x = update.x, y = update.y, "live pixel decode failed: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        let cell = cell_from(update, value);
        let mut st = inner.state();
        if !st.board.apply(cell.clone()) {
            return Ok(None);
        }
        if st.in_flight > 0 {
            st.journal.push(cell.clone());
        }
        Ok(Some(cell))
    }

    /// Follow the ledger's live stream, patching each pixel event for this
    /// canvas and passing the written cell to `on_update`. When the stream
    /// reports lost events the board is rebuilt from the log instead.
    ///
    /// Replaces any earlier subscription of this reconstructor.
    pub fn subscribe_live<F>(&self, on_update: F) -> LiveSubscription
    where
        F: Fn(&Cell) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        {
            let mut live = self.inner.live.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = live.replace(cancel.clone()) {
                debug!(canvas_id = self.inner.canvas_id, "replacing live subscription");
                previous.cancel();
            }
        }

        let mut stream = self.inner.ledger.subscribe_pixel_updates();
        let recon = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = stream.next() => event,
                };
                match event {
                    Some(LiveEvent::Event(LedgerEvent::PixelUpdated(update))) => {
                        match recon.apply_update(&update).await {
                            Ok(Some(cell)) => on_update(&cell),
                            Ok(None) => {}
                            Err(e) => warn!("live pixel update failed: {e}"),
                        }
                    }
                    Some(LiveEvent::Event(_)) => {}
                    Some(LiveEvent::Lagged { skipped }) => {
                        let decrypt = recon.inner.decoder().is_some();
                        info!(canvas_id = recon.inner.canvas_id, skipped, "live stream lagged, resyncing board");
                        if let Err(e) = recon.refresh(decrypt, false).await {
                            warn!("canvas resync failed: {e}");
                        }
                    }
                    None => {
                        debug!(canvas_id = recon.inner.canvas_id, "ledger event stream ended");
                        break;
                    }
                }
            }
        });

        LiveSubscription {
            cancel,
            task: Some(task),
        }
    }
}

/// Handle to a running live subscription. Dropping it unsubscribes.
pub struct LiveSubscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the subscription and wait for its task to exit.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("live subscription task failed: {e}");
            }
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
