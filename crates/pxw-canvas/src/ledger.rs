//! The ledger contract surface the canvas consumes.
//!
//! Reads return ciphertext handles only. The write side submits proven
//! encrypted inputs and returns the log position of the resulting event so
//! callers can order their own writes against the live stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use pxw_core::{Address, CanvasMeta, EncryptedInput, Handle, LogPosition, PxwResult};
use serde::{Deserialize, Serialize};

/// Current state of one coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelView {
    pub handle: Handle,
    pub painter: Address,
    pub updated_at: u64,
}

/// A `PixelUpdated` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelUpdate {
    pub canvas_id: u64,
    pub x: u32,
    pub y: u32,
    pub painter: Address,
    pub handle: Handle,
    pub timestamp: u64,
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LedgerEvent {
    PixelUpdated(PixelUpdate),
    CanvasCreated {
        canvas_id: u64,
        width: u32,
        height: u32,
        position: LogPosition,
    },
    CanvasMinted {
        canvas_id: u64,
        token_id: u64,
        cid: String,
        position: LogPosition,
    },
}

impl LedgerEvent {
    pub fn canvas_id(&self) -> u64 {
        match self {
            LedgerEvent::PixelUpdated(u) => u.canvas_id,
            LedgerEvent::CanvasCreated { canvas_id, .. } | LedgerEvent::CanvasMinted { canvas_id, .. } => {
                *canvas_id
            }
        }
    }

    pub fn position(&self) -> LogPosition {
        match self {
            LedgerEvent::PixelUpdated(u) => u.position,
            LedgerEvent::CanvasCreated { position, .. } | LedgerEvent::CanvasMinted { position, .. } => {
                *position
            }
        }
    }
}

/// Result of a historical query: matching pixel events in log order, plus the
/// position of the last event the ledger had emitted when it answered.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    pub events: Vec<PixelUpdate>,
    pub head: LogPosition,
}

/// Item of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Event(LedgerEvent),
    /// The subscriber fell behind and `skipped` events were dropped; state
    /// built from the stream must be re-read from the log.
    Lagged { skipped: u64 },
}

pub type EventStream = Pin<Box<dyn Stream<Item = LiveEvent> + Send>>;

#[async_trait]
pub trait PixelWallLedger: Send + Sync {
    /// Address of the canvas contract; ciphertext ACLs are bound to it.
    fn contract(&self) -> Address;

    async fn canvas_meta(&self, canvas_id: u64) -> PxwResult<CanvasMeta>;

    async fn pixel_view(&self, canvas_id: u64, x: u32, y: u32) -> PxwResult<PixelView>;

    /// Encrypted count of every stroke on the canvas. Zero handle when none.
    async fn canvas_stroke_count(&self, canvas_id: u64) -> PxwResult<Handle>;

    /// Encrypted count of `painter`'s strokes on the canvas.
    async fn painter_contribution(&self, canvas_id: u64, painter: &Address) -> PxwResult<Handle>;

    /// `PixelUpdated` events for `canvas_id` from `from_block` onwards.
    async fn query_pixel_updates(&self, canvas_id: u64, from_block: u64) -> PxwResult<EventLog>;

    /// Live stream of every event emitted after the call, with a
    /// [`LiveEvent::Lagged`] marker wherever events were lost.
    fn subscribe_pixel_updates(&self) -> EventStream;

    async fn create_canvas(&self, from: &Address, width: u32, height: u32) -> PxwResult<u64>;

    async fn set_pixel(
        &self,
        from: &Address,
        canvas_id: u64,
        x: u32,
        y: u32,
        input: &EncryptedInput,
    ) -> PxwResult<LogPosition>;

    async fn lock_canvas(&self, from: &Address, canvas_id: u64) -> PxwResult<()>;

    /// Mint a snapshot of a locked canvas. Returns the token id carried by
    /// the `CanvasMinted` event, if one was emitted.
    async fn mint_canvas(&self, from: &Address, canvas_id: u64, cid: &str) -> PxwResult<Option<u64>>;
}
