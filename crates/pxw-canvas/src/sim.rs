//! In-process ledger over the simulation backend.
//!
//! Every transaction mines its own block; events inside a block are indexed
//! from zero, so `(block, index)` is a total order. The ledger also answers
//! the node RPC calls the lifecycle manager probes, which lets a whole
//! session run against it with no network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use pxw_core::{Address, CanvasMeta, EncryptedInput, Handle, LogPosition, PxwError, PxwResult};
use pxw_fhe::{unix_now, MockCoprocessor, RpcClient, SimulationMetadata};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::ledger::{EventLog, EventStream, LedgerEvent, LiveEvent, PixelUpdate, PixelView, PixelWallLedger};

/// Largest width or height a canvas may be created with.
pub const MAX_DIMENSION: u32 = 1024;

const CLIENT_VERSION: &str = "HardhatNetwork/2.22.0/pxw-sim";
const EVENT_BUFFER: usize = 256;

struct CanvasState {
    creator: Address,
    meta: CanvasMeta,
    pixels: HashMap<(u32, u32), PixelView>,
    strokes: Handle,
    contributions: HashMap<Address, Handle>,
}

#[derive(Default)]
struct LedgerState {
    block: u64,
    next_canvas_id: u64,
    next_token_id: u64,
    canvases: BTreeMap<u64, CanvasState>,
    log: Vec<LedgerEvent>,
}

impl LedgerState {
    fn canvas(&self, canvas_id: u64) -> PxwResult<&CanvasState> {
        self.canvases
            .get(&canvas_id)
            .ok_or_else(|| PxwError::Ledger(format!("canvas {canvas_id} does not exist")))
    }

    fn canvas_mut(&mut self, canvas_id: u64) -> PxwResult<&mut CanvasState> {
        self.canvases
            .get_mut(&canvas_id)
            .ok_or_else(|| PxwError::Ledger(format!("canvas {canvas_id} does not exist")))
    }

    fn head(&self) -> LogPosition {
        self.log.last().map(LedgerEvent::position).unwrap_or_default()
    }

    /// Open a new block; the first event in it gets index 0.
    fn mine(&mut self) -> LogPosition {
        self.block += 1;
        LogPosition::new(self.block, 0)
    }
}

pub struct SimulatedLedger {
    contract: Address,
    chain_id: u64,
    coprocessor: Arc<MockCoprocessor>,
    metadata: SimulationMetadata,
    state: Mutex<LedgerState>,
    events: broadcast::Sender<LedgerEvent>,
}

impl SimulatedLedger {
    pub fn new(
        chain_id: u64,
        contract: Address,
        coprocessor: Arc<MockCoprocessor>,
        metadata: SimulationMetadata,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            contract,
            chain_id,
            coprocessor,
            metadata,
            state: Mutex::new(LedgerState {
                next_canvas_id: 1,
                next_token_id: 1,
                ..Default::default()
            }),
            events,
        }
    }

    /// Events buffered per subscriber before a slow one starts losing them.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = broadcast::channel(capacity.max(1)).0;
        self
    }

    pub fn metadata(&self) -> &SimulationMetadata {
        &self.metadata
    }

    pub fn coprocessor(&self) -> &Arc<MockCoprocessor> {
        &self.coprocessor
    }

    /// Number of blocks mined so far.
    pub fn block_number(&self) -> u64 {
        self.lock().block
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, state: &mut LedgerState, event: LedgerEvent) {
        state.log.push(event.clone());
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PixelWallLedger for SimulatedLedger {
    fn contract(&self) -> Address {
        self.contract
    }

    async fn canvas_meta(&self, canvas_id: u64) -> PxwResult<CanvasMeta> {
        Ok(self.lock().canvas(canvas_id)?.meta.clone())
    }

    async fn pixel_view(&self, canvas_id: u64, x: u32, y: u32) -> PxwResult<PixelView> {
        let state = self.lock();
        let canvas = state.canvas(canvas_id)?;
        if !canvas.meta.contains(x, y) {
            return Err(PxwError::Ledger(format!("({x}, {y}) is outside canvas {canvas_id}")));
        }
        Ok(canvas.pixels.get(&(x, y)).copied().unwrap_or(PixelView {
            handle: Handle::ZERO,
            painter: Address::ZERO,
            updated_at: 0,
        }))
    }

    async fn canvas_stroke_count(&self, canvas_id: u64) -> PxwResult<Handle> {
        Ok(self.lock().canvas(canvas_id)?.strokes)
    }

    async fn painter_contribution(&self, canvas_id: u64, painter: &Address) -> PxwResult<Handle> {
        let state = self.lock();
        let canvas = state.canvas(canvas_id)?;
        Ok(canvas.contributions.get(painter).copied().unwrap_or(Handle::ZERO))
    }

    async fn query_pixel_updates(&self, canvas_id: u64, from_block: u64) -> PxwResult<EventLog> {
        let state = self.lock();
        let events = state
            .log
            .iter()
            .filter_map(|e| match e {
                LedgerEvent::PixelUpdated(u) if u.canvas_id == canvas_id && u.position.block >= from_block => {
                    Some(u.clone())
                }
                _ => None,
            })
            .collect();
        Ok(EventLog {
            events,
            head: state.head(),
        })
    }

    fn subscribe_pixel_updates(&self) -> EventStream {
        let stream = BroadcastStream::new(self.events.subscribe()).map(|item| match item {
            Ok(event) => LiveEvent::Event(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "ledger subscriber lagged, events dropped");
                LiveEvent::Lagged { skipped }
            }
        });
        Box::pin(stream)
    }

    async fn create_canvas(&self, from: &Address, width: u32, height: u32) -> PxwResult<u64> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(PxwError::Ledger(format!(
                "canvas dimensions {width}x{height} outside 1..={MAX_DIMENSION}"
            )));
        }
        let mut state = self.lock();
        let canvas_id = state.next_canvas_id;
        state.next_canvas_id += 1;
        let position = state.mine();
        state.canvases.insert(
            canvas_id,
            CanvasState {
                creator: *from,
                meta: CanvasMeta {
                    width,
                    height,
                    created_at: unix_now(),
                    ..Default::default()
                },
                pixels: HashMap::new(),
                strokes: Handle::ZERO,
                contributions: HashMap::new(),
            },
        );
        self.emit(
            &mut state,
            LedgerEvent::CanvasCreated {
                canvas_id,
                width,
                height,
                position,
            },
        );
        debug!(canvas_id, width, height, creator = %from, "canvas created");
        Ok(canvas_id)
    }

    async fn set_pixel(
        &self,
        from: &Address,
        canvas_id: u64,
        x: u32,
        y: u32,
        input: &EncryptedInput,
    ) -> PxwResult<LogPosition> {
        let mut state = self.lock();
        {
            let canvas = state.canvas(canvas_id)?;
            if canvas.meta.is_locked {
                return Err(PxwError::Ledger(format!("canvas {canvas_id} is locked")));
            }
            if !canvas.meta.contains(x, y) {
                return Err(PxwError::Ledger(format!("({x}, {y}) is outside canvas {canvas_id}")));
            }
        }
        if !self.coprocessor.verify_input(input, &self.contract, from) {
            return Err(PxwError::Ledger("input proof rejected".into()));
        }

        let (strokes, contribution) = {
            let canvas = state.canvas(canvas_id)?;
            let own = canvas.contributions.get(from).copied().unwrap_or(Handle::ZERO);
            (
                self.coprocessor.add_scalar(&canvas.strokes, 1, &self.contract)?,
                self.coprocessor.add_scalar(&own, 1, &self.contract)?,
            )
        };

        let position = state.mine();
        let timestamp = unix_now();
        let canvas = state.canvas_mut(canvas_id)?;
        canvas.pixels.insert(
            (x, y),
            PixelView {
                handle: input.handle,
                painter: *from,
                updated_at: timestamp,
            },
        );
        canvas.strokes = strokes;
        canvas.contributions.insert(*from, contribution);

        self.emit(
            &mut state,
            LedgerEvent::PixelUpdated(PixelUpdate {
                canvas_id,
                x,
                y,
                painter: *from,
                handle: input.handle,
                timestamp,
                position,
            }),
        );
        Ok(position)
    }

    async fn lock_canvas(&self, from: &Address, canvas_id: u64) -> PxwResult<()> {
        let mut state = self.lock();
        {
            let canvas = state.canvas(canvas_id)?;
            if canvas.creator != *from {
                return Err(PxwError::Ledger(format!("only the creator may lock canvas {canvas_id}")));
            }
            if canvas.meta.is_locked {
                return Err(PxwError::Ledger(format!("canvas {canvas_id} is already locked")));
            }
        }
        state.mine();
        let canvas = state.canvas_mut(canvas_id)?;
        canvas.meta.is_locked = true;
        canvas.meta.locked_at = unix_now();
        debug!(canvas_id, "canvas locked");
        Ok(())
    }

    async fn mint_canvas(&self, from: &Address, canvas_id: u64, cid: &str) -> PxwResult<Option<u64>> {
        let mut state = self.lock();
        {
            let canvas = state.canvas(canvas_id)?;
            if canvas.creator != *from {
                return Err(PxwError::Ledger(format!("only the creator may mint canvas {canvas_id}")));
            }
            if !canvas.meta.is_locked {
                return Err(PxwError::Ledger(format!("canvas {canvas_id} must be locked before minting")));
            }
            if canvas.meta.minted_token_id.is_some() {
                return Err(PxwError::Ledger(format!("canvas {canvas_id} is already minted")));
            }
        }
        let token_id = state.next_token_id;
        state.next_token_id += 1;
        let position = state.mine();
        state.canvas_mut(canvas_id)?.meta.minted_token_id = Some(token_id);
        self.emit(
            &mut state,
            LedgerEvent::CanvasMinted {
                canvas_id,
                token_id,
                cid: cid.to_string(),
                position,
            },
        );
        debug!(canvas_id, token_id, cid, "canvas minted");
        Ok(Some(token_id))
    }
}

#[async_trait]
impl RpcClient for SimulatedLedger {
    fn url(&self) -> Option<String> {
        None
    }

    async fn chain_id(&self) -> PxwResult<u64> {
        Ok(self.chain_id)
    }

    async fn client_version(&self) -> PxwResult<String> {
        Ok(CLIENT_VERSION.to_string())
    }

    async fn relayer_metadata(&self) -> PxwResult<Value> {
        serde_json::to_value(self.metadata).map_err(|e| PxwError::Other(e.into()))
    }
}
