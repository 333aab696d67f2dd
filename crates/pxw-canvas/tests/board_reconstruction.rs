//! Integration test: board reconstruction over the simulated ledger.
//!
//! Covers last-writer-wins replay, batched decryption, live patches, the
//! refresh generation guard and the stroke counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use pxw_canvas::{
    CanvasReconstructor, Decoder, EventLog, EventStream, LiveEvent, PixelView, PixelWallLedger, SimulatedLedger,
    StatsReader,
};
use pxw_core::{
    Address, CanvasMeta, EncryptedInput, Handle, HandleRef, LogPosition, PxwError, PxwResult,
};
use pxw_fhe::{
    AuthorizationManager, DecryptionAuthorization, DecryptionKeypair, EncryptionInstance, LocalSigner,
    MockCoprocessor, MockInstance, Signer, SimulationMetadata, TypedData,
};
use tokio::sync::{mpsc, Notify};

const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

fn metadata() -> SimulationMetadata {
    SimulationMetadata {
        acl_address: Address::from_bytes([1u8; 20]),
        input_verifier_address: Address::from_bytes([2u8; 20]),
        kms_verifier_address: Address::from_bytes([3u8; 20]),
    }
}

fn contract() -> Address {
    CONTRACT.parse().unwrap()
}

/// Mock instance that counts batch decrypt calls and their sizes.
struct CountingInstance {
    inner: MockInstance,
    batches: std::sync::Mutex<Vec<usize>>,
}

impl CountingInstance {
    fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EncryptionInstance for CountingInstance {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        self.inner.public_key()
    }

    fn public_params(&self, bits: u32) -> Option<Vec<u8>> {
        self.inner.public_params(bits)
    }

    async fn encrypt_u32(&self, contract: &Address, user: &Address, value: u32) -> PxwResult<EncryptedInput> {
        self.inner.encrypt_u32(contract, user, value).await
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        self.inner.generate_keypair()
    }

    fn create_typed_data(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> TypedData {
        self.inner
            .create_typed_data(public_key, contracts, start_timestamp, duration_days)
    }

    async fn user_decrypt(
        &self,
        handles: &[HandleRef],
        auth: &DecryptionAuthorization,
    ) -> PxwResult<HashMap<Handle, u64>> {
        self.batches.lock().unwrap().push(handles.len());
        self.inner.user_decrypt(handles, auth).await
    }
}

struct Fixture {
    ledger: Arc<SimulatedLedger>,
    instance: Arc<CountingInstance>,
    signer: Arc<LocalSigner>,
    auth: Arc<AuthorizationManager>,
    canvas_id: u64,
}

impl Fixture {
    async fn new() -> Self {
        let cp = Arc::new(MockCoprocessor::from_seed(&[8u8; 32]).unwrap());
        let ledger = Arc::new(SimulatedLedger::new(31337, contract(), cp.clone(), metadata()));
        let signer = Arc::new(LocalSigner::from_seed([21u8; 32]));
        let canvas_id = ledger.create_canvas(&signer.address(), 16, 16).await.unwrap();
        Self {
            instance: Arc::new(CountingInstance {
                inner: MockInstance::new(31337, metadata(), cp),
                batches: std::sync::Mutex::new(Vec::new()),
            }),
            ledger,
            signer,
            auth: Arc::new(AuthorizationManager::default()),
            canvas_id,
        }
    }

    fn decoder(&self) -> Decoder {
        Decoder::new(self.instance.clone(), self.auth.clone(), self.signer.clone(), contract())
    }

    async fn paint(&self, x: u32, y: u32, color: u32) -> (Handle, LogPosition) {
        let user = self.signer.address();
        let input = self.instance.encrypt_u32(&contract(), &user, color).await.unwrap();
        let pos = self
            .ledger
            .set_pixel(&user, self.canvas_id, x, y, &input)
            .await
            .unwrap();
        (input.handle, pos)
    }
}

#[tokio::test]
async fn full_refresh_is_last_writer_wins() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 0x111111).await;
    let (h2, _) = fx.paint(0, 0, 0x222222).await;
    let (h3, _) = fx.paint(1, 0, 0x333333).await;

    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));
    let board = recon.refresh(true, false).await.unwrap();

    assert_eq!(board.len(), 2);
    let origin = board.get(0, 0).unwrap();
    assert_eq!(origin.handle, h2);
    assert_eq!(origin.color.as_deref(), Some("#222222"));
    let next = board.get(1, 0).unwrap();
    assert_eq!(next.handle, h3);
    assert_eq!(next.color.as_deref(), Some("#333333"));

    // three distinct handles decoded in one batch
    assert_eq!(fx.instance.batches(), vec![3]);
}

#[tokio::test]
async fn repeated_handles_are_decoded_once() {
    let fx = Fixture::new().await;
    let user = fx.signer.address();
    let input = fx.instance.encrypt_u32(&contract(), &user, 0xABCDEF).await.unwrap();
    for x in 0..4 {
        fx.ledger.set_pixel(&user, fx.canvas_id, x, 0, &input).await.unwrap();
    }

    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));
    let board = recon.refresh(true, false).await.unwrap();

    assert_eq!(board.len(), 4);
    assert!(board.ordered_cells().all(|c| c.color.as_deref() == Some("#ABCDEF")));
    assert_eq!(fx.instance.batches(), vec![1]);
}

#[tokio::test]
async fn refresh_without_decrypt_leaves_colours_pending() {
    let fx = Fixture::new().await;
    fx.paint(3, 4, 0xFF0000).await;

    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));
    let board = recon.refresh(false, false).await.unwrap();

    assert_eq!(board.len(), 1);
    assert_eq!(board.get(3, 4).unwrap().color, None);
    assert!(fx.instance.batches().is_empty());
    assert!(fx.auth.cached(&fx.signer.address(), &[contract()]).is_none());
}

#[tokio::test]
async fn empty_log_needs_no_authorization() {
    let fx = Fixture::new().await;
    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));

    let board = recon.refresh(true, false).await.unwrap();
    assert!(board.is_empty());
    assert!(fx.auth.cached(&fx.signer.address(), &[contract()]).is_none());
}

#[tokio::test]
async fn decrypting_refresh_requires_a_decoder() {
    let fx = Fixture::new().await;
    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    let err = recon.refresh(true, false).await.unwrap_err();
    assert!(matches!(err, PxwError::NotReady));
}

#[tokio::test]
async fn other_canvases_are_ignored() {
    let fx = Fixture::new().await;
    let other = fx.ledger.create_canvas(&fx.signer.address(), 4, 4).await.unwrap();
    let user = fx.signer.address();
    let input = fx.instance.encrypt_u32(&contract(), &user, 1).await.unwrap();
    fx.ledger.set_pixel(&user, other, 0, 0, &input).await.unwrap();

    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    assert!(recon.refresh(false, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn live_patch_decrypts_only_its_handle() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 0x00FF00).await;

    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));
    recon.refresh(true, false).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = recon.subscribe_live(move |cell| {
        let _ = tx.send(cell.clone());
    });

    let (h, _) = fx.paint(5, 6, 0x0000FF).await;
    let cell = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!((cell.x, cell.y, cell.handle), (5, 6, h));
    assert_eq!(cell.color.as_deref(), Some("#0000FF"));
    assert_eq!(recon.board().get(5, 6).unwrap().color.as_deref(), Some("#0000FF"));
    assert_eq!(fx.instance.batches(), vec![1, 1]);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn only_one_live_subscription_per_canvas() {
    let fx = Fixture::new().await;
    let recon = CanvasReconstructor::new(fx.ledger.clone(), fx.canvas_id);

    let first = recon.subscribe_live(|_| {});
    assert!(first.is_active());
    let second = recon.subscribe_live(|_| {});
    assert!(!first.is_active());
    assert!(second.is_active());
}

/// Ledger whose first historical query captures its snapshot, then blocks
/// until released. A lagging one instead opens every live stream with a
/// lost-events marker.
struct GatedLedger {
    inner: Arc<SimulatedLedger>,
    armed: AtomicBool,
    lagging: bool,
    entered: Notify,
    release: Notify,
    queries: AtomicUsize,
}

impl GatedLedger {
    fn new(inner: Arc<SimulatedLedger>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            lagging: false,
            entered: Notify::new(),
            release: Notify::new(),
            queries: AtomicUsize::new(0),
        }
    }

    fn lagging(inner: Arc<SimulatedLedger>) -> Self {
        Self {
            armed: AtomicBool::new(false),
            lagging: true,
            ..Self::new(inner)
        }
    }
}

#[async_trait]
impl PixelWallLedger for GatedLedger {
    fn contract(&self) -> Address {
        self.inner.contract()
    }

    async fn canvas_meta(&self, canvas_id: u64) -> PxwResult<CanvasMeta> {
        self.inner.canvas_meta(canvas_id).await
    }

    async fn pixel_view(&self, canvas_id: u64, x: u32, y: u32) -> PxwResult<PixelView> {
        self.inner.pixel_view(canvas_id, x, y).await
    }

    async fn canvas_stroke_count(&self, canvas_id: u64) -> PxwResult<Handle> {
        self.inner.canvas_stroke_count(canvas_id).await
    }

    async fn painter_contribution(&self, canvas_id: u64, painter: &Address) -> PxwResult<Handle> {
        self.inner.painter_contribution(canvas_id, painter).await
    }

    async fn query_pixel_updates(&self, canvas_id: u64, from_block: u64) -> PxwResult<EventLog> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let log = self.inner.query_pixel_updates(canvas_id, from_block).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(log)
    }

    fn subscribe_pixel_updates(&self) -> EventStream {
        let live = self.inner.subscribe_pixel_updates();
        if self.lagging {
            Box::pin(futures::stream::iter([LiveEvent::Lagged { skipped: 3 }]).chain(live))
        } else {
            live
        }
    }

    async fn create_canvas(&self, from: &Address, width: u32, height: u32) -> PxwResult<u64> {
        self.inner.create_canvas(from, width, height).await
    }

    async fn set_pixel(
        &self,
        from: &Address,
        canvas_id: u64,
        x: u32,
        y: u32,
        input: &EncryptedInput,
    ) -> PxwResult<LogPosition> {
        self.inner.set_pixel(from, canvas_id, x, y, input).await
    }

    async fn lock_canvas(&self, from: &Address, canvas_id: u64) -> PxwResult<()> {
        self.inner.lock_canvas(from, canvas_id).await
    }

    async fn mint_canvas(&self, from: &Address, canvas_id: u64, cid: &str) -> PxwResult<Option<u64>> {
        self.inner.mint_canvas(from, canvas_id, cid).await
    }
}

#[tokio::test]
async fn live_patch_during_refresh_is_not_lost() {
    let fx = Fixture::new().await;
    let (old, _) = fx.paint(0, 0, 0xFF0000).await;

    let gated = Arc::new(GatedLedger::new(fx.ledger.clone()));
    let recon = CanvasReconstructor::new(gated.clone(), fx.canvas_id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = recon.subscribe_live(move |cell| {
        let _ = tx.send(cell.clone());
    });

    let refreshing = {
        let recon = recon.clone();
        tokio::spawn(async move { recon.refresh(false, false).await })
    };
    gated.entered.notified().await;

    // the refresh holds a snapshot that predates this write
    let (new, pos) = fx.paint(0, 0, 0x0000FF).await;
    let patched = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patched.handle, new);

    gated.release.notify_one();
    let board = refreshing.await.unwrap().unwrap();

    let cell = board.get(0, 0).unwrap();
    assert_ne!(cell.handle, old);
    assert_eq!(cell.handle, new);
    assert_eq!(cell.position, pos);
    assert_eq!(recon.board(), board);
}

#[tokio::test]
async fn live_patch_is_decoded_during_first_decrypting_refresh() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 0xFF0000).await;

    let gated = Arc::new(GatedLedger::new(fx.ledger.clone()));
    let recon = CanvasReconstructor::new(gated.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = recon.subscribe_live(move |cell| {
        let _ = tx.send(cell.clone());
    });

    let refreshing = {
        let recon = recon.clone();
        tokio::spawn(async move { recon.refresh(true, false).await })
    };
    gated.entered.notified().await;

    // nothing has committed a decrypted board yet
    fx.paint(3, 3, 0x00FF00).await;
    let patched = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((patched.x, patched.y), (3, 3));
    assert_eq!(patched.color.as_deref(), Some("#00FF00"));

    gated.release.notify_one();
    let board = refreshing.await.unwrap().unwrap();

    assert_eq!(board.get(0, 0).unwrap().color.as_deref(), Some("#FF0000"));
    assert_eq!(board.get(3, 3).unwrap().color.as_deref(), Some("#00FF00"));
}

#[tokio::test]
async fn lagged_stream_resyncs_the_board() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 0x123456).await;
    fx.paint(2, 1, 0x654321).await;

    let gated = Arc::new(GatedLedger::lagging(fx.ledger.clone()));
    let recon = CanvasReconstructor::new(gated.clone(), fx.canvas_id);
    recon.set_decryption(Some(fx.decoder()));
    assert!(recon.board().is_empty());

    let _sub = recon.subscribe_live(|_| {});
    tokio::time::timeout(Duration::from_secs(5), async {
        while recon.board().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let board = recon.board();
    assert_eq!(board.get(0, 0).unwrap().color.as_deref(), Some("#123456"));
    assert_eq!(board.get(2, 1).unwrap().color.as_deref(), Some("#654321"));
    assert_eq!(gated.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn superseded_refresh_does_not_commit() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 0xFF0000).await;

    let gated = Arc::new(GatedLedger::new(fx.ledger.clone()));
    let recon = CanvasReconstructor::new(gated.clone(), fx.canvas_id);

    let slow = {
        let recon = recon.clone();
        tokio::spawn(async move { recon.refresh(false, false).await })
    };
    gated.entered.notified().await;

    let (newer, _) = fx.paint(1, 1, 0x00FF00).await;
    let fast = recon.refresh(false, false).await.unwrap();
    assert_eq!(fast.generation(), 2);
    assert_eq!(fast.len(), 2);

    gated.release.notify_one();
    let stale = slow.await.unwrap().unwrap();

    assert_eq!(stale.generation(), 2, "the older snapshot must not replace the newer one");
    assert_eq!(recon.board().get(1, 1).unwrap().handle, newer);
    assert_eq!(gated.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stats_distinguish_unknown_from_zero() {
    let fx = Fixture::new().await;
    let stats = StatsReader::new(fx.ledger.clone(), fx.canvas_id, fx.signer.address());

    let err = stats.refresh(true, false).await.unwrap_err();
    assert!(matches!(err, PxwError::NotReady));

    stats.set_decryption(Some(fx.decoder()));
    let fresh = stats.refresh(true, false).await.unwrap();
    assert_eq!((fresh.total, fresh.own), (Some(0), Some(0)));
    assert!(fx.instance.batches().is_empty());

    let plain = stats.refresh(false, false).await.unwrap();
    assert_eq!((plain.total, plain.own), (None, None));
}

#[tokio::test]
async fn stats_decode_both_counters_in_one_batch() {
    let fx = Fixture::new().await;
    fx.paint(0, 0, 1).await;
    fx.paint(1, 0, 2).await;

    let bob = LocalSigner::from_seed([22u8; 32]);
    let input = fx
        .instance
        .encrypt_u32(&contract(), &bob.address(), 3)
        .await
        .unwrap();
    fx.ledger
        .set_pixel(&bob.address(), fx.canvas_id, 2, 0, &input)
        .await
        .unwrap();

    let stats = StatsReader::new(fx.ledger.clone(), fx.canvas_id, fx.signer.address());
    stats.set_decryption(Some(fx.decoder()));
    let read = stats.refresh(true, false).await.unwrap();

    assert_eq!(read.total, Some(3));
    assert_eq!(read.own, Some(2));
    assert_eq!(fx.instance.batches(), vec![2]);
}
