//! One user's session on one canvas.
//!
//! [`PixelWall`] ties the encryption instance, the decryption authorization
//! manager, the board reconstructor and the stats reader together behind the
//! operations a front end exposes: paint, lock, mint and reveal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use pxw_core::config::CanvasConfig;
use pxw_core::{Address, CanvasMeta, Cell, LogPosition, PxwError, PxwResult};
use pxw_fhe::{
    build_encrypted_input, AuthorizationManager, EncryptionInstance, InstanceManager, InstanceStatus, Network,
    Signer,
};
use tracing::{info, instrument, warn};

use crate::board::{Board, CanvasReconstructor, LiveSubscription};
use crate::color::parse_color;
use crate::decoder::Decoder;
use crate::ledger::PixelWallLedger;
use crate::stats::{CanvasStats, StatsReader};

pub struct PixelWall {
    manager: Arc<InstanceManager>,
    network: Network,
    ledger: Arc<dyn PixelWallLedger>,
    signer: Arc<dyn Signer>,
    auth: Arc<AuthorizationManager>,
    chain_id: u64,
    contract: Address,
    canvas_id: u64,
    board: CanvasReconstructor,
    stats: Arc<StatsReader>,
    meta: RwLock<Option<CanvasMeta>>,
    message: RwLock<String>,
    decrypting: Arc<AtomicBool>,
}

impl PixelWall {
    /// Bootstrap (or reuse) the encryption instance for `network` and bind
    /// the session to the canvas configured for its chain.
    pub async fn connect(
        manager: Arc<InstanceManager>,
        network: Network,
        ledger: Arc<dyn PixelWallLedger>,
        signer: Arc<dyn Signer>,
        auth: Arc<AuthorizationManager>,
        config: &CanvasConfig,
    ) -> PxwResult<Self> {
        let instance = manager.ensure(&network).await?;
        let chain_id = instance.chain_id();

        let contract = config
            .contract_for(chain_id)?
            .ok_or_else(|| PxwError::Config(format!("no canvas contract configured for chain {chain_id}")))?;
        if contract != ledger.contract() {
            return Err(PxwError::Config(format!(
                "canvas contract for chain {chain_id} is {contract}, but the ledger serves {}",
                ledger.contract()
            )));
        }

        let user = signer.address();
        auth.set_context(chain_id, Some(user));

        let wall = Self {
            board: CanvasReconstructor::new(ledger.clone(), config.canvas_id),
            stats: Arc::new(StatsReader::new(ledger.clone(), config.canvas_id, user)),
            manager,
            network,
            ledger,
            signer,
            auth,
            chain_id,
            contract,
            canvas_id: config.canvas_id,
            meta: RwLock::new(None),
            message: RwLock::new(String::new()),
            decrypting: Arc::new(AtomicBool::new(false)),
        };
        wall.refresh_meta().await?;
        info!(chain_id, contract = %contract, canvas_id = wall.canvas_id, user = %user, "canvas session ready");
        Ok(wall)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn canvas_id(&self) -> u64 {
        self.canvas_id
    }

    pub fn user(&self) -> Address {
        self.signer.address()
    }

    /// Last metadata read from the ledger.
    pub fn meta(&self) -> Option<CanvasMeta> {
        self.meta.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn board(&self) -> Board {
        self.board.board()
    }

    pub fn reconstructor(&self) -> &CanvasReconstructor {
        &self.board
    }

    pub fn is_decrypting(&self) -> bool {
        self.decrypting.load(Ordering::Acquire)
    }

    /// Status line for the user: the last operation's outcome, or the
    /// instance status while nothing has happened yet.
    pub fn message(&self) -> String {
        let message = self.message.read().unwrap_or_else(|e| e.into_inner()).clone();
        if message.is_empty() {
            format!("encryption instance {}", self.manager.status())
        } else {
            message
        }
    }

    /// Whether painting is currently possible: the instance is ready and
    /// the canvas is known and unlocked.
    pub fn can_interact(&self) -> bool {
        self.manager.status() == InstanceStatus::Ready && self.meta().is_some_and(|m| !m.is_locked)
    }

    pub async fn refresh_meta(&self) -> PxwResult<CanvasMeta> {
        let meta = self.ledger.canvas_meta(self.canvas_id).await?;
        *self.meta.write().unwrap_or_else(|e| e.into_inner()) = Some(meta.clone());
        Ok(meta)
    }

    /// Encrypt `color` (`#RRGGBB`) and submit it for `(x, y)`.
    #[instrument(skip(self), fields(canvas_id = self.canvas_id))]
    pub async fn paint_pixel(&self, x: u32, y: u32, color: &str) -> PxwResult<LogPosition> {
        let value = parse_color(color)?;
        let meta = self.refresh_meta().await?;
        if meta.is_locked {
            self.set_message("canvas is locked");
            return Err(PxwError::Ledger(format!("canvas {} is locked", self.canvas_id)));
        }
        if !meta.contains(x, y) {
            return Err(PxwError::Ledger(format!(
                "({x}, {y}) is outside the {}x{} canvas",
                meta.width, meta.height
            )));
        }

        let instance = self.instance().await?;
        let user = self.signer.address();
        let input = build_encrypted_input(instance.as_ref(), &self.contract, &user, u64::from(value)).await?;
        let position = match self.ledger.set_pixel(&user, self.canvas_id, x, y, &input).await {
            Ok(p) => p,
            Err(e) => {
                self.set_message(&format!("painting ({x}, {y}) failed: {e}"));
                return Err(e);
            }
        };
        self.set_message(&format!("painted ({x}, {y}) {}", color.to_uppercase()));
        Ok(position)
    }

    pub async fn lock(&self) -> PxwResult<CanvasMeta> {
        self.ledger.lock_canvas(&self.signer.address(), self.canvas_id).await?;
        let meta = self.refresh_meta().await?;
        self.set_message("canvas locked");
        Ok(meta)
    }

    /// Mint a snapshot of the locked canvas under content id `cid`.
    pub async fn mint_snapshot(&self, cid: &str) -> PxwResult<Option<u64>> {
        let meta = self.refresh_meta().await?;
        if !meta.is_locked {
            return Err(PxwError::Ledger(format!(
                "canvas {} must be locked before minting",
                self.canvas_id
            )));
        }
        let token_id = self.ledger.mint_canvas(&self.signer.address(), self.canvas_id, cid).await?;
        self.refresh_meta().await?;
        match token_id {
            Some(id) => self.set_message(&format!("minted snapshot token #{id}")),
            None => {
                warn!(canvas_id = self.canvas_id, "mint confirmed without a CanvasMinted event");
                self.set_message("snapshot minted");
            }
        }
        Ok(token_id)
    }

    /// Authorize decryption (asking for a fresh signature with `force_new`)
    /// and reveal the board and the stroke counters together.
    pub async fn enable_decryption(&self, force_new: bool) -> PxwResult<(Board, CanvasStats)> {
        let instance = self.instance().await?;
        let decoder = Decoder::new(instance.clone(), self.auth.clone(), self.signer.clone(), self.contract);

        // one signature covers both reads
        self.auth
            .ensure(instance.as_ref(), self.signer.as_ref(), &[self.contract], force_new)
            .await?;

        self.board.set_decryption(Some(decoder.clone()));
        self.stats.set_decryption(Some(decoder));
        self.decrypting.store(true, Ordering::Release);

        let (board, stats) = self.refresh(true).await?;
        self.set_message(&format!("revealed {} pixels", board.len()));
        Ok((board, stats))
    }

    /// Re-read board and counters, decrypting when `decrypt` is set and
    /// decryption has been enabled.
    pub async fn refresh(&self, decrypt: bool) -> PxwResult<(Board, CanvasStats)> {
        let decrypt = decrypt && self.is_decrypting();
        let (board, stats) = tokio::try_join!(
            self.board.refresh(decrypt, false),
            self.stats.refresh(decrypt, false)
        )?;
        Ok((board, stats))
    }

    pub async fn stats(&self) -> PxwResult<CanvasStats> {
        self.stats.refresh(self.is_decrypting(), false).await
    }

    /// Counters from the most recent read, without touching the ledger.
    pub fn latest_stats(&self) -> CanvasStats {
        self.stats.latest()
    }

    pub fn watch_stats(&self) -> tokio::sync::watch::Receiver<CanvasStats> {
        self.stats.watch()
    }

    /// Follow live paints on this canvas. Every patched cell is passed to
    /// `on_update` and schedules a re-read of the stroke counters.
    pub fn subscribe_live<F>(&self, on_update: F) -> LiveSubscription
    where
        F: Fn(&Cell) + Send + Sync + 'static,
    {
        let stats = self.stats.clone();
        let decrypting = self.decrypting.clone();
        self.board.subscribe_live(move |cell| {
            on_update(cell);
            let stats = stats.clone();
            let decrypt = decrypting.load(Ordering::Acquire);
            tokio::spawn(async move {
                if let Err(e) = stats.refresh(decrypt, false).await {
                    warn!("stroke counter refresh after live update failed: {e}");
                }
            });
        })
    }

    async fn instance(&self) -> PxwResult<Arc<dyn EncryptionInstance>> {
        match self.manager.current_for(self.chain_id).await {
            Some(instance) => Ok(instance),
            None => self.manager.ensure(&self.network).await,
        }
    }

    fn set_message(&self, message: &str) {
        *self.message.write().unwrap_or_else(|e| e.into_inner()) = message.to_string();
    }
}
