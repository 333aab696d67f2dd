//! pxw: PixelWall encrypted-state client
//!
//! Commands:
//!   config show          - display the active configuration
//!   probe [--rpc-url]    - resolve a node's chain id and simulation metadata
//!   cache show | clear   - inspect or clear the durable parameter cache
//!   simulate             - run a full session on the in-process simulated chain

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pxw_canvas::{PixelWall, PixelWallLedger, SimulatedLedger};
use pxw_core::config::{PxwConfig, LOCAL_CHAIN_ID};
use pxw_core::Address;
use pxw_fhe::{
    probe_simulation, AuthorizationManager, FheContext, HttpConnector, HttpRpcClient, InstanceManager,
    LocalSigner, ManagerOptions, Network, RpcClient, SdkSource, Signer, SimulationMetadata,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pxw",
    version,
    about = "PixelWall encrypted canvas client",
    long_about = "pxw: bootstrap the encryption runtime, inspect its caches, and drive a canvas session"
)]
struct Cli {
    /// Path to pxw.toml configuration file
    #[arg(long, short = 'c', env = "PXW_CONFIG", default_value = "pxw.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "PXW_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "PXW_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Resolve the chain id of a node and whether it is a simulated chain
    Probe {
        /// RPC endpoint (default: [network].rpc_url)
        #[arg(long, env = "PXW_RPC_URL")]
        rpc_url: Option<String>,
    },

    /// Parameter cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Paint, reveal and optionally lock/mint a canvas on the in-process chain
    Simulate {
        #[arg(long, default_value_t = 16)]
        width: u32,
        #[arg(long, default_value_t = 16)]
        height: u32,
        /// Pixel to paint as x,y,#RRGGBB (repeatable)
        #[arg(long = "pixel", short = 'p')]
        pixels: Vec<PixelArg>,
        /// Lock the canvas after painting
        #[arg(long)]
        lock: bool,
        /// Mint a snapshot under this content id (implies --lock)
        #[arg(long)]
        mint: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show storage usage and cached public key entries
    Show,
    /// Remove every key under the runtime namespace
    Clear,
}

/// `x,y,#RRGGBB`
#[derive(Debug, Clone, PartialEq)]
struct PixelArg {
    x: u32,
    y: u32,
    color: String,
}

impl FromStr for PixelArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, color] = parts.as_slice() else {
            return Err(format!("expected x,y,#RRGGBB, got {s:?}"));
        };
        let x = x.parse().map_err(|e| format!("bad x in {s:?}: {e}"))?;
        let y = y.parse().map_err(|e| format!("bad y in {s:?}: {e}"))?;
        pxw_canvas::parse_color(color).map_err(|e| e.to_string())?;
        Ok(Self {
            x,
            y,
            color: color.to_string(),
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match &cli.log_format {
        Some(f) => f.clone(),
        None if config.log.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);
    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Probe { rpc_url } => cmd_probe(&config, rpc_url.as_deref()).await,
        Commands::Cache { action: CacheAction::Show } => cmd_cache_show(&config).await,
        Commands::Cache { action: CacheAction::Clear } => cmd_cache_clear(&config).await,
        Commands::Simulate {
            width,
            height,
            pixels,
            lock,
            mint,
        } => cmd_simulate(config, width, height, &pixels, lock, mint.as_deref()).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(PxwConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((PxwConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── `pxw config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &PxwConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `pxw probe` ───────────────────────────────────────────────────────────────

async fn cmd_probe(config: &PxwConfig, rpc_url: Option<&str>) -> Result<()> {
    let url = rpc_url.unwrap_or(&config.network.rpc_url);
    let timeout = Duration::from_secs(config.network.request_timeout_secs);
    let client = HttpRpcClient::new(url, timeout)?;

    let chain_id = client.chain_id().await?;
    let version = client.client_version().await?;
    println!("endpoint:       {url}");
    println!("chain id:       {chain_id}");
    println!("client:         {version}");

    let mock_chains = config.network.mock_chain_urls();
    if !mock_chains.contains_key(&chain_id) {
        println!("path:           production (chain {chain_id} is not a simulated chain)");
        return Ok(());
    }
    match probe_simulation(&client).await? {
        Some(meta) => {
            println!("path:           mock (in-process coprocessor)");
            println!("ACL:            {}", meta.acl_address);
            println!("InputVerifier:  {}", meta.input_verifier_address);
            println!("KMSVerifier:    {}", meta.kms_verifier_address);
        }
        None => println!("path:           production (no simulation metadata)"),
    }
    Ok(())
}

// ── `pxw cache` ───────────────────────────────────────────────────────────────

async fn cmd_cache_show(config: &PxwConfig) -> Result<()> {
    let ctx = FheContext::from_config(config).context("opening durable store")?;
    let report = pxw_storage::usage(ctx.storage().as_ref(), ctx.namespace()).await?;

    match &config.cache.dir {
        Some(dir) => println!("store:          {}", dir.display()),
        None => println!("store:          in-memory (set [cache].dir to persist)"),
    }
    println!("namespace:      {}", ctx.namespace());
    println!(
        "usage:          {} bytes in namespace ({} keys), {} bytes total, capacity {}",
        report.namespace_bytes, report.namespace_keys, report.total_bytes, config.cache.max_bytes
    );

    let entries = ctx.param_cache().entries().await?;
    if entries.is_empty() {
        println!("public keys:    none cached");
    }
    for entry in entries {
        println!(
            "public keys:    {} (key {} bytes, params {} bytes)",
            entry.domain,
            entry.public_key.len(),
            entry.public_params.len()
        );
    }
    Ok(())
}

async fn cmd_cache_clear(config: &PxwConfig) -> Result<()> {
    let ctx = FheContext::from_config(config).context("opening durable store")?;
    let removed = pxw_storage::clear_namespace(ctx.storage().as_ref(), ctx.namespace()).await?;
    println!("removed {removed} keys under {:?}", ctx.namespace());
    Ok(())
}

// ── `pxw simulate` ────────────────────────────────────────────────────────────

fn simulation_metadata() -> SimulationMetadata {
    SimulationMetadata {
        acl_address: Address::from_bytes([0x50; 20]),
        input_verifier_address: Address::from_bytes([0x90; 20]),
        kms_verifier_address: Address::from_bytes([0x13; 20]),
    }
}

async fn cmd_simulate(
    mut config: PxwConfig,
    width: u32,
    height: u32,
    pixels: &[PixelArg],
    lock: bool,
    mint: Option<&str>,
) -> Result<()> {
    let ctx = Arc::new(FheContext::from_config(&config).context("opening durable store")?);
    let contract = config
        .canvas
        .contract_for(LOCAL_CHAIN_ID)?
        .context("no canvas contract configured for the local chain")?;
    let ledger = Arc::new(SimulatedLedger::new(
        LOCAL_CHAIN_ID,
        contract,
        ctx.coprocessor().clone(),
        simulation_metadata(),
    ));

    let signer = Arc::new(LocalSigner::random());
    let canvas_id = ledger.create_canvas(&signer.address(), width, height).await?;
    config.canvas.canvas_id = canvas_id;
    info!(canvas_id, width, height, painter = %signer.address(), "simulated canvas created");

    let mut auth = AuthorizationManager::new(config.authorization.duration_days);
    if config.authorization.persist {
        auth = auth.with_persistence(ctx.storage().clone(), ctx.namespace().to_string());
    }

    let manager = Arc::new(InstanceManager::new(
        ctx,
        SdkSource::from_config(&config.relayer, None),
        Arc::new(HttpConnector::new(Duration::from_secs(config.network.request_timeout_secs))),
        ManagerOptions::from_config(&config),
    ));
    let wall = PixelWall::connect(
        manager.clone(),
        Network::Provider(ledger.clone()),
        ledger.clone(),
        signer.clone(),
        Arc::new(auth),
        &config.canvas,
    )
    .await?;
    println!("instance:       {}", manager.status());
    println!("canvas:         #{canvas_id} {width}x{height} on chain {LOCAL_CHAIN_ID} ({contract})");

    for p in pixels {
        wall.paint_pixel(p.x, p.y, &p.color)
            .await
            .with_context(|| format!("painting ({}, {})", p.x, p.y))?;
    }

    let (board, stats) = if config.canvas.auto_decrypt {
        wall.enable_decryption(false).await?
    } else {
        wall.refresh(false).await?
    };
    println!("pixels:         {}", board.len());
    for cell in board.ordered_cells() {
        println!(
            "  ({:>4}, {:>4})  {}  by {}",
            cell.x,
            cell.y,
            cell.color.as_deref().unwrap_or("<encrypted>"),
            cell.painter
        );
    }
    let show = |v: Option<u64>| v.map_or_else(|| "<encrypted>".to_string(), |n| n.to_string());
    println!("strokes:        {} total, {} yours", show(stats.total), show(stats.own));

    if lock || mint.is_some() {
        wall.lock().await?;
        println!("locked:         yes");
    }
    if let Some(cid) = mint {
        match wall.mint_snapshot(cid).await? {
            Some(token_id) => println!("minted:         token #{token_id} ({cid})"),
            None => println!("minted:         {cid} (no token id reported)"),
        }
    }
    println!("status:         {}", wall.message());
    Ok(())
}
