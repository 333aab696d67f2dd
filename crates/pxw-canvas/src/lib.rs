//! pxw-canvas: the encrypted canvas read model
//!
//! The ledger stores only ciphertext handles. This crate replays the
//! ledger's `PixelUpdated` log into a [`Board`], decrypting unique handles in
//! one batch under a decryption authorization, keeps the board current from
//! the live event stream, and reads the encrypted stroke counters.

pub mod board;
pub mod color;
pub mod decoder;
pub mod ledger;
pub mod session;
pub mod sim;
pub mod stats;

pub use board::{Board, CanvasReconstructor, LiveSubscription};
pub use color::{format_color, parse_color};
pub use decoder::Decoder;
pub use ledger::{EventLog, EventStream, LedgerEvent, LiveEvent, PixelUpdate, PixelView, PixelWallLedger};
pub use session::PixelWall;
pub use sim::SimulatedLedger;
pub use stats::{CanvasStats, StatsReader};
