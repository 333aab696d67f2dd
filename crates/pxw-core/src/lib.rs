//! pxw-core: shared types, config schema, and error taxonomy for the
//! PixelWall encrypted-state client runtime.

pub mod config;
pub mod error;
pub mod types;

pub use error::{AuthError, PxwError, PxwResult};
pub use types::{Address, CanvasMeta, Cell, EncryptedInput, Handle, HandleRef, LogPosition};
