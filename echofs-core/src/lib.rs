//! The PMEM storage engine: allocator, segment index, range-lock manager
//! and the resident-file/registry layers built on top of them.
//!
//! This crate implements only the engine (C1-C7). FUSE dispatch, the
//! client RPC wire format, CLI/config parsing and logger setup live in
//! the `echofs-ng` daemon crate, which consumes [`registry::BackendRegistry`]
//! as its single entry point into the engine.

pub mod error;
pub mod file;
pub mod index;
pub mod pool;
pub mod rangelock;
pub mod registry;
pub mod segment;

pub use error::{EchoFsError, ErrorKind, Result};
pub use file::{Attr, FileKind, ResidentFile};
pub use pool::PmemPool;
pub use rangelock::{LockKind, RangeLockHandle, RangeLockManager};
pub use registry::{BackendRegistry, Stat};
