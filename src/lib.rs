//! A userspace tiered heterogeneous-memory allocator: a size-classed pool
//! allocator over lazily-committed virtual memory, with an optional
//! background migration engine that tracks per-page hotness and moves
//! cold/hot pages between a near and far NUMA tier.
//!
//! See [`api::TierHeap`] for the primary handle-level API and
//! [`api::TierAllocator`] to install this as the process's
//! `#[global_allocator]`. [`config::ConfigBuilder`] selects among the
//! three placement policies [`config::TierPolicy`] names.

mod api;
mod bigary;
mod config;
mod critnib;
mod error;
mod mtt;
mod os;
mod pagesizes;
mod pool;
mod queues;
mod ranking;
mod slab;
mod slab_tracker;
mod stats;
mod tier;
mod worker;

pub use api::{TierAllocator, TierHeap};
pub use config::{Config, ConfigBuilder, Limits, TierPolicy};
pub use error::{Result, TierError};
pub use mtt::{NoopMover, NumaTarget, PageMover, SyscallMover};
