//! `vmcore`: the page allocator, segment manager, fault handler and
//! file-content cache of a multi-processor kernel.
//!
//! This crate is that core: it owns physical
//! pages, per-process virtual address spaces, demand-paging and a
//! second-level file-content cache, and nothing else. The 9P-style mount
//! layer, name resolution, scheduling, block pools, the general-purpose
//! heap and device drivers are all external collaborators reached only
//! through the traits in [`external`] and [`mmu`].
#![no_std]

extern crate alloc;

pub mod cache;
pub mod config;
pub mod error;
pub mod external;
pub mod fault;
pub mod filecache;
pub mod memory;
pub mod mmu;
pub mod process;
pub mod segment;
pub mod syscall;

pub use config::Config;
pub use error::KError;
