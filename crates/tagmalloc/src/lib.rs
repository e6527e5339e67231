//! tagmalloc - a heap allocator for memory-tagging architectures.
//!
//! Allocation happens from super-pages of fixed size and alignment, each
//! dedicated to one size class. The metadata of a super-page is a byte
//! array, one byte per chunk; every chunk transition
//! (available => used => quarantined => marked => {quarantined, available})
//! is a single one-byte store or compare-and-swap. Freed chunks get a
//! fresh memory tag, and when the quarantine grows past its threshold a
//! cooperative stop-the-world scan conservatively marks every chunk still
//! referenced from used memory before recycling the rest.

extern crate libc;

pub mod allocator;
pub mod api;
pub mod byte_scan;
pub mod config;
pub mod init;
pub mod large;
pub mod platform;
pub mod shadow;
pub mod size_class;
pub mod stats;
pub mod super_page;
pub mod sync;
pub mod tags;
pub mod util;
