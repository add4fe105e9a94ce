//! Rooted references for a host runtime with a generational, moving
//! collector. Foreign code creates a root for a managed value and may keep
//! it across arbitrary native operations; the collector rewrites the rooted
//! word in place whenever it moves the target block.

extern crate bit_field;
extern crate libc;
#[cfg(test)]
extern crate crossbeam;

#[cfg(test)]
mod tests;

pub mod chunk;
pub mod elem;
pub mod engine;
pub mod ffi;
pub mod pages;
pub mod pool;
pub mod ring;
pub mod runtime;
pub mod stats;
pub mod util;
