//! Segmented memory, NE module loading and the 16-bit side of a Win16 kernel.

pub mod atom;
pub mod callback;
pub mod cc;
pub mod config;
pub mod cpu;
pub mod errors;
pub mod global;
pub mod kernel;
pub mod ldt;
pub mod loader;
pub mod local;
pub mod memory;
pub mod ne;
pub mod registers;
pub mod stack;
pub mod syslevel;
pub mod task;
pub mod thunk;
pub mod utils;

pub use errors::{KernelError, Result};
pub use kernel::Kernel;
