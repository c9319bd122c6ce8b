//! The New Executable format: file parsing, the in-memory module block and the
//! per-segment loading pipeline.

pub mod builder;
pub mod convert;
pub mod entry;
pub mod header;
pub mod module;
pub mod reloc;
pub mod resource;
pub mod segment;

pub use builder::NeBuilder;
pub use header::{read_header, NeHeader};
pub use module::{
    build_module, create_dummy_module, get_module, get_module_mut, ModuleFlags, NeModule,
    SegEntry, SegmentFlags,
};
