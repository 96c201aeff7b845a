pub mod assembly;
pub mod format;
pub mod graph;
pub mod resolve;

pub use assembly::{AssemblyStats, TreeAssembler};
pub use format::{ValueFormatter, ENCRYPTED_MASK};
pub use graph::{DataSetListGraph, GraphBuilder};
pub use resolve::{OverrideResolver, ResolvedValue, ValueSource};
