//! Event types for all three aggregate kinds (spec §3, §6).

mod catalog;
mod flow;
mod partition;

pub use catalog::CatalogEvent;
pub use flow::FlowEvent;
pub use partition::PartitionEvent;
