pub mod atr;
pub mod engine;
pub mod order_block;
pub mod pivots;
pub mod structure;

pub use engine::{EngineConfig, MarketStructureSnapshot, ObEvent, SMCEngine};
pub use order_block::{MitigationRule, ObType, OrderBlock};
pub use structure::{MachineState, StructureEvent};
