pub mod kline_store;
pub mod router;
pub mod symbol_registry;

pub use kline_store::KlineStore;
pub use router::KlineRouter;
pub use symbol_registry::{SymbolRegistry, SyncOutcome};
