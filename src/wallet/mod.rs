pub mod sync;
pub mod types;

pub use sync::SyncManager;
pub use types::*;
