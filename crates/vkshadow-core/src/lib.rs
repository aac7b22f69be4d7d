pub mod config;
pub mod error;
pub mod handle_table;

pub use config::LayerConfig;
pub use error::LayerError;
pub use handle_table::HandleTable;
