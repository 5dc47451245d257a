pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod markers;
pub mod model;
pub mod ocr;
pub mod perception;
pub mod profile;
pub mod reconciler;
pub mod retry;
pub mod signal;
pub mod structured;
pub mod transport;
pub mod ui_tree;

pub use error::{BridgeError, BridgeResult};
