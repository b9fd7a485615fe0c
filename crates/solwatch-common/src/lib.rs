pub mod config;
pub mod errors;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use types::*;
