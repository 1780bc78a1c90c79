pub mod billing;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod fetcher;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod types;

pub use errors::*;
pub use types::*;
