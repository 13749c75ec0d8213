pub mod data;
pub mod discovery;
pub mod io;

pub use data::{BackendConfig, Config};
pub use io::ConfigError;
