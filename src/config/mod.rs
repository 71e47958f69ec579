mod loader;
mod schema;

pub use loader::{load, validate, CliOverrides};
pub use schema::{CaptureConfig, Config, PersistenceConfig, TlsConfig};
