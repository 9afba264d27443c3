mod error;
mod loader;
mod program;

pub use error::ConfigError;
pub use loader::{Config, ConfigLoader, YamlFileLoader};
pub use program::{AutoRestart, ProgramConfig, ProgramName, StopSignal};

#[cfg(test)]
pub use loader::MockConfigLoader;
