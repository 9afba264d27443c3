use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::error::ConfigError;
use super::program::{ordered_pairs, ProgramConfig, ProgramName, RawProgram};

/// The parsed configuration: every program record, in declaration order.
#[derive(Debug, Default)]
pub struct Config {
    pub programs: Vec<ProgramConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(alias = "programs", deserialize_with = "ordered_pairs")]
    process: Vec<(String, RawProgram)>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ConfigLoader {
    fn load(&self) -> Result<Config, ConfigError>;
}

pub struct YamlFileLoader {
    file_path: PathBuf,
}

impl YamlFileLoader {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
        }
    }
}

impl ConfigLoader for YamlFileLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        let f = std::fs::File::open(&self.file_path)?;
        let raw: RawConfig = serde_yaml::from_reader(f)?;
        Config::from_raw(raw)
    }
}

impl Config {
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut programs: Vec<ProgramConfig> = Vec::with_capacity(raw.process.len());
        for (name, program) in raw.process {
            let name = ProgramName::try_from(name)?;
            if programs.iter().any(|existing| existing.name == name) {
                return Err(ConfigError::DuplicateProgram(name.to_string()));
            }
            programs.push(ProgramConfig::from_raw(name, program)?);
        }
        Ok(Config { programs })
    }

    pub fn parse_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(input)?;
        Config::from_raw(raw)
    }
}
