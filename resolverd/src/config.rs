pub mod file;
mod serde;
pub mod settings;

pub use self::{file::File, settings::Settings};

use ::serde::{Deserialize, Serialize};
use anyhow::Context;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Data {
    pub dir: PathBuf,
}

pub fn read_config<T>(config_file: &Option<PathBuf>, default_config_path: T) -> anyhow::Result<File>
where
    T: FnOnce() -> anyhow::Result<PathBuf>,
{
    let path = match config_file {
        Some(path) => {
            eprintln!("Using config file {}", path.display());
            Some(path.clone())
        }
        None => {
            let default_path = default_config_path()?;

            if default_path.exists() {
                eprintln!(
                    "Using config file at default path: {}",
                    default_path.display()
                );
                Some(default_path)
            } else {
                eprintln!("Config file default path is {}", default_path.display());
                None
            }
        }
    };

    match path {
        Some(path) => File::read(&path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(File::default()),
    }
}
