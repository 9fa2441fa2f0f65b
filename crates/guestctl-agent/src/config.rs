use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use guestctl_service::ControlConfig;
use serde::Deserialize;

#[derive(Default, Deserialize)]
#[serde(default)]
pub(crate) struct AgentConfig {
    pub channel: Option<String>,
    pub logfile: Option<PathBuf>,
    pub syslog: Option<bool>,
    #[serde(flatten)]
    pub control: ControlConfig,
}

pub(crate) fn load_config(config_flag: Option<&str>) -> Result<AgentConfig> {
    let path = match config_flag {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from("guestctl.json"),
    };
    load_from(&path, config_flag.is_some())
}

fn load_from(path: &Path, required: bool) -> Result<AgentConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let cfg: AgentConfig = serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if required {
                bail!("Config file not found: {}", path.display());
            }
            Ok(AgentConfig::default())
        }
        Err(e) => bail!("Failed to read {}: {}", path.display(), e),
    }
}
