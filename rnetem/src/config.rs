//! Daemon configuration.
//!
//! The configuration is read once at startup by the server layer and handed
//! to every [`TopologyManager`](crate::manager::TopologyManager) by value;
//! nothing in the core reads process-wide state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::topology::NodeKind;

/// Docker images used for the node variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Images {
    pub router: String,
    pub host: String,
    pub ovs: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            router: "mroy31/gonetem-frr".to_string(),
            host: "mroy31/gonetem-host".to_string(),
            ovs: "mroy31/gonetem-ovs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub images: Images,
}

/// Server-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which project working directories are created.
    pub workdir: PathBuf,
    pub docker: DockerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self { workdir: PathBuf::from("/tmp"), docker: DockerConfig::default() }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// The image to launch for a docker-backed node kind.
    pub fn image_for(&self, kind: NodeKind) -> &str {
        match kind {
            NodeKind::Router => &self.docker.images.router,
            NodeKind::Host => &self.docker.images.host,
            NodeKind::Ovs => &self.docker.images.ovs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_images() {
        let config = Config::default();
        assert_eq!(config.workdir, PathBuf::from("/tmp"));
        assert_eq!(config.docker.images.router, "mroy31/gonetem-frr");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("workdir: /var/lib/rnetem\n").unwrap();
        assert_eq!(config.workdir, PathBuf::from("/var/lib/rnetem"));
        assert_eq!(config.docker.images.ovs, "mroy31/gonetem-ovs");
    }

    #[test]
    fn image_overrides_parse() {
        let yaml = "docker:\n  images:\n    router: custom/frr:latest\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.image_for(NodeKind::Router), "custom/frr:latest");
        assert_eq!(config.image_for(NodeKind::Host), "mroy31/gonetem-host");
    }
}
