use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Declarative cluster topology, loaded from a file with
/// `GBASEDEPLOY_*` environment overrides layered on top.
#[derive(Debug, Deserialize)]
pub struct TopologySpec {
    pub cluster: ClusterDecl,
    pub primary: NodeDecl,
    #[serde(default)]
    pub hdr: Option<NodeDecl>,
    #[serde(default)]
    pub sds: Vec<NodeDecl>,
    #[serde(default)]
    pub rss: Vec<NodeDecl>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterDecl {
    pub name: String,
    #[serde(default = "default_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDecl {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub storage_dir: String,
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_root_size_kb")]
    pub root_size_kb: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_port() -> u16 {
    9088
}

fn default_install_dir() -> String {
    "/opt/gbase".to_string()
}

fn default_owner() -> String {
    "gbasedbt".to_string()
}

fn default_root_size_kb() -> u64 {
    200_000
}

pub fn load(path: &Path) -> anyhow::Result<TopologySpec> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("GBASEDEPLOY").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}
