pub mod onconfig;
pub mod sqlhosts;

pub use onconfig::{OnConfig, OnConfigSeed};
pub use sqlhosts::{GroupEntry, HostEntry, SqlHosts};
