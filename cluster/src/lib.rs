pub mod backup;
pub mod cluster;
pub mod node;
pub mod pool;
pub mod status;

pub use backup::{BackupArtifact, BackupTransfer};
pub use cluster::{Cluster, ClusterConfig, ClusterState, StartupOptions};
pub use node::{Node, NodeSpec, StatusProbe};
pub use pool::ServerPool;
pub use status::{parse_cluster_report, SecondaryStatus};
