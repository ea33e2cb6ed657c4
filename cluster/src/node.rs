use gbasedeploy_common::{
    ConnectionKind, DeployError, NodeState, ReplicationRole, Result, SpaceKind,
};
use gbasedeploy_config::{HostEntry, OnConfig, OnConfigSeed, SqlHosts};
use gbasedeploy_exec::{CommandOutput, Machine};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Static description of one database server instance.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub install_dir: String,
    pub storage_dir: String,
    pub owner: String,
    pub root_size_kb: u64,
}

impl NodeSpec {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        storage_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            install_dir: "/opt/gbase".to_string(),
            storage_dir: storage_dir.into(),
            owner: "gbasedbt".to_string(),
            root_size_kb: 200_000,
        }
    }

    pub fn install_dir(mut self, dir: impl Into<String>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn root_size_kb(mut self, size: u64) -> Self {
        self.root_size_kb = size;
        self
    }
}

/// One database server instance: its onconfig, its registry view, and the
/// lifecycle operations that drive it over remote commands.
///
/// Lifecycle: `Uninitialized -> Initializing -> Running <-> Stopped ->
/// TornDown`. An initialization failure leaves the node in `Initializing`
/// for good; partially-initialized storage must not be re-initialized on top
/// of itself, so the operator has to intervene.
pub struct Node {
    spec: NodeSpec,
    machine: Machine,
    onconfig: OnConfig,
    sqlhosts: Mutex<SqlHosts>,
    sqlhosts_path: String,
    state: RwLock<NodeState>,
    role: RwLock<ReplicationRole>,
    initialized: AtomicBool,
}

impl Node {
    pub fn new(spec: NodeSpec, machine: Machine) -> Self {
        let onconfig_path = format!("{}/etc/onconfig.{}", spec.install_dir, spec.name);
        let sqlhosts_path = format!("{}/etc/sqlhosts.{}", spec.install_dir, spec.name);
        let onconfig = OnConfig::new(machine.clone(), onconfig_path);
        let sqlhosts = SqlHosts::new(machine.clone(), sqlhosts_path.clone());
        Self {
            spec,
            machine,
            onconfig,
            sqlhosts: Mutex::new(sqlhosts),
            sqlhosts_path,
            state: RwLock::new(NodeState::Uninitialized),
            role: RwLock::new(ReplicationRole::None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn owner(&self) -> &str {
        &self.spec.owner
    }

    pub fn install_dir(&self) -> &str {
        &self.spec.install_dir
    }

    pub fn storage_dir(&self) -> &str {
        &self.spec.storage_dir
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn onconfig(&self) -> &OnConfig {
        &self.onconfig
    }

    pub fn sqlhosts_path(&self) -> &str {
        &self.sqlhosts_path
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn role(&self) -> ReplicationRole {
        *self.role.read()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// This node's registry slot.
    pub fn host_entry(&self) -> HostEntry {
        HostEntry::new(
            &self.spec.name,
            ConnectionKind::OnSocTcp,
            &self.spec.host,
            self.spec.port,
        )
    }

    /// Run a closure against this node's registry view.
    pub fn with_sqlhosts<R>(&self, f: impl FnOnce(&mut SqlHosts) -> R) -> R {
        f(&mut self.sqlhosts.lock())
    }

    pub fn registry_snapshot(&self) -> SqlHosts {
        self.sqlhosts.lock().clone()
    }

    pub fn install_registry(&self, hosts: SqlHosts) {
        *self.sqlhosts.lock() = hosts;
    }

    /// Write this node's registry view to its sqlhosts file.
    pub async fn materialize_sqlhosts(&self) -> Result<()> {
        // snapshot, so the lock is not held across the remote round-trip
        let snapshot = self.registry_snapshot();
        snapshot.materialize().await
    }

    pub fn root_chunk_path(&self) -> String {
        format!("{}/rootdbs", self.spec.storage_dir)
    }

    pub fn onconfig_seed(&self) -> OnConfigSeed {
        OnConfigSeed {
            template_path: format!("{}/etc/onconfig.std", self.spec.install_dir),
            server_name: self.spec.name.clone(),
            root_path: self.root_chunk_path(),
            root_size_kb: self.spec.root_size_kb,
            msg_path: format!("{}/online.log", self.spec.storage_dir),
        }
    }

    fn env_prefix(&self) -> String {
        format!(
            "GBASEDBTDIR={dir} GBASEDBTSERVER={name} ONCONFIG=onconfig.{name} \
             GBASEDBTSQLHOSTS={sqlhosts} PATH={dir}/bin:$PATH",
            dir = self.spec.install_dir,
            name = self.spec.name,
            sqlhosts = self.sqlhosts_path,
        )
    }

    /// Run an administrative command under the instance owner with the
    /// instance environment set.
    pub(crate) async fn run_admin(&self, command: &str) -> Result<CommandOutput> {
        self.machine
            .run_as(&self.spec.owner, &format!("{} {}", self.env_prefix(), command))
            .await
    }

    /// Initialize storage and start the instance for the first time.
    pub async fn initialize(&self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Uninitialized {
            return Err(DeployError::InvalidState(format!(
                "cannot initialize node {} from state {state}",
                self.spec.name
            )));
        }
        *self.state.write() = NodeState::Initializing;
        info!(node = %self.spec.name, host = %self.spec.host, "initializing node");

        self.onconfig.initialize(&self.onconfig_seed()).await?;
        self.materialize_sqlhosts().await?;
        self.add_chunk_file("rootdbs").await.map_err(init_error)?;

        let out = self.run_admin("oninit -iy").await?;
        if !out.success() {
            // state stays Initializing: a failed init is terminal
            return Err(DeployError::NodeInit {
                exit_code: out.exit_code,
                output: out.output,
            });
        }

        *self.state.write() = NodeState::Running;
        self.initialized.store(true, Ordering::SeqCst);
        info!(node = %self.spec.name, "node initialized and running");
        Ok(())
    }

    /// Start an instance whose storage already exists. Re-materializes the
    /// registry first; the topology may have changed since the last stop.
    pub async fn startup(&self) -> Result<()> {
        match self.state() {
            NodeState::Running => return Ok(()),
            NodeState::TornDown => {
                return Err(DeployError::InvalidState(format!(
                    "node {} has been torn down",
                    self.spec.name
                )))
            }
            _ => {}
        }

        self.materialize_sqlhosts().await?;
        let out = self.run_admin("oninit").await?;
        if !out.success() {
            return Err(DeployError::NodeStart {
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        *self.state.write() = NodeState::Running;
        // a plain oninit only succeeds against initialized storage
        self.initialized.store(true, Ordering::SeqCst);
        info!(node = %self.spec.name, "node started");
        Ok(())
    }

    /// Orderly stop, then a forced sweep of leftover shared-memory segments.
    /// Either the node is confirmed stopped or the error propagates; there is
    /// no partial-shutdown state.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state() == NodeState::TornDown {
            return Err(DeployError::InvalidState(format!(
                "node {} has been torn down",
                self.spec.name
            )));
        }

        let out = self.run_admin("onmode -ky").await?;
        if !out.success() {
            return Err(DeployError::NodeShutdown {
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        let out = self.run_admin("onclean -ky").await?;
        if !out.success() {
            return Err(DeployError::NodeShutdown {
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        *self.state.write() = NodeState::Stopped;
        info!(node = %self.spec.name, "node stopped");
        Ok(())
    }

    /// Ensure a storage chunk file exists with the right ownership and mode.
    /// Safe to call again for an existing chunk. Returns the canonical path.
    pub async fn add_chunk_file(&self, name: &str) -> Result<String> {
        let path = format!("{}/{}", self.spec.storage_dir, name);
        let owner = &self.spec.owner;
        self.machine
            .run_checked(&format!(
                "mkdir -p {dir} && touch {path} && chown {owner}:{owner} {path} && chmod 660 {path}",
                dir = self.spec.storage_dir,
            ))
            .await?;
        Ok(path)
    }

    /// Allocate a named storage space backed by a chunk file.
    ///
    /// Reports [`DeployError::SpaceAlreadyExists`] as its own kind so callers
    /// can make the operation idempotent across retried joins.
    pub async fn add_dbspace(&self, name: &str, size_kb: u64, kind: SpaceKind) -> Result<String> {
        let path = self.add_chunk_file(name).await.map_err(dbspace_error)?;
        let out = self
            .run_admin(&format!(
                "onspaces {} -p {path} -o 0 -s {size_kb}",
                kind.create_args(name)
            ))
            .await?;
        if out.success() {
            info!(node = %self.spec.name, space = name, ?kind, "dbspace created");
            return Ok(path);
        }
        if out.output.to_lowercase().contains("already exists") {
            return Err(DeployError::SpaceAlreadyExists(name.to_string()));
        }
        Err(DeployError::Dbspace {
            exit_code: out.exit_code,
            output: out.output,
        })
    }

    async fn role_command(
        &self,
        operation: &str,
        command: &str,
        new_role: Option<ReplicationRole>,
    ) -> Result<()> {
        let out = self.run_admin(command).await?;
        if !out.success() {
            return Err(DeployError::RoleChange {
                operation: operation.to_string(),
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        if let Some(role) = new_role {
            *self.role.write() = role;
            info!(node = %self.spec.name, %role, "replication role changed");
        }
        Ok(())
    }

    pub async fn set_hdr_primary(&self, secondary: &str) -> Result<()> {
        self.role_command(
            "set_hdr_primary",
            &format!("onmode -d primary {secondary}"),
            Some(ReplicationRole::HdrPrimary),
        )
        .await
    }

    pub async fn set_hdr_secondary(&self, primary: &str) -> Result<()> {
        self.role_command(
            "set_hdr_secondary",
            &format!("onmode -d secondary {primary}"),
            Some(ReplicationRole::HdrSecondary),
        )
        .await
    }

    pub async fn set_sds_primary(&self) -> Result<()> {
        self.role_command(
            "set_sds_primary",
            &format!("onmode -d set SDS primary {}", self.spec.name),
            Some(ReplicationRole::SdsPrimary),
        )
        .await
    }

    /// Register an RSS member on this (primary) node. Does not change this
    /// node's own role.
    pub async fn add_rss_to_primary(&self, rss: &str) -> Result<()> {
        self.role_command("add_rss_to_primary", &format!("onmode -d add RSS {rss}"), None)
            .await
    }

    pub async fn set_rss_primary(&self, primary: &str) -> Result<()> {
        self.role_command(
            "set_rss_primary",
            &format!("onmode -d RSS {primary}"),
            Some(ReplicationRole::RssSecondary),
        )
        .await
    }

    pub async fn delete_rss_from_primary(&self, rss: &str) -> Result<()> {
        self.role_command(
            "delete_rss_from_primary",
            &format!("onmode -d delete RSS {rss}"),
            None,
        )
        .await
    }

    /// Raw cluster status report from this node's instance.
    pub async fn secondary_status(&self) -> Result<String> {
        // onstat exit codes encode the server mode, not success; take the text
        let out = self.run_admin("onstat -g cluster").await?;
        Ok(out.output)
    }

    /// Detachable status probe for background polling; owns everything it
    /// needs so the poll task does not borrow the node.
    pub fn status_probe(&self) -> StatusProbe {
        StatusProbe {
            machine: self.machine.clone(),
            owner: self.spec.owner.clone(),
            command: format!("{} onstat -g cluster", self.env_prefix()),
        }
    }

    /// Stop the instance if needed and remove its storage. Explicit only;
    /// nothing in the toolkit tears a node down implicitly.
    pub async fn teardown(&self) -> Result<()> {
        if self.is_running() {
            self.shutdown().await?;
        }
        self.machine
            .run_checked(&format!("rm -rf {}", self.spec.storage_dir))
            .await?;
        *self.state.write() = NodeState::TornDown;
        warn!(node = %self.spec.name, "node torn down");
        Ok(())
    }

    pub(crate) fn assume_role(&self, role: ReplicationRole) {
        *self.role.write() = role;
    }

    /// Mark a node whose storage was seeded out-of-band (backup restore) as
    /// running and initialized.
    pub(crate) fn mark_running(&self) {
        *self.state.write() = NodeState::Running;
        self.initialized.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.spec.name)
            .field("host", &self.spec.host)
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}

/// Self-contained handle for polling a node's cluster status.
#[derive(Clone)]
pub struct StatusProbe {
    machine: Machine,
    owner: String,
    command: String,
}

impl StatusProbe {
    pub async fn fetch(&self) -> Result<String> {
        let out = self.machine.run_as(&self.owner, &self.command).await?;
        Ok(out.output)
    }
}

fn init_error(err: DeployError) -> DeployError {
    match err {
        DeployError::CommandFailed { exit_code, output } => {
            DeployError::NodeInit { exit_code, output }
        }
        other => other,
    }
}

fn dbspace_error(err: DeployError) -> DeployError {
    match err {
        DeployError::CommandFailed { exit_code, output } => {
            DeployError::Dbspace { exit_code, output }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbasedeploy_exec::FakeExecutor;
    use std::sync::Arc;

    fn node(fake: &Arc<FakeExecutor>, name: &str, host: &str) -> Node {
        Node::new(
            NodeSpec::new(name, host, 9088, format!("/data/{name}")),
            Machine::new(host, fake.clone()),
        )
    }

    #[tokio::test]
    async fn initialize_runs_the_expected_sequence() {
        let fake = Arc::new(FakeExecutor::new());
        let p1 = node(&fake, "p1", "h1");

        p1.initialize().await.unwrap();

        let onconfig = fake.op_index("cp /opt/gbase/etc/onconfig.std").unwrap();
        let sqlhosts = fake.op_index("write:/opt/gbase/etc/sqlhosts.p1").unwrap();
        let chunk = fake.op_index("touch /data/p1/rootdbs").unwrap();
        let oninit = fake.op_index("oninit -iy").unwrap();
        assert!(onconfig < sqlhosts && sqlhosts < chunk && chunk < oninit);

        assert_eq!(p1.state(), NodeState::Running);
        assert!(p1.is_initialized());

        // admin commands run as the instance owner with the env set
        let call = &fake.recorded()[oninit];
        assert_eq!(call.user.as_deref(), Some("gbasedbt"));
        assert!(call.op.contains("GBASEDBTSERVER=p1"));
    }

    #[tokio::test]
    async fn failed_initialize_is_terminal() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("oninit -iy", 1, "shared memory initialization failed");
        let p1 = node(&fake, "p1", "h1");

        let err = p1.initialize().await.unwrap_err();
        assert!(matches!(err, DeployError::NodeInit { exit_code: 1, .. }));
        assert_eq!(p1.state(), NodeState::Initializing);

        // no silent retry on top of partially-initialized storage
        let err = p1.initialize().await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidState(_)));
    }

    #[tokio::test]
    async fn startup_marks_the_node_initialized() {
        let fake = Arc::new(FakeExecutor::new());
        let s1 = node(&fake, "s1", "h1");

        s1.startup().await.unwrap();

        assert_eq!(s1.state(), NodeState::Running);
        assert!(s1.is_initialized());
    }

    #[tokio::test]
    async fn add_dbspace_distinguishes_already_exists() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on_once("onspaces -c", 0, "Space successfully added");
        fake.on("onspaces -c", 1, "dbspace 'datadbs' already exists");
        let p1 = node(&fake, "p1", "h1");

        let path = p1
            .add_dbspace("datadbs", 100_000, SpaceKind::Regular)
            .await
            .unwrap();
        assert_eq!(path, "/data/p1/datadbs");

        let err = p1
            .add_dbspace("datadbs", 100_000, SpaceKind::Regular)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::SpaceAlreadyExists(n) if n == "datadbs"));
    }

    #[tokio::test]
    async fn add_dbspace_other_failures_are_generic() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("onspaces -c", 1, "no space left on device");
        let p1 = node(&fake, "p1", "h1");

        let err = p1
            .add_dbspace("datadbs", 100_000, SpaceKind::Regular)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Dbspace { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn shutdown_surfaces_failures() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("onmode -ky", 1, "cannot attach to shared memory");
        let p1 = node(&fake, "p1", "h1");

        let err = p1.shutdown().await.unwrap_err();
        assert!(matches!(err, DeployError::NodeShutdown { exit_code: 1, .. }));
        assert_ne!(p1.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn role_commands_fail_fast() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("onmode -d primary", 1, "DR: not in a valid state");
        let p1 = node(&fake, "p1", "h1");

        let err = p1.set_hdr_primary("h1_sec").await.unwrap_err();
        match err {
            DeployError::RoleChange { operation, .. } => {
                assert_eq!(operation, "set_hdr_primary")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(p1.role(), ReplicationRole::None);
    }
}
