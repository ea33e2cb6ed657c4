use crate::backup::BackupTransfer;
use crate::node::Node;
use crate::status::{parse_cluster_report, SecondaryStatus};
use gbasedeploy_common::{DeployError, ReplicationRole, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Config keys synced from the primary onto an HDR secondary.
const HDR_SYNC_KEYS: &[&str] = &["ROOTSIZE", "LOGFILES", "LOGSIZE", "DRAUTO", "DRINTERVAL", "DRTIMEOUT"];

/// Config keys synced from the primary onto an SDS member.
const SDS_SYNC_KEYS: &[&str] = &["ROOTSIZE", "PHYSFILE", "LOGFILES", "LOGSIZE"];

/// Config keys synced from the primary onto an RSS member.
const RSS_SYNC_KEYS: &[&str] = &["ROOTSIZE", "LOGFILES", "LOGSIZE", "LOG_INDEX_BUILDS"];

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Registry group addressing the whole cluster.
    pub group_name: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Local directory where level-0 backups are staged between nodes.
    pub staging_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group_name: "g_cluster".to_string(),
            startup_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            staging_dir: std::env::temp_dir().join("gbasedeploy-staging"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartupOptions {
    /// Overrides `ClusterConfig::startup_timeout` when set.
    pub timeout: Option<Duration>,
    /// Skip rebuilding/distributing the registry before starting.
    pub skip_sqlhosts: bool,
    /// Configure the SDS heartbeat timeout on SDS members during bootstrap.
    pub sds_heartbeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Initializing,
    Started,
    Stopped,
}

/// A replication topology: one primary plus at most one HDR secondary, any
/// number of SDS members, and any number of RSS members.
///
/// Orchestration is deliberately single-threaded: topology changes are
/// inherently serialized, so every operation issues its remote commands in
/// sequence and the first failure propagates untouched. The only background
/// work is the health-poll task inside [`Cluster::wait_cluster_ok`].
pub struct Cluster {
    config: ClusterConfig,
    primary: Node,
    hdr: Option<Node>,
    sds: Vec<Node>,
    rss: Vec<Node>,
    backup: BackupTransfer,
    state: ClusterState,
    rss_prepared: bool,
}

impl Cluster {
    pub fn new(primary: Node, config: ClusterConfig) -> Self {
        let backup = BackupTransfer::new(config.staging_dir.clone());
        Self {
            config,
            primary,
            hdr: None,
            sds: Vec::new(),
            rss: Vec::new(),
            backup,
            state: ClusterState::New,
            rss_prepared: false,
        }
    }

    pub fn primary(&self) -> &Node {
        &self.primary
    }

    pub fn hdr(&self) -> Option<&Node> {
        self.hdr.as_ref()
    }

    pub fn sds(&self) -> &[Node] {
        &self.sds
    }

    pub fn rss(&self) -> &[Node] {
        &self.rss
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == ClusterState::Started
    }

    /// All secondaries in bootstrap order: SDS, then RSS, then HDR.
    fn secondaries(&self) -> impl Iterator<Item = &Node> {
        self.sds.iter().chain(self.rss.iter()).chain(self.hdr.iter())
    }

    /// Members may join a new cluster (bootstrapped in bulk on the next
    /// `startup`) or a started one (bootstrapped immediately). A stopped
    /// cluster rejects joins: a deferred member would be restarted with a
    /// bare `oninit`, never registered on the primary or restore-seeded.
    fn check_new_member(&self, node: &Node) -> Result<()> {
        match self.state {
            ClusterState::New | ClusterState::Started => {}
            state => {
                return Err(DeployError::InvalidState(format!(
                    "cannot add {} to a cluster in state {state:?}; start the cluster first",
                    node.name()
                )))
            }
        }
        if node.name() == self.primary.name()
            || self.secondaries().any(|n| n.name() == node.name())
        {
            return Err(DeployError::InvalidTopology(format!(
                "server name {} already present in cluster",
                node.name()
            )));
        }
        Ok(())
    }

    /// Record an HDR secondary. If the cluster is already running, the HDR
    /// bootstrap runs immediately; otherwise it is deferred to `startup`.
    pub async fn add_hdr(&mut self, node: Node) -> Result<()> {
        if self.hdr.is_some() {
            return Err(DeployError::InvalidTopology(
                "cluster already has an HDR secondary".to_string(),
            ));
        }
        self.check_new_member(&node)?;
        info!(node = %node.name(), "HDR secondary recorded");
        self.hdr = Some(node);

        if self.is_started() {
            self.rebuild_registry()?;
            self.distribute_registry(true).await?;
            if let Some(hdr) = &self.hdr {
                Self::bootstrap_hdr(&self.primary, hdr, &mut self.backup).await?;
            }
        }
        Ok(())
    }

    /// Record an SDS member. The first SDS member ever is what promotes the
    /// primary to the SDS-primary role, exactly once.
    pub async fn add_sds(&mut self, node: Node) -> Result<()> {
        self.check_new_member(&node)?;
        info!(node = %node.name(), "SDS member recorded");
        self.sds.push(node);

        if self.is_started() {
            self.rebuild_registry()?;
            self.distribute_registry(true).await?;
            let (primary, sds) = (&self.primary, &self.sds);
            let node = sds.last().expect("sds member just recorded");
            Self::bootstrap_sds(primary, node, false).await?;
        }
        Ok(())
    }

    /// Record an RSS member. The first RSS member enables log-index building
    /// on the primary and invalidates any cached backup; a backup taken
    /// before the log-index mode changed cannot seed an RSS member.
    pub async fn add_rss(&mut self, node: Node) -> Result<()> {
        self.check_new_member(&node)?;
        info!(node = %node.name(), "RSS member recorded");
        self.rss.push(node);

        if self.is_started() {
            self.rebuild_registry()?;
            self.distribute_registry(true).await?;
            self.prepare_rss_support().await?;
            let (primary, rss, backup) = (&self.primary, &self.rss, &mut self.backup);
            let node = rss.last().expect("rss member just recorded");
            Self::bootstrap_rss(primary, node, backup).await?;
        }
        Ok(())
    }

    /// Bring the whole topology up and wait until every secondary reports
    /// connected and active.
    pub async fn startup(&mut self) -> Result<()> {
        self.startup_with(StartupOptions::default()).await
    }

    pub async fn startup_with(&mut self, opts: StartupOptions) -> Result<()> {
        match self.state {
            ClusterState::Started => return Ok(()),
            ClusterState::Initializing => {
                return Err(DeployError::InvalidState(
                    "previous cluster initialization failed; inspect nodes before retrying"
                        .to_string(),
                ))
            }
            ClusterState::New => {
                self.state = ClusterState::Initializing;
                self.bootstrap_all(&opts).await?;
            }
            ClusterState::Stopped => self.restart_all(&opts).await?,
        }

        let timeout = opts.timeout.unwrap_or(self.config.startup_timeout);
        self.wait_cluster_ok(timeout).await?;
        self.state = ClusterState::Started;
        info!(
            primary = %self.primary.name(),
            secondaries = self.secondaries().count(),
            "cluster started"
        );
        Ok(())
    }

    /// Full bootstrap in fixed order: primary, SDS, RSS, HDR. SDS comes
    /// first because it establishes the shared-disk primary role that the
    /// RSS and HDR bootstrap steps depend on being stable.
    async fn bootstrap_all(&mut self, opts: &StartupOptions) -> Result<()> {
        if !opts.skip_sqlhosts {
            self.rebuild_registry()?;
            self.distribute_registry(false).await?;
        }

        self.primary.initialize().await?;
        // freshly initialized storage invalidates anything staged earlier
        self.backup.invalidate();

        {
            let (primary, sds) = (&self.primary, &self.sds);
            for node in sds {
                Self::bootstrap_sds(primary, node, opts.sds_heartbeat).await?;
            }
        }

        if !self.rss.is_empty() {
            self.prepare_rss_support().await?;
            let (primary, rss, backup) = (&self.primary, &self.rss, &mut self.backup);
            for node in rss {
                Self::bootstrap_rss(primary, node, backup).await?;
            }
        }

        if let Some(hdr) = &self.hdr {
            Self::bootstrap_hdr(&self.primary, hdr, &mut self.backup).await?;
        }
        Ok(())
    }

    /// Ordered restart of an already-initialized topology: primary first,
    /// then every secondary.
    async fn restart_all(&mut self, opts: &StartupOptions) -> Result<()> {
        if !opts.skip_sqlhosts {
            self.rebuild_registry()?;
            self.distribute_registry(false).await?;
        }
        self.primary.startup().await?;
        for node in &self.sds {
            node.startup().await?;
        }
        for node in &self.rss {
            node.startup().await?;
        }
        if let Some(hdr) = &self.hdr {
            hdr.startup().await?;
        }
        Ok(())
    }

    /// Stop every secondary, then the primary: the inverse of startup order,
    /// so no secondary is left trying to reconnect to a stopped primary.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == ClusterState::New {
            return Ok(());
        }
        info!(primary = %self.primary.name(), "stopping cluster");
        if let Some(hdr) = &self.hdr {
            hdr.shutdown().await?;
        }
        for node in self.rss.iter().rev() {
            node.shutdown().await?;
        }
        for node in self.sds.iter().rev() {
            node.shutdown().await?;
        }
        self.primary.shutdown().await?;
        self.state = ClusterState::Stopped;
        Ok(())
    }

    /// Treat the topology as already initialized on disk, so the next
    /// `startup` performs an ordered restart instead of a full bootstrap.
    pub fn mark_initialized(&mut self) {
        if self.state == ClusterState::New {
            self.state = ClusterState::Stopped;
        }
    }

    /// Restore the cached (or a fresh) level-0 backup of the primary onto
    /// `target`.
    pub async fn backup_restore(&mut self, target_index: usize) -> Result<()> {
        let (primary, rss, backup) = (&self.primary, &self.rss, &mut self.backup);
        let target = rss.get(target_index).ok_or_else(|| {
            DeployError::InvalidTopology(format!("no RSS member at index {target_index}"))
        })?;
        let artifact = backup.ensure_fresh(primary).await?;
        backup.restore(&artifact, target).await
    }

    /// Force the next backup-restore to take a new level-0 backup. Call
    /// whenever the primary's data could have changed.
    pub fn invalidate_backup(&mut self) {
        self.backup.invalidate();
    }

    /// Current per-secondary status as reported by the primary.
    pub async fn status(&self) -> Result<Vec<SecondaryStatus>> {
        let report = self.primary.secondary_status().await?;
        parse_cluster_report(&report)
    }

    /// Poll the primary's cluster report until every known secondary shows a
    /// non-empty replay log and a connected/active status, or `timeout`
    /// elapses.
    ///
    /// The poll loop runs on a background task so the caller-visible wait is
    /// bounded by wall-clock time; cancellation is cooperative (the task
    /// checks a token between polls, and only ever reads), so a command
    /// already in flight is never killed mid-run.
    pub async fn wait_cluster_ok(&self, timeout: Duration) -> Result<()> {
        let expected: Vec<String> = self.secondaries().map(|n| n.name().to_string()).collect();
        if expected.is_empty() {
            return Ok(());
        }

        let probe = self.primary.status_probe();
        let interval = self.config.poll_interval;
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let poll = tokio::spawn(async move {
            loop {
                let report = probe.fetch().await?;
                let statuses = parse_cluster_report(&report)?;
                let missing: Vec<&String> = expected
                    .iter()
                    .filter(|name| {
                        !statuses.iter().any(|s| s.name == **name && s.is_ok())
                    })
                    .collect();
                if missing.is_empty() {
                    return Ok(());
                }
                debug!(?missing, "cluster not healthy yet");

                tokio::select! {
                    _ = worker_cancel.cancelled() => {
                        return Err(DeployError::Task("health poll cancelled".to_string()));
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        match tokio::time::timeout(timeout, poll).await {
            Ok(joined) => joined.map_err(|e| DeployError::Task(e.to_string()))?,
            Err(_) => {
                cancel.cancel();
                warn!(?timeout, "cluster health poll timed out");
                Err(DeployError::ClusterStartupTimeout(timeout))
            }
        }
    }

    /// Rebuild the canonical registry from the current topology: every node
    /// as a top-level entry and as a member of the cluster group. The
    /// primary's registry keeps its sequence counter across rebuilds, so
    /// group sequence numbers never collide with earlier materializations.
    fn rebuild_registry(&self) -> Result<()> {
        let group = self.config.group_name.clone();
        let entries: Vec<_> = std::iter::once(&self.primary)
            .chain(self.secondaries())
            .map(|n| n.host_entry())
            .collect();

        self.primary.with_sqlhosts(|hosts| -> Result<()> {
            hosts.clear();
            for entry in &entries {
                hosts.add_server(entry.clone())?;
                hosts.add_group_member(&group, entry.clone())?;
            }
            Ok(())
        })
    }

    /// Hand every secondary its own copy of the canonical registry. With
    /// `materialize`, rewrite the files on all nodes immediately (used on
    /// incremental joins, where the topology changed under a live cluster).
    async fn distribute_registry(&self, materialize: bool) -> Result<()> {
        let canonical = self.primary.registry_snapshot();
        for node in self.secondaries() {
            node.install_registry(
                canonical.copy_to(node.machine().clone(), node.sqlhosts_path().to_string()),
            );
        }
        if materialize {
            self.primary.materialize_sqlhosts().await?;
            for node in self.secondaries() {
                node.materialize_sqlhosts().await?;
            }
        }
        Ok(())
    }

    async fn prepare_rss_support(&mut self) -> Result<()> {
        if self.rss_prepared {
            return Ok(());
        }
        info!(primary = %self.primary.name(), "enabling log-index builds for RSS support");
        self.primary.onconfig().set("LOG_INDEX_BUILDS", "1").await?;
        // backups taken before the log-index mode change cannot seed RSS
        self.backup.invalidate();
        self.rss_prepared = true;
        Ok(())
    }

    /// Seed and promote an HDR secondary: config, registry file, root chunk,
    /// level-0 backup-restore from the primary, then the role handshake.
    async fn bootstrap_hdr(primary: &Node, node: &Node, backup: &mut BackupTransfer) -> Result<()> {
        info!(primary = %primary.name(), secondary = %node.name(), "bootstrapping HDR secondary");
        Self::establish_trust(primary, node).await?;
        node.onconfig().initialize(&node.onconfig_seed()).await?;
        node.onconfig().sync_from(primary.onconfig(), HDR_SYNC_KEYS).await?;
        node.materialize_sqlhosts().await?;
        node.add_chunk_file("rootdbs").await?;

        let artifact = backup.ensure_fresh(primary).await?;
        backup.restore(&artifact, node).await?;

        primary.set_hdr_primary(node.name()).await?;
        node.set_hdr_secondary(primary.name()).await?;
        node.mark_running();
        Ok(())
    }

    /// Bring up an SDS member against the primary's shared storage. Promotes
    /// the primary to SDS primary only if it does not hold that role yet.
    async fn bootstrap_sds(primary: &Node, node: &Node, heartbeat: bool) -> Result<()> {
        info!(primary = %primary.name(), member = %node.name(), "bootstrapping SDS member");
        Self::establish_trust(primary, node).await?;
        if primary.role() != ReplicationRole::SdsPrimary {
            primary.set_sds_primary().await?;
        }

        node.onconfig().initialize(&node.onconfig_seed()).await?;
        // shared disk: the member reads the primary's root chunk
        node.onconfig().set("ROOTPATH", &primary.root_chunk_path()).await?;
        node.onconfig().sync_from(primary.onconfig(), SDS_SYNC_KEYS).await?;
        node.onconfig().set("SDS_ENABLE", "1").await?;
        node.onconfig()
            .set(
                "SDS_PAGING",
                &format!("{0}/sdstmp1,{0}/sdstmp2", node.storage_dir()),
            )
            .await?;
        node.onconfig()
            .set(
                "SDS_TEMPDBS",
                &format!("sdstmpdbs1,{}/sdstmpdbs1,2,0,16000", node.storage_dir()),
            )
            .await?;
        if heartbeat {
            node.onconfig().set("SDS_TIMEOUT", "40").await?;
        }

        node.machine()
            .run_checked(&format!("mkdir -p {}", node.storage_dir()))
            .await?;
        node.materialize_sqlhosts().await?;
        node.startup().await?;
        node.assume_role(ReplicationRole::SdsSecondary);
        Ok(())
    }

    /// Seed and attach an RSS member: register on the primary, then config,
    /// registry file, root chunk, backup-restore, role handshake.
    async fn bootstrap_rss(primary: &Node, node: &Node, backup: &mut BackupTransfer) -> Result<()> {
        info!(primary = %primary.name(), member = %node.name(), "bootstrapping RSS member");
        Self::establish_trust(primary, node).await?;
        primary.add_rss_to_primary(node.name()).await?;

        node.onconfig().initialize(&node.onconfig_seed()).await?;
        node.onconfig().sync_from(primary.onconfig(), RSS_SYNC_KEYS).await?;
        node.materialize_sqlhosts().await?;
        node.add_chunk_file("rootdbs").await?;

        let artifact = backup.ensure_fresh(primary).await?;
        backup.restore(&artifact, node).await?;

        node.set_rss_primary(primary.name()).await?;
        node.mark_running();
        Ok(())
    }

    /// Mutual host trust so the replication layer can connect both ways.
    /// Idempotent: the trust line is appended only when absent.
    async fn establish_trust(a: &Node, b: &Node) -> Result<()> {
        Self::trust_one_way(a, b).await?;
        Self::trust_one_way(b, a).await
    }

    async fn trust_one_way(target: &Node, source: &Node) -> Result<()> {
        let file = format!("{}/etc/hosts.equiv", target.install_dir());
        let line = format!("{} {}", source.host(), source.owner());
        target
            .machine()
            .run_checked(&format!(
                "grep -qx '{line}' {file} 2>/dev/null || echo '{line}' >> {file}"
            ))
            .await?;
        Ok(())
    }
}
