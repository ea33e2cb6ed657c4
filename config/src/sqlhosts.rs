use gbasedeploy_common::{ConnectionKind, DeployError, Result};
use gbasedeploy_exec::Machine;
use tracing::{debug, info};

/// One server line in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub kind: ConnectionKind,
    pub host: String,
    pub port: u16,
    pub attributes: Vec<(String, String)>,
}

impl HostEntry {
    pub fn new(
        name: impl Into<String>,
        kind: ConnectionKind,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            host: host.into(),
            port,
            attributes: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    fn render(&self, group: Option<&str>) -> String {
        let mut attrs = self.attributes.clone();
        if let Some(g) = group {
            attrs.push(("g".to_string(), g.to_string()));
        }
        let mut line = format!(
            "{:<20} {:<12} {:<20} {}",
            self.name,
            self.kind.wire_name(),
            self.host,
            self.port
        );
        if !attrs.is_empty() {
            line.push_str("  ");
            line.push_str(&render_attrs(&attrs));
        }
        line
    }
}

/// An addressable cluster/replicaset unit: a group header plus member lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub sequence: u32,
    pub attributes: Vec<(String, String)>,
    pub members: Vec<HostEntry>,
}

impl GroupEntry {
    fn new(name: impl Into<String>, sequence: u32) -> Self {
        Self {
            name: name.into(),
            sequence,
            attributes: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn member(&self, name: &str) -> Option<&HostEntry> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// The sqlhosts registry: logical server and group names mapped to endpoints,
/// materialized on a target host as the file the database's connectivity
/// layer reads.
///
/// Top-level entries and group members are distinct namespaces: a name may
/// exist both as a standalone server and inside a group. That asymmetry
/// matches the addressing model this registry serves (groups are their own
/// addressing scope) and is deliberately preserved.
#[derive(Debug, Clone)]
pub struct SqlHosts {
    machine: Machine,
    path: String,
    servers: Vec<HostEntry>,
    groups: Vec<GroupEntry>,
    next_sequence: u32,
}

impl SqlHosts {
    pub fn new(machine: Machine, path: impl Into<String>) -> Self {
        Self {
            machine,
            path: path.into(),
            servers: Vec::new(),
            groups: Vec::new(),
            next_sequence: 1,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn servers(&self) -> &[HostEntry] {
        &self.servers
    }

    pub fn groups(&self) -> &[GroupEntry] {
        &self.groups
    }

    pub fn server(&self, name: &str) -> Option<&HostEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Insert a top-level entry; the top-level namespace is unique by name.
    pub fn add_server(&mut self, entry: HostEntry) -> Result<()> {
        if self.servers.iter().any(|s| s.name == entry.name) {
            return Err(DeployError::DuplicateServerName(entry.name));
        }
        self.servers.push(entry);
        Ok(())
    }

    pub fn remove_server(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.name != name);
        self.servers.len() != before
    }

    /// Return the group named `name`, allocating it with the next sequence
    /// number when absent. Sequence numbers strictly increase over the
    /// registry's lifetime and are never reused, even after removal, so a
    /// re-created group can never be confused with a stale member set.
    pub fn get_group(&mut self, name: &str) -> &mut GroupEntry {
        if let Some(idx) = self.groups.iter().position(|g| g.name == name) {
            return &mut self.groups[idx];
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(group = name, sequence, "allocating registry group");
        self.groups.push(GroupEntry::new(name, sequence));
        self.groups.last_mut().expect("group just pushed")
    }

    /// Add a member to `group` (created if missing). Members are unique by
    /// name within their group, independently of the top-level namespace.
    pub fn add_group_member(&mut self, group: &str, entry: HostEntry) -> Result<()> {
        let group = self.get_group(group);
        if group.members.iter().any(|m| m.name == entry.name) {
            return Err(DeployError::DuplicateServerName(entry.name));
        }
        group.members.push(entry);
        Ok(())
    }

    pub fn remove_group(&mut self, name: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != name);
        self.groups.len() != before
    }

    /// Drop all entries and groups. The sequence counter is NOT reset.
    pub fn clear(&mut self) {
        self.servers.clear();
        self.groups.clear();
    }

    /// Independent structural copy aimed at another host/path, so each node
    /// can own its registry view while the cluster keeps the source of truth.
    pub fn copy_to(&self, machine: Machine, path: impl Into<String>) -> SqlHosts {
        SqlHosts {
            machine,
            path: path.into(),
            servers: self.servers.clone(),
            groups: self.groups.clone(),
            next_sequence: self.next_sequence,
        }
    }

    /// Serialize the whole registry to the target file as a full overwrite,
    /// so no stale entry survives a structural change.
    pub async fn materialize(&self) -> Result<()> {
        let mut out = String::new();
        for server in &self.servers {
            out.push_str(&server.render(None));
            out.push('\n');
        }
        for group in &self.groups {
            let mut attrs = vec![("i".to_string(), group.sequence.to_string())];
            attrs.extend(group.attributes.clone());
            out.push_str(&format!(
                "{:<20} {:<12} {:<20} {}  {}\n",
                group.name,
                "group",
                "-",
                "-",
                render_attrs(&attrs)
            ));
            for member in &group.members {
                out.push_str(&member.render(Some(&group.name)));
                out.push('\n');
            }
        }
        info!(path = %self.path, host = %self.machine.host(),
              servers = self.servers.len(), groups = self.groups.len(),
              "materializing sqlhosts");
        self.machine.write_file(&self.path, &out).await
    }

    /// Parse the materialized file back, replacing in-memory state. Used to
    /// reconcile after out-of-band edits.
    pub async fn load(&mut self) -> Result<()> {
        let content = self.machine.read_file(&self.path).await?;

        let mut servers: Vec<HostEntry> = Vec::new();
        let mut groups: Vec<GroupEntry> = Vec::new();
        let mut max_sequence = 0u32;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(DeployError::MalformedRegistryLine {
                    line_no,
                    line: raw.to_string(),
                });
            }

            if fields[1] == "group" {
                let attrs = parse_attrs(fields.get(4).copied().unwrap_or(""));
                let sequence = attrs
                    .iter()
                    .find(|(k, _)| k == "i")
                    .and_then(|(_, v)| v.parse().ok())
                    .ok_or_else(|| DeployError::MalformedRegistryLine {
                        line_no,
                        line: raw.to_string(),
                    })?;
                max_sequence = max_sequence.max(sequence);
                let mut group = GroupEntry::new(fields[0], sequence);
                group.attributes = attrs.into_iter().filter(|(k, _)| k != "i").collect();
                groups.push(group);
            } else {
                let port = fields[3].parse().map_err(|_| {
                    DeployError::MalformedRegistryLine {
                        line_no,
                        line: raw.to_string(),
                    }
                })?;
                let mut attrs = parse_attrs(fields.get(4).copied().unwrap_or(""));
                let group_of = attrs.iter().position(|(k, _)| k == "g").map(|i| attrs.remove(i).1);

                let mut entry = HostEntry::new(fields[0], ConnectionKind::parse(fields[1]), fields[2], port);
                entry.attributes = attrs;

                match group_of {
                    Some(gname) => {
                        let group = groups.iter_mut().find(|g| g.name == gname).ok_or_else(|| {
                            DeployError::MalformedRegistryLine {
                                line_no,
                                line: raw.to_string(),
                            }
                        })?;
                        group.members.push(entry);
                    }
                    None => servers.push(entry),
                }
            }
        }

        self.servers = servers;
        self.groups = groups;
        self.next_sequence = self.next_sequence.max(max_sequence + 1);
        Ok(())
    }
}

fn render_attrs(attrs: &[(String, String)]) -> String {
    attrs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_attrs(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (t.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbasedeploy_exec::FakeExecutor;
    use std::sync::Arc;

    const PATH: &str = "/opt/gbase/etc/sqlhosts.p1";

    fn registry(fake: &Arc<FakeExecutor>) -> SqlHosts {
        SqlHosts::new(Machine::new("h1", fake.clone()), PATH)
    }

    fn entry(name: &str, host: &str, port: u16) -> HostEntry {
        HostEntry::new(name, ConnectionKind::OnSocTcp, host, port)
    }

    #[test]
    fn duplicate_top_level_name_is_rejected() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);

        hosts.add_server(entry("p1", "h1", 9088)).unwrap();
        let err = hosts.add_server(entry("p1", "h2", 9088)).unwrap_err();
        assert!(matches!(err, DeployError::DuplicateServerName(n) if n == "p1"));
    }

    #[test]
    fn group_members_are_a_separate_namespace() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);

        hosts.add_server(entry("p1", "h1", 9088)).unwrap();
        // same name inside a group is legal: groups are their own scope
        hosts
            .add_group_member("g_cluster", entry("p1", "h1", 9088))
            .unwrap();
        let err = hosts
            .add_group_member("g_cluster", entry("p1", "h1", 9088))
            .unwrap_err();
        assert!(matches!(err, DeployError::DuplicateServerName(_)));
    }

    #[test]
    fn sequence_numbers_never_repeat() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);

        let s1 = hosts.get_group("g_one").sequence;
        let s2 = hosts.get_group("g_two").sequence;
        assert!(s2 > s1);

        assert!(hosts.remove_group("g_one"));
        let s3 = hosts.get_group("g_one").sequence;
        assert!(s3 > s2, "sequence {s3} reused after removal");
    }

    #[tokio::test]
    async fn materialize_load_round_trips() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);

        hosts
            .add_server(entry("p1", "h1", 9088).with_attr("b", "32767"))
            .unwrap();
        hosts.add_server(entry("h1_sec", "h2", 9088)).unwrap();
        hosts.get_group("g_cluster").attributes.push(("c".into(), "1".into()));
        hosts
            .add_group_member("g_cluster", entry("p1", "h1", 9088))
            .unwrap();
        hosts
            .add_group_member("g_cluster", entry("h1_sec", "h2", 9088))
            .unwrap();

        hosts.materialize().await.unwrap();

        let mut reloaded = registry(&fake);
        reloaded.load().await.unwrap();

        assert_eq!(reloaded.servers(), hosts.servers());
        assert_eq!(reloaded.groups(), hosts.groups());
    }

    #[tokio::test]
    async fn materialize_is_a_full_overwrite() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);

        hosts.add_server(entry("p1", "h1", 9088)).unwrap();
        hosts.add_server(entry("rss_1", "h3", 9088)).unwrap();
        hosts.materialize().await.unwrap();

        hosts.remove_server("rss_1");
        hosts.materialize().await.unwrap();

        let file = fake.file("h1", PATH).unwrap();
        assert!(!file.contains("rss_1"), "stale entry survived overwrite");
    }

    #[tokio::test]
    async fn load_rejects_short_lines() {
        let fake = Arc::new(FakeExecutor::new());
        fake.seed_file("h1", PATH, "p1 onsoctcp h1 9088\nbroken onsoctcp h1\n");
        let mut hosts = registry(&fake);

        let err = hosts.load().await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::MalformedRegistryLine { line_no: 2, .. }
        ));
    }

    #[tokio::test]
    async fn copy_to_is_independent() {
        let fake = Arc::new(FakeExecutor::new());
        let mut hosts = registry(&fake);
        hosts.add_server(entry("p1", "h1", 9088)).unwrap();
        hosts.get_group("g_cluster");

        let mut copy = hosts.copy_to(
            Machine::new("h2", fake.clone()),
            "/opt/gbase/etc/sqlhosts.h1_sec",
        );
        copy.add_server(entry("extra", "h9", 9088)).unwrap();

        assert!(hosts.server("extra").is_none());
        assert_eq!(copy.path(), "/opt/gbase/etc/sqlhosts.h1_sec");
        // the copy continues the sequence counter, so groups allocated on
        // either side never collide
        assert_eq!(copy.get_group("g_cluster").sequence, 1);
    }
}
