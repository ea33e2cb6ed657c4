use gbasedeploy_common::{DeployError, Result};
use serde::Serialize;

/// One secondary's row in the cluster status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryStatus {
    pub name: String,
    /// Replay-log position as `id,page`; `-` or `0,0` means no log applied yet.
    pub replay_log: String,
    /// Connection status string, e.g. `SYNC(HDR),Connected,Active`.
    pub connection: String,
}

impl SecondaryStatus {
    /// A secondary is healthy when it has applied some log and its
    /// connection reports both connected and active.
    pub fn is_ok(&self) -> bool {
        self.replay_log != "-"
            && self.replay_log != "0,0"
            && self.connection.contains("Connected")
            && self.connection.contains("Active")
    }
}

/// Parse the fixed-width cluster status report (`onstat -g cluster`).
///
/// The table starts at a header row whose first column is `Server`; one
/// record per line follows until a blank line. A missing header means the
/// instance is not reporting a cluster table yet, which reads as "no
/// secondaries visible" so a poll loop simply tries again. A header followed
/// by a row of the wrong shape is malformed external state and is fatal;
/// guessing at topology risks corrupting it.
pub fn parse_cluster_report(report: &str) -> Result<Vec<SecondaryStatus>> {
    let mut lines = report.lines();

    let mut found_header = false;
    for line in lines.by_ref() {
        if line.split_whitespace().next() == Some("Server") && line.contains("Status") {
            found_header = true;
            break;
        }
    }
    if !found_header {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        // header continuation, e.g. "(log, page)"
        if trimmed.starts_with('(') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(DeployError::MalformedStatusReport(line.to_string()));
        }
        records.push(SecondaryStatus {
            name: fields[0].to_string(),
            replay_log: fields[1].to_string(),
            connection: fields[3].to_string(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
GBase Dynamic Server -- On-Line (Prim) -- Up 00:05:12

Primary server: p1
Current Log Page: 9,77

Server ACKed Log     Supports     Status
       (log, page)   Updates
h1_sec 9,77          No           SYNC(HDR),Connected,Active
rss_1  9,75          No           ASYNC(RSS),Connected,Active
rss_2  0,0           No           ASYNC(RSS),Disconnected

memory usage: 12MB
";

    #[test]
    fn parses_records_until_blank_line() {
        let records = parse_cluster_report(REPORT).unwrap();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].name, "h1_sec");
        assert_eq!(records[0].replay_log, "9,77");
        assert!(records[0].is_ok());

        assert!(records[1].is_ok());

        // no log replayed and disconnected
        assert!(!records[2].is_ok());
    }

    #[test]
    fn missing_header_reads_as_no_records() {
        let report = "GBase Dynamic Server -- On-Line -- Up 00:00:03\n";
        assert!(parse_cluster_report(report).unwrap().is_empty());
    }

    #[test]
    fn short_record_after_header_is_malformed() {
        let report = "Server ACKed Log  Supports  Status\nh1_sec 9,77\n";
        let err = parse_cluster_report(report).unwrap_err();
        assert!(matches!(err, DeployError::MalformedStatusReport(_)));
    }

    #[test]
    fn empty_replay_log_is_not_ok() {
        let status = SecondaryStatus {
            name: "rss_1".into(),
            replay_log: "0,0".into(),
            connection: "ASYNC(RSS),Connected,Active".into(),
        };
        assert!(!status.is_ok());
    }
}
