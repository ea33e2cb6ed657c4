use crate::node::Node;
use gbasedeploy_common::{DeployError, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

struct PoolState {
    idle: Vec<Node>,
    warmed: bool,
}

/// Pool of pre-warmed spare server instances.
///
/// Checkout can be called concurrently from multiple callers, so the idle
/// list and the warmed flag sit behind a mutex; this is the one place in the
/// toolkit where in-process locking matters, since orchestration itself is
/// single-threaded.
pub struct ServerPool {
    inner: Mutex<PoolState>,
}

impl ServerPool {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            inner: Mutex::new(PoolState {
                idle: nodes,
                warmed: false,
            }),
        }
    }

    /// Initialize every idle node once. Nodes are taken out of the pool for
    /// the duration, so concurrent checkouts during warming see an empty
    /// pool rather than an uninitialized node. A node that fails to
    /// initialize is dropped from the pool (a failed init is terminal).
    pub async fn prewarm(&self) -> Result<()> {
        let nodes = {
            let mut state = self.inner.lock();
            if state.warmed {
                return Ok(());
            }
            std::mem::take(&mut state.idle)
        };

        let mut ready = Vec::new();
        let mut failure = None;
        for node in nodes {
            match node.initialize().await {
                Ok(()) => ready.push(node),
                Err(e) => {
                    warn!(node = %node.name(), error = %e, "pool node failed to initialize");
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut state = self.inner.lock();
        state.idle = ready;
        state.warmed = true;
        info!(idle = state.idle.len(), "server pool warmed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn checkout(&self) -> Result<Node> {
        self.inner.lock().idle.pop().ok_or(DeployError::PoolExhausted)
    }

    pub fn checkin(&self, node: Node) {
        self.inner.lock().idle.push(node);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;
    use gbasedeploy_exec::{FakeExecutor, Machine};
    use std::sync::Arc;

    fn node(fake: &Arc<FakeExecutor>, name: &str) -> Node {
        Node::new(
            NodeSpec::new(name, "h1", 9088, format!("/data/{name}")),
            Machine::new("h1", fake.clone()),
        )
    }

    #[tokio::test]
    async fn prewarm_initializes_each_node_once() {
        let fake = Arc::new(FakeExecutor::new());
        let pool = ServerPool::new(vec![node(&fake, "spare1"), node(&fake, "spare2")]);

        pool.prewarm().await.unwrap();
        pool.prewarm().await.unwrap();

        assert_eq!(fake.op_count("oninit -iy"), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn checkout_and_checkin() {
        let fake = Arc::new(FakeExecutor::new());
        let pool = ServerPool::new(vec![node(&fake, "spare1")]);
        pool.prewarm().await.unwrap();

        let checked_out = pool.checkout().unwrap();
        assert!(matches!(
            pool.checkout().unwrap_err(),
            DeployError::PoolExhausted
        ));

        pool.checkin(checked_out);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn failed_node_is_dropped_from_the_pool() {
        let fake = Arc::new(FakeExecutor::new());
        fake.on("oninit -iy", 1, "init failed");
        let pool = ServerPool::new(vec![node(&fake, "spare1")]);

        assert!(pool.prewarm().await.is_err());
        assert_eq!(pool.idle_count(), 0);
    }
}
