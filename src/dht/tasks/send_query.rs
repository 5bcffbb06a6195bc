use tracing::{debug, trace};

use super::super::message::{Query, ResponseBody};
use super::super::message_loop::{LoopHandle, QueryOutcome};
use super::super::node::Node;

#[derive(Debug)]
pub(crate) struct QueryResult {
    pub node: Node,
    /// Set when the node answered with a valid response.
    pub response: Option<ResponseBody>,
    /// Every attempt went unanswered.
    pub timed_out: bool,
}

/// Sends one query, retrying only when an attempt times out.
pub(crate) struct SendQueryTask {
    node: Node,
    query: Query,
    attempts: u32,
}

impl SendQueryTask {
    pub fn new(node: Node, query: Query, attempts: u32) -> Self {
        Self {
            node,
            query,
            attempts: attempts.max(1),
        }
    }

    pub async fn execute(mut self, handle: &LoopHandle) -> QueryResult {
        for attempt in 1..=self.attempts {
            match handle.query(self.node.clone(), self.query.clone()).await {
                QueryOutcome::Response(body) => {
                    self.node.seen();
                    return self.finish(Some(body), false);
                }
                QueryOutcome::TimedOut => {
                    self.node.failed();
                    trace!(
                        "{} to {} timed out (attempt {}/{})",
                        self.query.method(),
                        self.node.addr,
                        attempt,
                        self.attempts
                    );
                }
                QueryOutcome::Error(error) => {
                    debug!(
                        "{} to {} answered with error {}: {}",
                        self.query.method(),
                        self.node.addr,
                        error.code,
                        error.message
                    );
                    return self.finish(None, false);
                }
                QueryOutcome::Failed(e) => {
                    debug!("{} to {} failed: {}", self.query.method(), self.node.addr, e);
                    return self.finish(None, false);
                }
            }
        }

        self.finish(None, true)
    }

    fn finish(self, response: Option<ResponseBody>, timed_out: bool) -> QueryResult {
        QueryResult {
            node: self.node,
            response,
            timed_out,
        }
    }
}
