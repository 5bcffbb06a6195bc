use tracing::trace;

use super::super::message::Query;
use super::super::message_loop::{Command, LoopHandle};
use super::send_query::SendQueryTask;

/// Refreshes a quiet bucket by asking its nodes, oldest first, for their own
/// neighbourhood until one of them answers.
pub(crate) struct RefreshBucketTask {
    bucket: usize,
}

impl RefreshBucketTask {
    pub fn new(bucket: usize) -> Self {
        Self { bucket }
    }

    pub async fn execute(self, handle: &LoopHandle) -> bool {
        let nodes = handle.bucket_nodes(self.bucket).await.unwrap_or_default();
        let attempts = handle.settings().query_attempts;
        let mut refreshed = false;

        for node in nodes {
            let target = node.id;
            let result = SendQueryTask::new(node, Query::FindNode { target }, attempts)
                .execute(handle)
                .await;
            if result.response.is_some() {
                refreshed = true;
                break;
            }
        }

        trace!("Refreshed bucket {}: {}", self.bucket, refreshed);
        let _ = handle.send(Command::RefreshDone { bucket: self.bucket }).await;
        refreshed
    }
}
