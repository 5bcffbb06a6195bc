use tracing::{debug, trace};

use super::super::error::DhtError;
use super::super::message::Query;
use super::super::message_loop::{Command, LoopHandle};
use super::send_query::SendQueryTask;

/// Decides whether a full bucket's replacement candidate gets in.
///
/// The bucket's nodes are pinged oldest first. The first one that stays
/// silent is swapped for the candidate. Finding a node seen within the grace
/// period ends the task and drops the candidate.
pub(crate) struct ReplaceNodeTask {
    bucket: usize,
}

impl ReplaceNodeTask {
    pub fn new(bucket: usize) -> Self {
        Self { bucket }
    }

    pub async fn execute(self, handle: &LoopHandle) -> bool {
        let replaced = match self.replace(handle).await {
            Ok(replaced) => replaced,
            Err(e) => {
                debug!("Replacement in bucket {} aborted: {}", self.bucket, e);
                false
            }
        };

        let _ = handle
            .send(Command::ReplacementDone {
                bucket: self.bucket,
            })
            .await;
        replaced
    }

    async fn replace(&self, handle: &LoopHandle) -> Result<bool, DhtError> {
        let grace = handle.settings().replacement_grace;

        for node in handle.bucket_nodes(self.bucket).await? {
            if node.last_seen.is_some_and(|at| at.elapsed() < grace) {
                trace!("Bucket {} is healthy, dropping candidate", self.bucket);
                return Ok(false);
            }

            let id = node.id;
            let result = SendQueryTask::new(node, Query::Ping, 1).execute(handle).await;
            if result.timed_out {
                return handle.replace(self.bucket, id).await;
            }
        }

        Ok(false)
    }
}
