//! Asynchronous DHT operations.
//!
//! Each task is a plain future that talks to the message loop through a
//! [`LoopHandle`](super::message_loop::LoopHandle). Dropping a task cancels it.

mod announce;
mod closest;
mod get_peers;
mod initialise;
mod refresh_bucket;
mod replace_node;
mod send_query;

pub(crate) use announce::AnnounceTask;
#[cfg(test)]
pub(crate) use closest::ClosestNodes;
pub(crate) use get_peers::GetPeersTask;
pub(crate) use initialise::InitialiseTask;
pub(crate) use refresh_bucket::RefreshBucketTask;
pub(crate) use replace_node::ReplaceNodeTask;
