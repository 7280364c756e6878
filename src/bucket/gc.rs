//! Version garbage collection
//!
//! Deciding what to delete is a pure function over the version children of
//! a bucket path. The worker only schedules and executes those decisions:
//! requests wait in a min-heap ordered by due time and each run re-reads the
//! bucket state before deleting anything.

use crate::client::MetaClient;
use crate::common::{join_path, Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Versions that may be deleted, in ascending order.
///
/// Only numeric children are versions. A version is a candidate when it is
/// older than both `cutoff` and the `published` one, and it is not among the
/// `min_retained` newest versions at or below `published`. Versions above
/// `published` belong to writers still in flight and are never touched.
pub fn plan_gc(children: &[String], published: u64, cutoff: u64, min_retained: usize) -> Vec<u64> {
    let mut settled: Vec<u64> = children
        .iter()
        .filter_map(|name| name.parse::<u64>().ok())
        .filter(|v| *v <= published)
        .collect();
    settled.sort_unstable_by(|a, b| b.cmp(a));

    let limit = cutoff.min(published);
    let mut doomed: Vec<u64> = settled
        .into_iter()
        .skip(min_retained.max(1))
        .filter(|v| *v < limit)
        .collect();
    doomed.sort_unstable();
    doomed
}

/// Delete superseded versions under `path`. Returns the number removed.
pub async fn collect(
    client: &MetaClient,
    path: &str,
    cutoff: u64,
    min_retained: usize,
) -> Result<usize> {
    let pointer = join_path(path, super::LAST_SUCCESSFUL_WRITE_KEY);
    let published = match client.get(&pointer).await {
        Ok(bytes) => super::parse_version(&pointer, &bytes)?,
        // Bucket deleted since the run was scheduled
        Err(Error::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };
    let children = match client.get_children(path).await {
        Ok(children) => children,
        Err(Error::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for version in plan_gc(&children, published, cutoff, min_retained) {
        let version_path = join_path(path, &version.to_string());
        if client.delete_recursive(&version_path).await? > 0 {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::debug!(
            "GC removed {} versions under {} (cutoff {}, published {})",
            removed,
            path,
            cutoff,
            published
        );
    }
    Ok(removed)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GcRequest {
    due: Instant,
    path: String,
    cutoff: u64,
}

/// Background task running delayed GC passes
pub struct GcWorker {
    tx: mpsc::UnboundedSender<GcRequest>,
    handle: JoinHandle<()>,
}

impl GcWorker {
    /// Spawn the worker. Requires a tokio runtime.
    pub fn spawn(client: Arc<MetaClient>, min_retained: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(client, min_retained, rx));
        tracing::info!("Started bucket GC worker");
        Self { tx, handle }
    }

    /// Collect versions below `cutoff` under `path` once `delay` has passed
    pub fn schedule(&self, path: &str, cutoff: u64, delay: Duration) {
        let request = GcRequest {
            due: Instant::now() + delay,
            path: path.to_string(),
            cutoff,
        };
        if self.tx.send(request).is_err() {
            tracing::debug!("GC worker stopped; dropping pass for {}", path);
        }
    }

    /// Cancel pending passes and stop the task
    pub fn shutdown(&self) {
        if !self.handle.is_finished() {
            tracing::info!("Stopping bucket GC worker");
        }
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    client: Arc<MetaClient>,
    min_retained: usize,
    mut rx: mpsc::UnboundedReceiver<GcRequest>,
) {
    let mut pending: BinaryHeap<Reverse<GcRequest>> = BinaryHeap::new();

    loop {
        let next_due = pending.peek().map(|Reverse(request)| request.due);
        let wait = async move {
            match next_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = rx.recv() => match received {
                Some(request) => pending.push(Reverse(request)),
                None => break,
            },
            _ = wait => {
                let now = Instant::now();
                while pending.peek().is_some_and(|Reverse(r)| r.due <= now) {
                    let Some(Reverse(request)) = pending.pop() else {
                        break;
                    };
                    if let Err(e) =
                        collect(&client, &request.path, request.cutoff, min_retained).await
                    {
                        tracing::warn!("GC pass for {} failed: {}", request.path, e);
                    }
                }
            }
        }
    }

    tracing::debug!("GC worker exiting ({} passes dropped)", pending.len());
}
