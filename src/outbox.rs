//! Durable FIFO queue of mutations deferred while offline.
//!
//! Ops are appended in arrival order and never reordered. Replay removes
//! an op only after it has been applied remotely; a failing op blocks the
//! ones behind it so dependent mutations (a create before its update)
//! never apply out of order.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

use crate::api::error::ApiError;
use crate::api::types::Method;
use crate::store::LocalStore;

const OUTBOX: &str = "outbox";

/// A deferred mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxOp {
  pub method: Method,
  /// Request path, e.g. "/plants".
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  /// Enqueue time, epoch milliseconds.
  pub timestamp: i64,
}

impl OutboxOp {
  pub fn new(method: Method, url: impl Into<String>, body: Option<Value>) -> Self {
    Self {
      method,
      url: url.into(),
      body,
      timestamp: chrono::Utc::now().timestamp_millis(),
    }
  }
}

/// Outcome of a flush pass.
#[derive(Debug)]
pub struct FlushReport {
  /// Ops confirmed remotely and removed from the queue.
  pub replayed: usize,
  /// Ops still queued (the failing op first, in original order).
  pub remaining: usize,
  /// The error that stopped replay, if any.
  pub error: Option<ApiError>,
  /// True when another flush was already in progress and this call did
  /// nothing.
  pub skipped: bool,
}

impl FlushReport {
  fn skipped() -> Self {
    Self {
      replayed: 0,
      remaining: 0,
      error: None,
      skipped: true,
    }
  }
}

pub struct Outbox {
  store: LocalStore,
  flushing: tokio::sync::Mutex<()>,
}

impl Outbox {
  pub fn new(store: LocalStore) -> Self {
    Self {
      store,
      flushing: tokio::sync::Mutex::new(()),
    }
  }

  /// Append an op to the queue.
  pub fn enqueue(&self, op: OutboxOp) -> Result<()> {
    let mut ops: Vec<OutboxOp> = self.store.read_collection(OUTBOX)?;
    tracing::info!(method = %op.method, url = %op.url, queued = ops.len() + 1, "queued offline mutation");
    ops.push(op);
    self.store.write_collection(OUTBOX, &ops)
  }

  pub fn ops(&self) -> Result<Vec<OutboxOp>> {
    self.store.read_collection(OUTBOX)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.ops()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.ops()?.is_empty())
  }

  /// Drop every queued op. This is the manual resolution path for an op
  /// the server keeps rejecting; the discarded mutations are lost.
  pub fn clear(&self) -> Result<usize> {
    let ops = self.ops()?;
    self.store.write_collection(OUTBOX, &Vec::<OutboxOp>::new())?;
    Ok(ops.len())
  }

  /// Replay queued ops strictly in FIFO order.
  ///
  /// Each op is removed (and the queue persisted) only after `replay`
  /// returns Ok. On the first error the processed prefix stays removed,
  /// the failing op and everything behind it stay queued in order, and
  /// the pass stops. Calling flush with an empty queue is a no-op; a
  /// re-entrant call while a flush is running is skipped.
  pub async fn flush<F, Fut>(&self, mut replay: F) -> Result<FlushReport>
  where
    F: FnMut(OutboxOp) -> Fut,
    Fut: Future<Output = std::result::Result<Value, ApiError>>,
  {
    let _guard = match self.flushing.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        tracing::debug!("flush already in progress, skipping");
        return Ok(FlushReport::skipped());
      }
    };

    let mut ops: Vec<OutboxOp> = self.store.read_collection(OUTBOX)?;
    let mut replayed = 0;

    while let Some(op) = ops.first().cloned() {
      match replay(op.clone()).await {
        Ok(_) => {
          ops.remove(0);
          self.store.write_collection(OUTBOX, &ops)?;
          replayed += 1;
          tracing::debug!(method = %op.method, url = %op.url, "replayed queued mutation");
        }
        Err(error) => {
          tracing::warn!(
            method = %op.method,
            url = %op.url,
            error = %error,
            remaining = ops.len(),
            "replay stopped; op stays queued"
          );
          return Ok(FlushReport {
            replayed,
            remaining: ops.len(),
            error: Some(error),
            skipped: false,
          });
        }
      }
    }

    Ok(FlushReport {
      replayed,
      remaining: 0,
      error: None,
      skipped: false,
    })
  }
}
