//! Worker pool: several worker nodes sharing one transport context.

use crate::config::DEFAULT_CLIENT_INTERVAL;
use crate::node::{self, Handler};
use anyhow::{Context as _, Result, bail};
use liveness_core::{Context, NodeConfig, NodeIdentity, NodeRole, NodeSocket};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct WorkerPool {
    ctx: Context,
    workers: Vec<Arc<NodeSocket>>,
}

impl WorkerPool {
    /// Build `count` workers on a fresh context.
    pub fn new(config: &NodeConfig, base: &NodeIdentity, count: usize) -> Result<Self> {
        Self::with_context(Context::new(), config, base, count)
    }

    /// Build `count` workers on `ctx`. Worker `i` runs as `{node_id}-{i}`
    /// within the session of `base`.
    pub fn with_context(
        ctx: Context,
        config: &NodeConfig,
        base: &NodeIdentity,
        count: usize,
    ) -> Result<Self> {
        if config.role != NodeRole::Worker {
            bail!("A worker pool needs the worker role, not {}", config.role.as_str());
        }
        if count == 0 {
            bail!("A worker pool needs at least one worker");
        }

        let workers = (0..count)
            .map(|index| -> Result<Arc<NodeSocket>> {
                let identity = NodeIdentity::new(
                    format!("{}-{}", base.node_id, index),
                    base.session_id.clone(),
                )?;
                let worker = NodeSocket::with_context(ctx.clone(), config.clone(), identity)
                    .with_context(|| format!("Failed to create worker {}", index))?;
                Ok(Arc::new(worker))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ctx, workers })
    }

    pub fn workers(&self) -> &[Arc<NodeSocket>] {
        &self.workers
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Serve with every worker until `cancel` fires or one worker fails
    /// fatally, then terminate the shared context.
    pub async fn run(&self, handler: Handler, cancel: CancellationToken) -> Result<()> {
        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        for (index, worker) in self.workers.iter().enumerate() {
            let worker = worker.clone();
            let handler = handler.clone();
            let stop = stop.clone();
            let span = tracing::info_span!("worker", index);
            tasks.spawn(
                async move {
                    node::run_with_handler(&worker, DEFAULT_CLIENT_INTERVAL, handler, stop).await
                }
                .instrument(span),
            );
        }
        tracing::info!("Worker pool running {} workers", self.workers.len());

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .context("Worker task panicked")
                .and_then(|result| result);
            if let Err(e) = result {
                tracing::error!("Worker failed: {:#}", e);
                stop.cancel();
                failure.get_or_insert(e);
            }
        }

        self.ctx.terminate();
        tracing::info!("Worker pool stopped");
        failure.map_or(Ok(()), Err)
    }
}
