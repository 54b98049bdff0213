use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bosun_config::{BosunConfig, LayoutResolver};
use bosun_core::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the job workers until `shutdown` resolves, then stops every
/// supervised process and drains in-flight jobs within the configured grace
/// period.
pub async fn run<S>(config: BosunConfig, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let workspaces_dir = config.workspaces_dir();
    tokio::fs::create_dir_all(&workspaces_dir)
        .await
        .with_context(|| format!("creating workspaces dir {}", workspaces_dir.display()))?;

    let grace = config.runtime.process.graceful_shutdown_timeout();
    let resolver = Arc::new(LayoutResolver::new(&workspaces_dir));
    let runtime = Runtime::new(config.runtime, resolver).context("building runtime")?;

    info!(
        workspaces_dir = %workspaces_dir.display(),
        system = %runtime.system_id(),
        "bosun ready"
    );

    let cancel = CancellationToken::new();
    let workers = tokio::spawn(runtime.jobs().work(cancel.clone()));

    shutdown.await;
    info!("shutdown requested; stopping processes and draining jobs");
    cancel.cancel();

    let abort = CancellationToken::new();
    let processes = runtime.processes();
    let drained = tokio::time::timeout(grace, async {
        processes.clean(abort.clone()).await;
        workers.await
    })
    .await;

    match drained {
        Ok(Ok(())) => info!("shutdown complete"),
        Ok(Err(err)) => error!(error = %err, "job workers ended abnormally"),
        Err(_) => {
            abort.cancel();
            warn!(
                timeout_ms = grace.as_millis() as u64,
                live_processes = processes.live_count(),
                "graceful shutdown timed out"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_after_shutdown_signal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = BosunConfig::default();
        config.runtime.workspaces_dir = Some(dir.path().join("workspaces"));
        config.runtime.process.graceful_shutdown_timeout_ms = 2_000;

        tokio::time::timeout(std::time::Duration::from_secs(5), run(config, async {}))
            .await
            .expect("daemon stopped")
            .expect("clean exit");

        assert!(dir.path().join("workspaces").is_dir());
    }
}
