//! Syncs the spec files that were changed by a single commit to the cluster.
//!
//! Usage: `cargo run --example sync-commit -- <repo-path> [<commit>]`
//!
//! The controller name is read from `KUBESYNC_CONTROLLER_NAME`, and the cluster connection comes from
//! the pod's service account or else the kubeconfig file.
use kubesync::prelude::*;

use anyhow::{anyhow, Context, Error};

const USER_AGENT: &str = "kubesync-sync-commit";

fn main() -> Result<(), Error> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let repo_path = args
        .next()
        .ok_or_else(|| anyhow!("usage: sync-commit <repo-path> [<commit>]"))?;
    let commit = args.next().unwrap_or_else(|| "HEAD".to_owned());

    let sync_config = SyncConfig::from_env().context("invalid sync configuration")?;
    let client_config = ClientConfig::load(USER_AGENT).context("failed to load client config")?;
    let metrics = Metrics::new();
    let client = Client::new(client_config, metrics.client_metrics())
        .context("failed to create client")?;
    let syncer = SpecSyncer::new(client, &sync_config, metrics.clone());

    let project = GitProject::open(repo_path.as_str())?;
    let diffs = project.diff_commit(commit.as_str())?;
    log::info!(
        "Syncing {} spec files from commit {} as '{}'",
        diffs.len(),
        commit,
        sync_config.controller_name
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(syncer.sync_push(&project, &diffs));
    print!("{}", report);

    let metrics_text = metrics.encode_as_text()?;
    log::debug!("Metrics:\n{}", String::from_utf8_lossy(&metrics_text));

    if report.is_degraded() {
        Err(anyhow!(
            "{} of {} spec files failed to sync",
            report.failures.len(),
            diffs.len()
        ))
    } else {
        Ok(())
    }
}
