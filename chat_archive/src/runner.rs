use anyhow::{Context, Result};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::bridge::{BridgeSettings, BridgeSource};
use crate::config::{Cli, Config};
use crate::live::LiveReconciler;
use crate::maintenance;
use crate::media::MediaMaterializer;
use crate::source::MessageSource;
use crate::store::Store;
use crate::sync::{Archiver, StopPolicy};

/// Pick the backfill stop policy from the command line.
pub fn stop_policy(cli: &Cli, now: OffsetDateTime) -> StopPolicy {
    if cli.all {
        StopPolicy::Full
    } else if let Some(days) = cli.days {
        StopPolicy::Cutoff(now - Duration::days(i64::from(days)))
    } else {
        StopPolicy::KnownId
    }
}

/// Entry point: print the activity log, consolidate media, or archive
/// (and optionally keep listening).
pub async fn run(cli: &Cli, cfg: Config) -> Result<()> {
    if let Some(limit) = cli.log {
        let store = Store::open_read_only(&cfg.database)?;
        for line in store.recent_activity(limit)? {
            println!("{line}");
        }
        return Ok(());
    }

    if cli.consolidate {
        let mut store = Store::open(&cfg.database)?;
        let report = maintenance::consolidate_media(&mut store, &cfg.root, cli.commit).await?;
        println!(
            "checked {} media references: {} hashed, {} relinked, {} duplicates, {} missing, {} stale files{}",
            report.checked,
            report.hashed,
            report.relinked,
            report.duplicates,
            report.missing.len(),
            report.stale.len(),
            if cli.commit { "" } else { " (dry run)" }
        );
        return store.close();
    }

    let credentials = cfg.require_credentials()?.clone();
    std::fs::create_dir_all(&cfg.root)
        .with_context(|| format!("failed to create {}", cfg.root.display()))?;
    let store = Store::open(&cfg.database)?;
    let media = MediaMaterializer::new(&cfg.root, cfg.save_self_destructing);
    let mut archiver = Archiver::new(store, media, cfg.page_size);

    let mut source = BridgeSource::new(BridgeSettings {
        command: cfg.bridge_command.clone(),
        args: cfg.bridge_args.clone(),
        api_id: credentials.api_id,
        api_hash: credentials.api_hash,
        session: cfg.session.to_string_lossy().into_owned(),
    });
    source.connect().await?;

    let policy = stop_policy(cli, OffsetDateTime::now_utc());
    info!(?policy, "starting backfill");
    let reports = archiver.archive_all(&mut source, cli.dialog, policy).await?;
    let written: usize = reports.iter().map(|(_, r)| r.written).sum();
    info!(dialogs = reports.len(), written, "backfill finished");

    if cli.listen {
        let mut live = LiveReconciler::new(archiver, cfg.reconnect_backoff);
        live.run_forever(&mut source).await;
        return Ok(());
    }
    archiver.into_store().close()
}
