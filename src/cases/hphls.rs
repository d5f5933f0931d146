//! High-performance HLS setting: whether playlists carry an `hls_ctx` query.

use async_trait::async_trait;
use tracing::info;

use super::{settle, Case, Harness, Verdict};
use crate::api::types::{paths, HpHls};
use crate::api::{poll_until, Restore};
use crate::context::RunContext;
use crate::error::HarnessError;

/// Switch the flag and wait until the server reports it.
///
/// Returns the guard that puts the original value back. The server applies
/// the setting asynchronously, so the new value is polled for instead of
/// assumed.
pub async fn apply_hls_ctx(
    harness: &Harness,
    ctx: &RunContext,
    no_hls_ctx: bool,
) -> Result<Restore, HarnessError> {
    let api = harness.api();
    let initial: HpHls = api.query(ctx, paths::HPHLS_QUERY).await?;
    let restore = api.with_restore(
        "hphls",
        paths::HPHLS_UPDATE,
        &initial,
        harness.config().suite.restore_timeout(),
    )?;

    let wanted = HpHls { no_hls_ctx };
    api.update(ctx, paths::HPHLS_UPDATE, &wanted).await?;

    let (attempts, interval) = settle(harness);
    poll_until(ctx, "hphls setting", attempts, interval, move || async move {
        let current: HpHls = api.query(ctx, paths::HPHLS_QUERY).await?;
        if current == wanted {
            Ok(Some(()))
        } else {
            Err(HarnessError::assertion(format!("invalid response {:?}", current)))
        }
    })
    .await?;
    info!(no_hls_ctx, was = initial.no_hls_ctx, "hphls setting applied");
    Ok(restore)
}

pub struct SetupHpHls {
    pub no_hls_ctx: bool,
}

#[async_trait]
impl Case for SetupHpHls {
    fn name(&self) -> &'static str {
        if self.no_hls_ctx {
            "setup_hphls_no_hls_ctx"
        } else {
            "setup_hphls_with_hls_ctx"
        }
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let restore = apply_hls_ctx(harness, ctx, self.no_hls_ctx).await?;
        // A failed restore is logged by the guard and does not fail the case.
        let _ = restore.run().await;
        Ok(Verdict::Pass)
    }
}
