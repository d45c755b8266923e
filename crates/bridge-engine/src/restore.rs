//! Startup restore of sessions with stored credentials.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::registry::SessionRegistry;

/// Outcome counts of one restore pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Resume every restorable session, one at a time with `spacing` between
/// attempts. A failed session never stops the others. Returns early when
/// `cancel` fires.
pub async fn restore_sessions(
    registry: &SessionRegistry,
    spacing: Duration,
    cancel: &CancellationToken,
) -> Result<RestoreReport, SessionError> {
    let sessions = registry.deps().store.list_restorable().await?;
    info!(count = sessions.len(), "restoring sessions");

    let mut report = RestoreReport::default();
    for (i, session) in sessions.iter().enumerate() {
        if i > 0 {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(spacing) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        match registry.start_restore(&session.session_id).await {
            Ok(snapshot) => {
                info!(session_id = %session.session_id, status = %snapshot.status, "session restored");
                report.restored += 1;
            }
            Err(SessionError::NoCredentials(_)) => {
                info!(session_id = %session.session_id, "no credentials, skipped");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "restore failed");
                report.failed += 1;
            }
        }
    }

    info!(
        restored = report.restored,
        skipped = report.skipped,
        failed = report.failed,
        "restore finished"
    );
    Ok(report)
}

/// Run [`restore_sessions`] in the background.
pub fn spawn_restore(
    registry: Arc<SessionRegistry>,
    spacing: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = restore_sessions(&registry, spacing, &cancel).await {
            warn!(error = %e, "restore could not list sessions");
        }
    })
}
