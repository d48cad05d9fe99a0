use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

/// Spawn `fut` inside `span`. The task stops when either the future
/// finishes or `token` is cancelled, whichever is first.
pub(crate) fn spawn_with_cancel<F>(
    span: tracing::Span,
    token: CancellationToken,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("task cancelled");
                }
                res = fut => match res {
                    Ok(()) => trace!("task finished"),
                    Err(e) => debug!("task finished with error: {e:#}"),
                },
            }
        }
        .instrument(span),
    )
}
