//! Cancellation of in-flight operations

use tokio_util::sync::CancellationToken;
use zstor_common::{Error, Result};

/// Run `operation` until it completes or `token` is cancelled
///
/// On cancellation the operation's future is dropped, which aborts its
/// in-flight shard requests, and [`Error::Cancelled`] is returned. Pieces
/// stored before that point are not cleaned up.
pub async fn run_cancellable<F, T>(token: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}
