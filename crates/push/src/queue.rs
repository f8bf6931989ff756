use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Enqueue a command without waiting for queue space.
///
/// A full queue hands the command to a background task so the caller never
/// blocks; a stopped actor drops it.
///
/// An overflowed command loses its place: commands sent after it, detached
/// or not, may be applied first. Only identity-checked commands go through
/// here (OFFLINE and the CLEAR issued by `close`), and those are no-ops
/// once their key has been reopened, so a late one cannot undo newer state.
pub(crate) fn enqueue_detached<T>(queue: &mpsc::Sender<T>, command: T, actor: &'static str)
where
    T: Send + 'static,
{
    match queue.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(command)) => {
            let queue = queue.clone();
            tokio::spawn(async move {
                if queue.send(command).await.is_err() {
                    debug!(actor, "actor stopped, command dropped");
                }
            });
        }
        Err(TrySendError::Closed(_)) => debug!(actor, "actor stopped, command dropped"),
    }
}
