use tokio::select;
use tokio_util::sync::CancellationToken;

/// Detects signals sent to the process and flips the shared cancellation
/// token. Detached Windows processes can't see console signals, so this is
/// best-effort there.
pub async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation.cancel();
        },
    };
}
