use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// Run a background future, converting a panic into an error message.
///
/// Spawned tasks report back through the event channel; a panic would
/// otherwise leave the waiting state (a loading slot, an in-flight toggle)
/// unresolved forever.
pub async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic payload".to_string()
            }
        })
}
