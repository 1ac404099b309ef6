use std::any::Any;
use tokio::sync::watch;

pub(crate) fn metric_name(name: &str) -> String {
    format!("node_controller_{}", name)
}

/// Best effort extraction of the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves once `stop` is set or its sender is gone.
///
/// The borrowed value is released before returning, so the future stays `Send`
/// when used as a `select!` branch.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
