//! Panic containment for spawned tasks.
//!
//! Each session (and each background task the server owns) runs inside an
//! inner task whose `JoinHandle` is awaited by a thin outer task. A panic
//! unwinds only the inner task; the outer task logs it and runs the caller's
//! fallback, so the accept loop never sees it.

use std::any::Any;
use std::future::Future;

use tokio::task::JoinHandle;

/// Spawn `task` so that a panic inside it is logged and handed to
/// `on_fault` instead of propagating.
pub fn spawn_supervised<F, G>(name: &'static str, task: F, on_fault: G) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
    G: FnOnce(&str) + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::spawn(task).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = panic_message(payload.as_ref());
                tracing::error!(task = name, panic = %message, "task panicked");
                on_fault(&message);
            }
            Err(_) => {
                tracing::warn!(task = name, "task cancelled");
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
