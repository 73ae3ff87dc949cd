//! Interrupt handling for a migration run.
//!
//! Work is never abandoned mid-item. The first SIGINT, SIGTERM or SIGHUP
//! cancels the returned token: the Puller finishes the asset in hand and stops
//! listing, then the Pushers empty the queue and the run still ends with the
//! staging sweep and summary. A second signal exits immediately with status
//! 130; staged files stay on disk and the next run's `prepare` reconciles them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// Register the handlers and return a token cancelled by the first signal.
/// Registration errors surface here rather than in the listener task.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?,
            signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::info!("Received shutdown signal, pushing what is already staged...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested, staged files are kept for the next run");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}
