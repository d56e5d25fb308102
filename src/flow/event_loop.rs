//! Event loop that drives a flow for one instance.
//!
//! The loop receives events from workers (async blocks in FuturesUnordered)
//! and client commands (via mpsc channel), feeds them into the flow's
//! transition function, and dispatches the resulting effects as new workers.
//! It is the only writer of the instance's lifecycle state while a pass runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::CanneryError;
use crate::lifecycle::{LifecycleState, Transition};
use crate::workers::{self, WorkerContext};

use super::{Effect, Event, Flow, Stage, flow_requires_state};

// ── FlowContext ────────────────────────────────────────────────────

/// Shared context for the event loop and its workers.
pub struct FlowContext<'a> {
    /// Commands from the instance's owner (CancelDownload).
    pub command_rx: &'a mut mpsc::Receiver<Event>,

    /// Current lifecycle state; written only here during a pass.
    pub state_tx: &'a watch::Sender<LifecycleState>,

    /// Broadcasts transitions to all observers.
    pub transition_tx: &'a broadcast::Sender<Transition>,

    pub worker: Arc<WorkerContext>,
}

// ── Event loop ─────────────────────────────────────────────────────

/// Run the event loop for `flow`, starting with `started`.
///
/// Drives the flow by:
/// 1. Seeding initial effects from the start event
/// 2. Dispatching effects as async worker blocks in FuturesUnordered
/// 3. Feeding worker completion events and client commands back into the flow
/// 4. Publishing every transition to observers
/// 5. Exiting once no worker is left
pub async fn run_event_loop(
    flow: &dyn Flow,
    started: Event,
    ctx: &mut FlowContext<'_>,
) -> Result<LifecycleState, CanneryError> {
    let mut state = *ctx.state_tx.borrow();
    flow_requires_state(&state, flow.valid_entry_states())?;

    let mut workers: FuturesUnordered<Pin<Box<dyn Future<Output = Event> + Send>>> =
        FuturesUnordered::new();

    let mut event = started;
    loop {
        let (new_state, effects) = flow.transition(&state, &event);
        publish_transition(ctx, state, new_state, &event);
        state = new_state;

        for effect in effects {
            match effect {
                Effect::AbortDownload => {
                    tracing::info!("aborting installer download");
                    ctx.worker.cancel.cancel();
                }
                effect => workers.push(make_worker(effect, ctx.worker.clone())),
            }
        }

        if workers.is_empty() {
            break;
        }

        event = tokio::select! {
            // Worker completions.
            Some(evt) = workers.next() => evt,
            // Commands from the owner (e.g., CancelDownload).
            Some(cmd) = ctx.command_rx.recv() => cmd,
        };
    }

    if !state.is_terminal() && state != LifecycleState::Unknown {
        tracing::warn!(%state, "provisioning stopped without reaching a terminal state");
    }
    Ok(state)
}

// ── Worker dispatch ────────────────────────────────────────────────

/// Map an Effect to an async worker that produces an Event on completion.
fn make_worker(effect: Effect, ctx: Arc<WorkerContext>) -> Pin<Box<dyn Future<Output = Event> + Send>> {
    match effect {
        Effect::ResolveImage => Box::pin(async move {
            match workers::resolve_image(&ctx).await {
                Some(path) => Event::ImageAvailable(path),
                None => Event::ImageMissing,
            }
        }),
        Effect::DownloadImage => Box::pin(async move {
            match workers::download_image(&ctx).await {
                Ok(path) => Event::ImageDownloaded(path),
                Err(CanneryError::DownloadCancelled) => Event::DownloadCancelled,
                Err(e) => failed(&ctx, Stage::Download, e),
            }
        }),
        Effect::Configure { install_image } => Box::pin(async move {
            match workers::configure(&ctx, install_image.as_deref()).await {
                Ok(()) => Event::Configured { install_image },
                Err(e) => failed(&ctx, Stage::Configure, e),
            }
        }),
        Effect::Install { image } => Box::pin(async move {
            match workers::install(&ctx, &image).await {
                Ok(()) => Event::InstallComplete,
                Err(e) => failed(&ctx, Stage::Install, e),
            }
        }),
        Effect::Boot => Box::pin(async move {
            match workers::boot(&ctx).await {
                Ok(()) => Event::SessionStarted,
                Err(e) => failed(&ctx, Stage::Boot, e),
            }
        }),
        // Handled inline by the loop; never reaches a worker.
        Effect::AbortDownload => Box::pin(async { Event::DownloadCancelled }),
    }
}

fn failed(ctx: &WorkerContext, stage: Stage, error: CanneryError) -> Event {
    tracing::error!(%stage, error = %error, "provisioning step failed");
    let message = error.to_string();
    ctx.record_failure(error);
    Event::Failed { stage, message }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Publish a state transition to all observers.
fn publish_transition(
    ctx: &FlowContext<'_>,
    old: LifecycleState,
    new: LifecycleState,
    event: &Event,
) {
    if old != new {
        tracing::info!(from = %old, to = %new, "lifecycle transition");
    }
    ctx.state_tx.send_replace(new);
    // Ignore send error: no subscribers is fine.
    let _ = ctx.transition_tx.send(Transition::new(old, new, event.clone()));
}

// ── Tests ──────────────────────────────────────────────────────────
