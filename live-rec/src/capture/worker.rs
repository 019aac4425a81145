//! The capture worker loop.

use std::path::Path;

use chrono::Local;
use tracing::{debug, error, info, warn};

use super::{CaptureContext, CaptureOutcome};
use crate::events::CaptureEvent;
use crate::fallback::{CaptureState, Decision, Protocol};
use crate::recorder::RecordRequest;
use crate::registry::Target;
use crate::session::{Session, fragment_dir, new_fragment_path};
use crate::utils::fs;

/// Run one capture session for `target`.
///
/// The lock is taken first and released last, after consolidation. If the
/// lock is already held the call returns [`CaptureOutcome::LockHeld`] without
/// touching anything else.
pub async fn run_capture(ctx: &CaptureContext, target: Target) -> CaptureOutcome {
    let guard = match ctx.locks.try_acquire(&target.name).await {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            debug!(target_name = %target.name, "Lock held elsewhere, skipping");
            return CaptureOutcome::LockHeld;
        }
        Err(e) => {
            error!(target_name = %target.name, error = %e, "Failed to take capture lock");
            return CaptureOutcome::LockError;
        }
    };

    let outcome = run_session(ctx, &target).await;

    if let Err(e) = guard.release().await {
        warn!(target_name = %target.name, error = %e, "Failed to release capture lock");
    }
    outcome
}

async fn run_session(ctx: &CaptureContext, target: &Target) -> CaptureOutcome {
    let urls = std::iter::once(target.primary_url.as_str()).chain(target.secondary_url.as_deref());
    let session = Session::resolve(&ctx.extractor, &target.name, urls);
    let has_secondary = target.secondary_url.is_some();

    let Some(initial) = ctx.fallback.initial_protocol(&target.name, has_secondary) else {
        warn!(
            target_name = %target.name,
            "Target is pinned to the secondary protocol but has no secondary URL"
        );
        ctx.events.emit(CaptureEvent::SessionExhausted {
            target: target.name.clone(),
            session_id: session.id.clone(),
        });
        return CaptureOutcome::Exhausted {
            session_id: session.id,
        };
    };

    info!(
        target_name = %target.name,
        session_id = %session.id,
        protocol = %initial,
        "Capture session started"
    );
    ctx.events.emit(CaptureEvent::SessionStarted {
        target: target.name.clone(),
        session_id: session.id.clone(),
        protocol: initial,
    });

    let mut state = CaptureState::new(initial, has_secondary);
    let mut attempt = 0u32;
    loop {
        match ctx.policy.next(&state) {
            Decision::Attempt { protocol, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
                let succeeded = record_fragment(ctx, target, &session, protocol, attempt).await;
                state.record(succeeded);
            }
            Decision::SwitchToSecondary => {
                warn!(
                    target_name = %target.name,
                    session_id = %session.id,
                    attempts = state.primary_failures(),
                    "Primary protocol exhausted, switching to secondary"
                );
                if let Err(e) = ctx.fallback.learn(&target.name).await {
                    error!(target_name = %target.name, error = %e, "Failed to persist fallback membership");
                }
                ctx.events.emit(CaptureEvent::SwitchedToSecondary {
                    target: target.name.clone(),
                    session_id: session.id.clone(),
                });
                state.switch_to_secondary();
            }
            Decision::Finish => break,
        }
    }

    finish(ctx, target, session).await
}

/// Record one fragment; `true` if it produced a non-empty file.
async fn record_fragment(
    ctx: &CaptureContext,
    target: &Target,
    session: &Session,
    protocol: Protocol,
    attempt: u32,
) -> bool {
    let url = match protocol {
        Protocol::Primary => target.primary_url.as_str(),
        Protocol::Secondary => match target.secondary_url.as_deref() {
            Some(url) => url,
            None => return false,
        },
    };

    let dir = fragment_dir(&ctx.segments_dir, &target.name);
    if let Err(e) = fs::ensure_dir_all_with_op("creating fragment directory", &dir).await {
        error!(target_name = %target.name, error = %e, "Cannot prepare fragment directory");
        emit_attempt_failed(ctx, target, session, protocol, attempt, e.to_string());
        return false;
    }

    let ext = ctx.recorder_config.container_for(protocol);
    let output = new_fragment_path(&ctx.segments_dir, &target.name, &session.id, ext, Local::now());
    let request = RecordRequest {
        target: target.name.clone(),
        session_id: session.id.clone(),
        protocol,
        url: url.to_string(),
        output,
    };

    info!(
        target_name = %target.name,
        session_id = %session.id,
        protocol = %protocol,
        attempt,
        output = %request.output.display(),
        "Recording attempt started"
    );

    let exit = match ctx.recorder.record(&request).await {
        Ok(exit) => exit,
        Err(e) => {
            if e.is_tool_unavailable() {
                error!(target_name = %target.name, error = %e, "Recording tool unavailable");
            } else {
                warn!(target_name = %target.name, error = %e, "Recording attempt could not run");
            }
            discard_fragment(&request.output).await;
            emit_attempt_failed(ctx, target, session, protocol, attempt, e.to_string());
            return false;
        }
    };

    let size = fs::file_size(&request.output).await.unwrap_or(0);
    if size > 0 {
        if !exit.exited_cleanly() {
            debug!(
                target_name = %target.name,
                exit_code = ?exit.exit_code,
                last_error = ?exit.last_error,
                "Recorder exited with an error after writing data"
            );
        }
        info!(
            target_name = %target.name,
            session_id = %session.id,
            protocol = %protocol,
            attempt,
            bytes = size,
            elapsed_secs = exit.elapsed.as_secs(),
            "Recording attempt produced a fragment"
        );
        return true;
    }

    discard_fragment(&request.output).await;
    let reason = exit
        .last_error
        .clone()
        .unwrap_or_else(|| match exit.exit_code {
            Some(code) => format!("exit code {code}, no data written"),
            None => "terminated by signal, no data written".to_string(),
        });
    warn!(
        target_name = %target.name,
        session_id = %session.id,
        protocol = %protocol,
        attempt,
        reason = %reason,
        "Recording attempt failed"
    );
    emit_attempt_failed(ctx, target, session, protocol, attempt, reason);
    false
}

async fn discard_fragment(path: &Path) {
    if let Err(e) = fs::remove_file_if_exists(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove empty fragment");
    }
}

fn emit_attempt_failed(
    ctx: &CaptureContext,
    target: &Target,
    session: &Session,
    protocol: Protocol,
    attempt: u32,
    reason: String,
) {
    ctx.events.emit(CaptureEvent::AttemptFailed {
        target: target.name.clone(),
        session_id: session.id.clone(),
        protocol,
        attempt,
        reason,
    });
}

async fn finish(ctx: &CaptureContext, target: &Target, session: Session) -> CaptureOutcome {
    let report = match ctx.consolidator.consolidate(&target.name, &session.id).await {
        Ok(report) => report,
        Err(e) => {
            error!(target_name = %target.name, session_id = %session.id, error = %e, "Consolidation error");
            ctx.events.emit(CaptureEvent::ConsolidationFailed {
                target: target.name.clone(),
                session_id: session.id.clone(),
                fragments: Vec::new(),
                reason: e.to_string(),
            });
            return CaptureOutcome::ConsolidationFailed {
                session_id: session.id,
            };
        }
    };

    for failure in &report.failures {
        ctx.events.emit(CaptureEvent::ConsolidationFailed {
            target: target.name.clone(),
            session_id: session.id.clone(),
            fragments: failure.fragments.clone(),
            reason: failure.message.clone(),
        });
    }

    if !report.artifacts.is_empty() {
        ctx.events.emit(CaptureEvent::SessionCompleted {
            target: target.name.clone(),
            session_id: session.id.clone(),
            artifacts: report.artifacts.clone(),
        });
        return CaptureOutcome::Completed {
            session_id: session.id,
            artifacts: report.artifacts,
        };
    }

    if !report.failures.is_empty() {
        return CaptureOutcome::ConsolidationFailed {
            session_id: session.id,
        };
    }

    warn!(
        target_name = %target.name,
        session_id = %session.id,
        "Capture session ended without a usable fragment"
    );
    ctx.events.emit(CaptureEvent::SessionExhausted {
        target: target.name.clone(),
        session_id: session.id.clone(),
    });
    CaptureOutcome::Exhausted {
        session_id: session.id,
    }
}
