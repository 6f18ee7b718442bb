#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end exchanges through [`ServerContext`]
//!
//! # Test Coverage
//!
//! - Form submission reaching its action (single and multi-chunk fields)
//! - Default action for unbound keys
//! - Mode transitions and request refusal
//! - Idempotent completion and reference bookkeeping
//! - Statistics tokens after a refresh

mod common;

use common::{begin, start, test_config, touch_session};
use panelcore::dispatcher::DEFAULT_ACTION;
use panelcore::{
    ActionContext, Chunk, DispatchOutcome, ExecMode, PanelError, ServerContext, ServerMode,
    SessionId,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn recorder(ctx: &ServerContext, key: &str) -> Arc<Mutex<Vec<(String, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ctx.register_action(
        key,
        move |action: &ActionContext| {
            sink.lock()
                .push((action.key.to_string(), action.value.clone()));
            Ok(())
        },
        ExecMode::Sync,
    );
    seen
}

#[test]
fn test_form_post_reaches_action() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));
    let seen = recorder(&ctx, "volume");

    let req = begin(&ctx, "player1");
    assert!(ctx.on_body_chunk(&req, &Chunk::field("volume", b"7", 0)));
    let outcome = ctx.on_body_complete(&req).unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Inline { ok: true }));
    ctx.on_request_complete(&req, 512);

    assert_eq!(*seen.lock(), vec![("volume".to_string(), "7".to_string())]);
    let id: SessionId = "player1".parse().unwrap();
    let session = ctx.sessions().find(&id).unwrap();
    assert_eq!(session.ref_count(), 0);
    assert!(!session.is_busy());
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_multi_chunk_field_is_reassembled() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));
    let seen = recorder(&ctx, "title");

    let req = begin(&ctx, "player2");
    assert!(ctx.on_body_chunk(&req, &Chunk::field("title", b"Blue ", 0)));
    assert!(ctx.on_body_chunk(&req, &Chunk::field("title", b"Monday", 5)));
    ctx.on_body_complete(&req).unwrap();
    ctx.on_request_complete(&req, 0);

    assert_eq!(seen.lock()[0].1, "Blue Monday");
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_unbound_key_goes_to_default_action() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));
    let volume = recorder(&ctx, "volume");
    let fallback = recorder(&ctx, DEFAULT_ACTION);

    let req = begin(&ctx, "player3");
    assert!(ctx.on_body_chunk(&req, &Chunk::field("mute", b"1", 0)));
    ctx.on_body_complete(&req).unwrap();
    ctx.on_request_complete(&req, 0);

    assert!(volume.lock().is_empty());
    assert_eq!(*fallback.lock(), vec![("mute".to_string(), "1".to_string())]);
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_bound_key_wins_over_earlier_unbound_key() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));
    let volume = recorder(&ctx, "volume");
    let fallback = recorder(&ctx, DEFAULT_ACTION);

    let req = begin(&ctx, "player4");
    assert!(ctx.on_body_chunk(&req, &Chunk::field("csrf", b"x", 0)));
    assert!(ctx.on_body_chunk(&req, &Chunk::field("volume", b"3", 0)));
    ctx.on_body_complete(&req).unwrap();
    ctx.on_request_complete(&req, 0);

    assert_eq!(volume.lock().len(), 1);
    assert!(fallback.lock().is_empty());
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_submission_without_any_action_is_unhandled() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    let req = begin(&ctx, "player5");
    assert!(ctx.on_body_chunk(&req, &Chunk::field("volume", b"3", 0)));
    assert_eq!(
        ctx.on_body_complete(&req).unwrap(),
        Some(DispatchOutcome::Unhandled)
    );
    ctx.on_request_complete(&req, 0);
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_empty_body_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));
    let seen = recorder(&ctx, DEFAULT_ACTION);

    let req = begin(&ctx, "player6");
    assert!(ctx.on_body_chunk(&req, &Chunk::default()));
    assert_eq!(ctx.on_body_complete(&req).unwrap(), None);
    ctx.on_request_complete(&req, 0);

    assert!(seen.lock().is_empty());
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_body_data_without_key_fails_request() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    let req = begin(&ctx, "player7");
    let stray = Chunk {
        data: b"garbage",
        ..Chunk::default()
    };
    assert!(!ctx.on_body_chunk(&req, &stray));
    ctx.on_request_complete(&req, 0);

    ctx.refresh_stats();
    let tokens = ctx.stats_tokens();
    assert_eq!(tokens["server.chunks_rejected"].to_string(), "1");
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_pause_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    ctx.pause().unwrap();
    assert_eq!(ctx.mode(), ServerMode::Paused);
    assert!(ctx
        .begin_request(common::connection(), Some("p"), None)
        .is_none());
    assert!(matches!(ctx.pause(), Err(PanelError::ModeRefused { .. })));

    ctx.resume().unwrap();
    touch_session(&ctx, "p");
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_disabled_server_refuses_everything_but_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    ctx.disable().unwrap();
    assert!(ctx.begin_request(common::connection(), None, None).is_none());
    assert!(ctx.collect_garbage().is_none());
    assert!(ctx.resume().is_err());
    ctx.shutdown(false).unwrap();
    assert_eq!(ctx.mode(), ServerMode::Terminated);
}

#[test]
fn test_completion_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    let req = begin(&ctx, "twice");
    ctx.on_request_complete(&req, 10);
    ctx.on_request_complete(&req, 10);
    ctx.on_request_complete(&req, 10);

    let id: SessionId = "twice".parse().unwrap();
    assert_eq!(ctx.sessions().find(&id).unwrap().ref_count(), 0);
    assert_eq!(req.ref_count(), 0);
    assert_eq!(ctx.requests().active(), 0);
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_concurrent_requests_share_session() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    let a = begin(&ctx, "shared");
    let b = begin(&ctx, "shared");
    let id: SessionId = "shared".parse().unwrap();
    let session = ctx.sessions().find(&id).unwrap();
    assert_eq!(session.ref_count(), 2);
    assert_ne!(a.slot(), b.slot());

    ctx.on_request_complete(&a, 0);
    assert_eq!(session.ref_count(), 1);
    ctx.on_request_complete(&b, 0);
    assert_eq!(session.ref_count(), 0);
    assert_eq!(ctx.sessions().len(), 1);
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_invalid_token_gets_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    let req = ctx
        .begin_request(common::connection(), Some("../../etc"), None)
        .unwrap();
    let id = req.session_id().unwrap();
    assert_ne!(id.as_str(), "../../etc");
    ctx.on_request_complete(&req, 0);
    ctx.shutdown(false).unwrap();
}

#[test]
fn test_stats_tokens_after_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = start(test_config(dir.path()));

    for i in 0..3 {
        touch_session(&ctx, &format!("stats{i}"));
    }
    ctx.refresh_stats();
    let tokens = ctx.stats_tokens();
    assert_eq!(tokens["server.requests"].to_string(), "3");
    assert_eq!(tokens["server.sessions"].to_string(), "3");
    assert_eq!(tokens["server.mode"].to_string(), "running");
    assert!(ctx.prometheus().contains("panel_sessions 3"));
    ctx.shutdown(false).unwrap();
}
