#![allow(dead_code)]

use panelcore::{ConnectionId, RequestHandle, ServerConfig, ServerContext};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

/// Ensures May coroutines are configured only once
static MAY_INIT: Once = Once::new();

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub fn setup_may_runtime() {
    MAY_INIT.call_once(|| {
        may::config().set_stack_size(0x8000);
    });
}

/// Defaults with every directory inside `dir` and a long GC interval so the
/// timer thread never races the test's own collections.
pub fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        upload_dir: dir.join("uploads"),
        session_store_dir: Some(dir.join("sessions")),
        worker_count: 2,
        gc_interval: 3600,
        stats_interval: 3600,
        ..ServerConfig::default()
    }
}

pub fn start(config: ServerConfig) -> Arc<ServerContext> {
    setup_may_runtime();
    let ctx = ServerContext::new(config).unwrap();
    ctx.start(false).unwrap();
    ctx
}

pub fn connection() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

pub fn begin(ctx: &ServerContext, token: &str) -> RequestHandle {
    ctx.begin_request(connection(), Some(token), Some("Mozilla/5.0"))
        .expect("server should be responding")
}

/// One complete exchange with no body.
pub fn touch_session(ctx: &ServerContext, token: &str) {
    let req = begin(ctx, token);
    ctx.on_request_complete(&req, 0);
}
