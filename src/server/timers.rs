use super::context::ServerContext;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Periodic GC and statistics on one background thread.
///
/// The thread holds only a weak reference to the context, so dropping the
/// last context handle also ends the timer loop.
pub(crate) struct Timers {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Timers {
    pub(crate) fn spawn(
        ctx: Weak<ServerContext>,
        gc_every: Duration,
        stats_every: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("panel-timers".into())
            .spawn(move || run(ctx, flag, gc_every, stats_every))?;
        info!(
            gc_interval_secs = gc_every.as_secs(),
            stats_interval_secs = stats_every.as_secs(),
            "Timers started"
        );
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for it, unless called from the timer
    /// thread itself.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.thread().unpark();
        if handle.thread().id() != thread::current().id() {
            if handle.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
        debug!("Timers stopped");
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(ctx: Weak<ServerContext>, stop: Arc<AtomicBool>, gc_every: Duration, stats_every: Duration) {
    let start = Instant::now();
    let mut next_gc = start + gc_every;
    let mut next_stats = start;
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        let now = Instant::now();
        if now >= next_gc {
            ctx.collect_garbage();
            next_gc = now + gc_every;
        }
        if now >= next_stats {
            ctx.refresh_stats();
            next_stats = now + stats_every;
        }
        drop(ctx);
        let wake = next_gc.min(next_stats);
        thread::park_timeout(wake.saturating_duration_since(Instant::now()));
    }
    debug!("Timer loop exiting");
}
