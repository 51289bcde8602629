//! Supervised background tasks.
//!
//! - [`spawn`] / [`spawn_once`]: run work on the tokio runtime behind a panic
//!   barrier. A panic is logged once at error level with its location and a
//!   bounded stack snapshot taken at the panic site, and turned into
//!   [`TaskOutcome::Panicked`]; it never reaches the caller or takes the
//!   process down.
//! - [`hold`]: keep a fallible recurring operation alive forever with fixed
//!   sleeps between calls.
//!
//! Spawned tasks run inside the given span and keep the tracing dispatcher
//! that was current at spawn time.
//!
//! # Panic site capture
//! The first supervised spawn installs a process-wide panic hook. It records
//! the location and stack of every panic in a thread-local slot, then calls
//! the hook that was installed before it. The barrier picks the record up on
//! the same thread once `catch_unwind` returns.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::panic::{AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, Span};

/// Upper bound on frames kept in a panic stack snapshot.
pub const MAX_STACK_FRAMES: usize = 20;

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked {
        message: String,
        /// `file:line:col` of the panic, when known.
        location: Option<String>,
        stack: Vec<String>,
    },
}

impl TaskOutcome {
    pub fn is_panicked(&self) -> bool {
        matches!(self, TaskOutcome::Panicked { .. })
    }
}

/// Handle to one supervised task.
pub struct Supervised {
    handle: JoinHandle<TaskOutcome>,
}

impl Supervised {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the task to end.
    pub async fn outcome(self) -> TaskOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            // The panic barrier sits inside the task, so only cancellation gets here.
            Err(e) if e.is_cancelled() => TaskOutcome::Failed("task cancelled".to_string()),
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }
}

/// Start `count` independent executions of `f`.
pub fn spawn<F, Fut, E>(span: Span, count: usize, f: F) -> Vec<Supervised>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let f = Arc::new(f);
    (0..count)
        .map(|worker| {
            let f = Arc::clone(&f);
            let span = tracing::info_span!(parent: &span, "supervised", worker);
            // f() is called inside the future so a panic while building it is caught too.
            spawn_once(span, async move { f().await })
        })
        .collect()
}

/// Start a single execution of `work`.
pub fn spawn_once<Fut, E>(span: Span, work: Fut) -> Supervised
where
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    install_panic_hook();
    let guarded = async move {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "supervised task ended with error");
                TaskOutcome::Failed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let (location, stack) = match take_panic_site() {
                    Some(site) => (site.location, site.stack),
                    // someone replaced the hook
                    None => (None, stack_snapshot()),
                };
                tracing::error!(
                    panic = %message,
                    location = location.as_deref().unwrap_or("<unknown>"),
                    stack = ?stack,
                    "supervised task panicked"
                );
                TaskOutcome::Panicked {
                    message,
                    location,
                    stack,
                }
            }
        }
    };
    let handle = tokio::spawn(guarded.instrument(span).with_current_subscriber());
    Supervised { handle }
}

/// Wrap `f` into a task that calls it forever.
///
/// After an error the task sleeps `error_sleep`, after a success
/// `success_sleep`; a zero duration means no sleep.
pub fn hold<F, Fut, E>(
    f: F,
    success_sleep: Duration,
    error_sleep: Duration,
) -> impl Fn() -> BoxFuture<'static, Result<(), Infallible>> + Send + Sync + 'static
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let f = Arc::new(f);
    move || run_held(Arc::clone(&f), success_sleep, error_sleep).boxed()
}

async fn run_held<F, Fut, E>(
    f: Arc<F>,
    success_sleep: Duration,
    error_sleep: Duration,
) -> Result<(), Infallible>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    loop {
        let pause = match f().await {
            Ok(()) => success_sleep,
            Err(e) => {
                tracing::warn!(error = %e, "exec hold function error");
                error_sleep
            }
        };
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct PanicSite {
    location: Option<String>,
    stack: Vec<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            record_panic_site(info);
            previous(info);
        }));
    });
}

#[inline(never)]
fn record_panic_site(info: &PanicHookInfo<'_>) {
    let site = PanicSite {
        location: info.location().map(|l| l.to_string()),
        stack: render_frames(&Backtrace::force_capture().to_string(), is_panic_machinery),
    };
    // try_with: the hook may run while the thread is being torn down
    let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(site));
}

fn take_panic_site() -> Option<PanicSite> {
    LAST_PANIC
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Frames between the panic site and the hook: capture, hook dispatch,
/// std/core panic entry points.
fn is_panic_machinery(symbol: &str) -> bool {
    const PREFIXES: [&str; 9] = [
        "std::",
        "core::",
        "alloc::",
        "<std::",
        "<core::",
        "<alloc::",
        "rust_begin_unwind",
        "__rustc::",
        "__rust_",
    ];
    symbol.contains("record_panic_site")
        || symbol.contains("install_panic_hook")
        || PREFIXES.iter().any(|prefix| symbol.starts_with(prefix))
}

/// Capture the current call stack as `symbol (file:line)` entries, at most
/// [`MAX_STACK_FRAMES`] of them, starting at the caller. Never returns an
/// empty list.
#[inline(never)]
pub fn stack_snapshot() -> Vec<String> {
    render_frames(&Backtrace::force_capture().to_string(), |symbol| {
        symbol.starts_with("std::backtrace") || symbol.contains("stack_snapshot")
    })
}

/// Parse a rendered `Backtrace`, dropping the leading frames for which `skip`
/// holds.
fn render_frames(rendered: &str, skip: impl Fn(&str) -> bool) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    let mut leading = true;
    for line in rendered.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(location) = line.strip_prefix("at ") {
            if !leading && let Some(last) = frames.last_mut() {
                last.push_str(&format!(" ({location})"));
            }
            continue;
        }
        if frames.len() == MAX_STACK_FRAMES {
            break;
        }
        // "12: some::symbol" -> "some::symbol"
        let symbol = match line.split_once(": ") {
            Some((index, symbol)) if index.chars().all(|c| c.is_ascii_digit()) => symbol,
            _ => line,
        };
        if leading && skip(symbol) {
            continue;
        }
        leading = false;
        frames.push(symbol.to_string());
    }
    if frames.is_empty() {
        frames.push("<stack unavailable>".to_string());
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_logs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::Level;

    #[inline(never)]
    fn explode() {
        panic!("boom");
    }

    #[tokio::test]
    async fn panic_is_recovered_and_logged_once() {
        let logs = capture_logs();

        let handles = spawn(Span::none(), 1, || async {
            explode();
            Ok::<(), Infallible>(())
        });
        let outcome = handles.into_iter().next().unwrap().outcome().await;

        match &outcome {
            TaskOutcome::Panicked {
                message,
                location,
                stack,
            } => {
                assert_eq!(message, "boom");
                let location = location.as_deref().expect("panic location");
                assert!(location.contains("supervisor.rs"), "location = {location}");
                assert!(!stack.is_empty());
                assert!(stack.len() <= MAX_STACK_FRAMES);
                assert!(
                    stack.iter().any(|frame| frame.contains("explode")),
                    "panicking function missing from {stack:#?}"
                );
                assert!(!stack[0].contains("record_panic_site"));
                assert!(!stack[0].contains("stack_snapshot"));
            }
            other => panic!("expected a panic outcome, got {other:?}"),
        }

        let errors = logs.at_level(Level::ERROR);
        assert_eq!(errors.len(), 1);
        let stack = errors[0].field("stack").expect("stack field");
        assert!(stack.contains("explode"));
        assert_eq!(errors[0].field("panic").as_deref(), Some("boom"));
        assert!(
            errors[0]
                .field("location")
                .is_some_and(|l| l.contains("supervisor.rs"))
        );

        // The runtime is still usable after the panic.
        let after = spawn_once(Span::none(), async { Ok::<(), Infallible>(()) });
        assert_eq!(after.outcome().await, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn spawn_runs_count_independent_executions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handles = spawn(Span::none(), 3, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Infallible>(())
            }
        });
        assert_eq!(handles.len(), 3);
        for handle in handles {
            assert_eq!(handle.outcome().await, TaskOutcome::Completed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_panicking_worker_does_not_affect_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handles = spawn(Span::none(), 2, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first worker");
                }
                Ok::<(), Infallible>(())
            }
        });
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.outcome().await);
        }
        assert_eq!(outcomes.iter().filter(|o| o.is_panicked()).count(), 1);
        assert!(outcomes.contains(&TaskOutcome::Completed));
    }

    #[tokio::test]
    async fn error_result_becomes_failed_outcome() {
        let handle = spawn_once(Span::none(), async { Err::<(), _>("connection refused") });
        assert_eq!(
            handle.outcome().await,
            TaskOutcome::Failed("connection refused".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hold_sleeps_per_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = hold(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("attempt {n} failed"))
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        let handle = spawn_once(Span::none(), task());

        // t=0 fail, t=10 fail, t=20 ok, then next call at t=80.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[test]
    fn stack_snapshot_is_bounded_and_starts_at_caller() {
        let stack = stack_snapshot();
        assert!(!stack.is_empty());
        assert!(stack.len() <= MAX_STACK_FRAMES);
        assert!(!stack[0].contains("stack_snapshot"), "first frame = {}", stack[0]);
    }

    #[test]
    fn render_frames_drops_leading_machinery_and_joins_locations() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:312:13
   1: core::panicking::panic_fmt
   2: app::handler
             at ./src/handler.rs:7:5
   3: std::rt::lang_start
";
        let frames = render_frames(rendered, is_panic_machinery);
        assert_eq!(
            frames,
            vec![
                "app::handler (./src/handler.rs:7:5)".to_string(),
                "std::rt::lang_start".to_string(),
            ]
        );
    }
}
