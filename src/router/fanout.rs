//! Bounded fan-out of independent sub-query tasks with a single merge loop.

use crate::context::{Context, Done};
use crate::error::Error;
use crossbeam_channel::{bounded, select};
use std::thread;

/// A unit of work run on a pool thread. It receives the fan-out's own
/// context so it can stop at its checkpoints once the merge loop gives up.
pub type Task<R> = Box<dyn FnOnce(&Context) -> R + Send + 'static>;

/// Returned by the merge callback after each result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Enough has been merged; cancel outstanding tasks
    Stop,
}

#[derive(Debug, Default)]
pub struct Outcome {
    /// Set when the context finished before every task reported
    pub interrupted: Option<Error>,
    /// The merge callback asked to stop
    pub stopped: bool,
    pub received: usize,
}

/// Run `tasks` on at most `cap` threads and feed each result to `on_result`
/// as it arrives, in completion order.
///
/// Returns when every task has reported, when `on_result` returns
/// [`Flow::Stop`], or when `ctx` is cancelled or reaches its deadline.
/// Workers are detached: a task stuck in blocking I/O does not hold up the
/// caller, and its result is dropped.
pub fn fan_out<R, F>(ctx: &Context, tasks: Vec<Task<R>>, cap: usize, mut on_result: F) -> Outcome
where
    R: Send + 'static,
    F: FnMut(R) -> Flow,
{
    let mut outcome = Outcome::default();
    let total = tasks.len();
    if total == 0 {
        return outcome;
    }

    let ctx = ctx.with_cancel();
    let (task_tx, task_rx) = bounded::<Task<R>>(total);
    let (result_tx, result_rx) = bounded::<R>(total);
    for task in tasks {
        // sized to the task count, never blocks
        let _ = task_tx.send(task);
    }
    drop(task_tx);

    for _ in 0..cap.max(1).min(total) {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            for task in task_rx.iter() {
                if ctx.is_done() {
                    break;
                }
                let result = task(&ctx);
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let done = ctx.done();
    let deadline = match ctx.deadline() {
        Some(at) => crossbeam_channel::at(at),
        None => crossbeam_channel::never(),
    };

    while outcome.received < total {
        select! {
            recv(result_rx) -> msg => match msg {
                Ok(result) => {
                    outcome.received += 1;
                    if on_result(result) == Flow::Stop {
                        outcome.stopped = true;
                        break;
                    }
                }
                // every worker exited: they skip queued tasks once the
                // context is done, otherwise some task panicked
                Err(_) => {
                    outcome.interrupted = ctx.reason().map(Done::into_error);
                    break;
                }
            },
            recv(done) -> _ => {
                outcome.interrupted = Some(ctx.reason().unwrap_or(Done::Cancelled).into_error());
                break;
            }
            recv(deadline) -> _ => {
                outcome.interrupted = Some(Done::DeadlineExceeded.into_error());
                break;
            }
        }
    }

    if outcome.interrupted.is_some() {
        while let Ok(result) = result_rx.try_recv() {
            outcome.received += 1;
            on_result(result);
        }
    }
    ctx.cancel();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn numbered(n: usize) -> Vec<Task<usize>> {
        (0..n).map(|i| Box::new(move |_: &Context| i) as Task<usize>).collect()
    }

    #[test]
    fn test_all_results_merged() {
        let mut sum = 0;
        let outcome = fan_out(&Context::background(), numbered(10), 3, |i| {
            sum += i;
            Flow::Continue
        });
        assert_eq!(sum, 45);
        assert_eq!(outcome.received, 10);
        assert!(outcome.interrupted.is_none());
        assert!(!outcome.stopped);
    }

    #[test]
    fn test_no_tasks() {
        let outcome = fan_out(&Context::background(), numbered(0), 4, |_| Flow::Continue);
        assert_eq!(outcome.received, 0);
    }

    #[test]
    fn test_concurrency_is_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<()>> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Box::new(move |_: &Context| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                }) as Task<()>
            })
            .collect();
        let outcome = fan_out(&Context::background(), tasks, 2, |_| Flow::Continue);
        assert_eq!(outcome.received, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_stop_cancels_the_rest() {
        let seen = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<usize>> = (0usize..50)
            .map(|i| {
                let seen = Arc::clone(&seen);
                Box::new(move |ctx: &Context| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    if ctx.is_done() { 0 } else { i }
                }) as Task<usize>
            })
            .collect();
        let mut merged = 0;
        let outcome = fan_out(&Context::background(), tasks, 1, |_| {
            merged += 1;
            if merged == 3 { Flow::Stop } else { Flow::Continue }
        });
        assert!(outcome.stopped);
        assert_eq!(merged, 3);
        assert!(outcome.interrupted.is_none());
        thread::sleep(Duration::from_millis(20));
        assert!(seen.load(Ordering::SeqCst) < 50);
    }

    #[test]
    fn test_deadline_returns_partial() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let tasks: Vec<Task<u32>> = vec![
            Box::new(|_: &Context| 1),
            Box::new(|_: &Context| {
                thread::sleep(Duration::from_secs(2));
                2
            }),
        ];
        let mut merged = Vec::new();
        let outcome = fan_out(&ctx, tasks, 2, |r| {
            merged.push(r);
            Flow::Continue
        });
        assert_eq!(merged, vec![1]);
        let err = outcome.interrupted.unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_slow_merge_past_deadline_still_times_out() {
        for _ in 0..5 {
            let ctx = Context::background().with_timeout(Duration::from_millis(30));
            let tasks: Vec<Task<u32>> = vec![
                Box::new(|_: &Context| 1),
                Box::new(|_: &Context| {
                    thread::sleep(Duration::from_millis(40));
                    2
                }),
                Box::new(|_: &Context| 3),
            ];
            let outcome = fan_out(&ctx, tasks, 1, |_| {
                thread::sleep(Duration::from_millis(80));
                Flow::Continue
            });
            assert!(outcome.received < 3);
            let err = outcome.interrupted.expect("a short merge is annotated");
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
    }

    #[test]
    fn test_parent_cancel_interrupts() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        let tasks: Vec<Task<()>> = vec![Box::new(|_: &Context| thread::sleep(Duration::from_secs(2)))];
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });
        let outcome = fan_out(&ctx, tasks, 1, |_| Flow::Continue);
        handle.join().unwrap();
        assert!(outcome.interrupted.is_some());
        assert_eq!(outcome.received, 0);
    }
}
