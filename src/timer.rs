//! Repeating, jitterable timers used by the Master role. A single scheduled
//! task type with an atomic "is-leader" flag could replace the election and
//! heartbeat timers if the underlying primitive supported dynamic intervals;
//! we keep them as two timers since tokio's `interval` does not.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A cancellable, repeating background task. Starting a new run cancels any
/// run already in flight, so at most one `on_fire` loop is ever scheduled.
pub struct RepeatingTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatingTimer {
    pub fn new() -> RepeatingTimer {
        RepeatingTimer { handle: Mutex::new(None) }
    }

    /// Spawns a task that sleeps for `next_delay()` then runs `on_fire`,
    /// forever, until `stop` is called or the timer is dropped.
    pub fn start<D, F, Fut>(&self, mut next_delay: D, mut on_fire: F)
    where
        D: FnMut() -> Duration + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(next_delay()).await;
                on_fire().await;
            }
        });
        *self.handle.lock().unwrap() = Some(task);
    }

    /// Stops the running loop, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.handle.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        match self.handle.lock().unwrap().as_ref() {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }
}

impl Default for RepeatingTimer {
    fn default() -> Self {
        RepeatingTimer::new()
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Picks a random delay in `[min, max]`, used for election-timer jitter.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    use rand::Rng;
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..=span);
    min + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_repeatedly_until_stopped() {
        let timer = RepeatingTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        timer.start(
            || Duration::from_millis(10),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        timer.stop();
        assert!(!timer.is_running());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let min = Duration::from_millis(600);
        let max = Duration::from_millis(800);
        for _ in 0..200 {
            let d = jitter(min, max);
            assert!(d >= min && d <= max);
        }
    }
}
