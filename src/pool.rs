use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Fixed-width task pool. `submit` waits for a free slot before spawning, so
/// tasks start in submission order and at most `width` run at once.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            tasks: JoinSet::new(),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub async fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");
        self.tasks.spawn(async move {
            let _permit = permit; // keep permit until task completes
            task.await;
        });
    }

    /// Wait for every submitted task. Returns how many panicked.
    pub async fn join(mut self) -> usize {
        let mut panicked = 0;
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!("worker task failed: {e}");
                panicked += 1;
            }
        }
        panicked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_width() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(3);
        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(pool.join().await, 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn panics_are_counted() {
        let mut pool = WorkerPool::new(0);
        assert_eq!(pool.width(), 1);
        pool.submit(async { panic!("boom"); }).await;
        pool.submit(async {}).await;
        assert_eq!(pool.join().await, 1);
    }
}
