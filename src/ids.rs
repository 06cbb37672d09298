use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;

/// Monotonic request ID source shared by every connection that holds it.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        RequestIds {
            next: AtomicU64::new(first),
        }
    }

    /// Process-wide generator, used when no generator is injected.
    pub fn global() -> Arc<RequestIds> {
        Arc::clone(&GLOBAL_IDS)
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref GLOBAL_IDS: Arc<RequestIds> = Arc::new(RequestIds::new());
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sequential_ids_strictly_increase() {
        let ids = RequestIds::new();
        let values: Vec<u64> = (0..100).map(|_| ids.next_id()).collect();

        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ids_never_collide() {
        let ids = Arc::new(RequestIds::new());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                tokio::spawn(async move { (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>() })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            let values = task.await.unwrap();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(seen.insert(v), "duplicate id {}", v);
            }
        }

        assert_eq!(seen.len(), 8000);
    }
}
