//! Tracks running jobs and serializes access to shared exam-task state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};

#[derive(Clone)]
pub(crate) struct JobRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: std::sync::Mutex<HashMap<String, watch::Sender<bool>>>,
    task_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: std::sync::Mutex::new(HashMap::new()),
                task_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a job and returns its cancellation receiver.
    pub(crate) fn register(&self, job_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner.jobs.lock().expect("registry poisoned").insert(job_id.to_string(), tx);
        rx
    }

    /// Requests cancellation; returns false when the job is not running.
    pub(crate) fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.inner.jobs.lock().expect("registry poisoned");
        match jobs.get(job_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_running(&self, job_id: &str) -> bool {
        self.inner.jobs.lock().expect("registry poisoned").contains_key(job_id)
    }

    pub(crate) fn finish(&self, job_id: &str) {
        self.inner.jobs.lock().expect("registry poisoned").remove(job_id);
    }

    /// Acquires the per-task locks for every given task id, in sorted
    /// order so two jobs touching overlapping task sets cannot deadlock.
    pub(crate) async fn lock_tasks(&self, task_ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<String> = task_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = {
                let mut locks = self.inner.task_locks.lock().expect("registry poisoned");
                locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_flips_the_receiver() {
        let registry = JobRegistry::new();
        let rx = registry.register("job1");
        assert!(!*rx.borrow());
        assert!(registry.cancel("job1"));
        assert!(*rx.borrow());
        registry.finish("job1");
        assert!(!registry.cancel("job1"));
    }

    #[tokio::test]
    async fn task_locks_serialize_same_task() {
        let registry = JobRegistry::new();
        let first = registry.lock_tasks(&["90011201".to_string()]).await;

        let registry2 = registry.clone();
        let contended = tokio::spawn(async move {
            registry2.lock_tasks(&["90011201".to_string()]).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contended.is_finished());
        drop(first);
        contended.await.expect("second holder");
    }

    #[tokio::test]
    async fn overlapping_task_sets_do_not_deadlock() {
        let registry = JobRegistry::new();
        let a = vec!["1".to_string(), "2".to_string()];
        let b = vec!["2".to_string(), "1".to_string()];

        for _ in 0..50 {
            let r1 = registry.clone();
            let r2 = registry.clone();
            let ids_a = a.clone();
            let ids_b = b.clone();
            let j1 = tokio::spawn(async move {
                let _guards = r1.lock_tasks(&ids_a).await;
            });
            let j2 = tokio::spawn(async move {
                let _guards = r2.lock_tasks(&ids_b).await;
            });
            j1.await.expect("first");
            j2.await.expect("second");
        }
    }
}
