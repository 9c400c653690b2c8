//! Fixed-size worker pool for independent, order-irrelevant work items.
//!
//! All items are queued up front; each worker pulls the next one until the
//! queue is empty. A failing or panicking item becomes a `Failed` report and
//! never stops the pool.

use crate::progress::ProgressHandle;

use crossbeam_channel::unbounded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

#[derive(Debug)]
pub struct WorkItem<T> {
    pub key: String,
    pub payload: T,
}

impl<T> WorkItem<T> {
    pub fn new(key: impl Into<String>, payload: T) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus<O> {
    Done(O),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport<O> {
    pub key: String,
    pub status: ItemStatus<O>,
}

impl<O> ItemReport<O> {
    pub fn output(&self) -> Option<&O> {
        match &self.status {
            ItemStatus::Done(out) => Some(out),
            ItemStatus::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            ItemStatus::Done(_) => None,
            ItemStatus::Failed(reason) => Some(reason),
        }
    }
}

/// Runs `job` over `items` on `workers` threads and returns one report per
/// item, in submission order.
pub fn run_pool<T, O, F>(
    items: Vec<WorkItem<T>>,
    workers: usize,
    progress: &ProgressHandle,
    job: F,
) -> Vec<ItemReport<O>>
where
    T: Send,
    O: Send,
    F: Fn(&str, T) -> anyhow::Result<O> + Sync,
{
    let total = items.len();
    progress.set_total_items(total as u64);
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);

    let (job_tx, job_rx) = unbounded::<(usize, WorkItem<T>)>();
    let (res_tx, res_rx) = unbounded::<(usize, ItemReport<O>)>();
    for (idx, item) in items.into_iter().enumerate() {
        // The receiver is alive until the scope below ends.
        let _ = job_tx.send((idx, item));
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let progress = progress.clone();
            let job = &job;
            scope.spawn(move || {
                let slot = format!("worker{:02}", worker_id);
                for (idx, item) in job_rx.iter() {
                    let WorkItem { key, payload } = item;
                    progress.start_item(&slot, &key);

                    let result = panic::catch_unwind(AssertUnwindSafe(|| job(&key, payload)));
                    let status = match result {
                        Ok(Ok(out)) => ItemStatus::Done(out),
                        Ok(Err(err)) => {
                            let reason = format!("{:#}", err);
                            progress.error(format!("{}: {}", key, reason));
                            ItemStatus::Failed(reason)
                        }
                        Err(payload) => {
                            let reason =
                                format!("worker panicked: {}", panic_message(payload.as_ref()));
                            progress.error(format!("{}: {}", key, reason));
                            ItemStatus::Failed(reason)
                        }
                    };

                    progress.finish_item(&slot);
                    let _ = res_tx.send((idx, ItemReport { key, status }));
                }
            });
        }
    });
    drop(res_tx);

    let mut slots = (0..total).map(|_| None).collect::<Vec<Option<ItemReport<O>>>>();
    for (idx, report) in res_rx.iter() {
        slots[idx] = Some(report);
    }
    slots.into_iter().flatten().collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::quiet_reporter;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn items(n: usize) -> Vec<WorkItem<usize>> {
        (0..n).map(|i| WorkItem::new(format!("seq{i}"), i)).collect()
    }

    #[test]
    fn every_item_reported_once_in_submission_order() {
        let reporter = quiet_reporter("pool");
        let reports = run_pool(items(25), 4, &reporter.handle(), |_key, v| Ok(v * 2));

        assert_eq!(reports.len(), 25);
        for (i, r) in reports.iter().enumerate() {
            assert_eq!(r.key, format!("seq{i}"));
            assert_eq!(r.output(), Some(&(i * 2)));
        }
        assert_eq!(reporter.finish("done").processed_items, 25);
    }

    #[test]
    fn failures_and_panics_stay_with_their_item() {
        let reporter = quiet_reporter("pool");
        let reports = run_pool(items(6), 3, &reporter.handle(), |key, v| {
            if v == 1 {
                bail!("video for {key} is private");
            }
            if v == 4 {
                panic!("decoder state corrupted");
            }
            Ok(v)
        });

        assert_eq!(reports.len(), 6);
        assert_eq!(
            reports[1].failure(),
            Some("video for seq1 is private")
        );
        assert!(reports[4]
            .failure()
            .is_some_and(|r| r.contains("panicked") && r.contains("decoder state corrupted")));
        let done = reports.iter().filter(|r| r.output().is_some()).count();
        assert_eq!(done, 4);

        let outcome = reporter.finish("done");
        assert_eq!(outcome.warning_count, 2);
    }

    #[test]
    fn never_runs_more_than_the_pool_size() {
        let reporter = quiet_reporter("pool");
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let reports = run_pool(items(12), 3, &reporter.handle(), |_key, _v| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(15));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(reports.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_workers_still_makes_progress_and_empty_input_is_fine() {
        let reporter = quiet_reporter("pool");
        let reports = run_pool(items(3), 0, &reporter.handle(), |_key, v| Ok(v));
        assert_eq!(reports.len(), 3);

        let none: Vec<ItemReport<()>> =
            run_pool(Vec::<WorkItem<()>>::new(), 4, &reporter.handle(), |_k, _v| Ok(()));
        assert!(none.is_empty());
    }
}
