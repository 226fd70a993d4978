//! Bounded fan-out of blocking disk jobs
//!
//! A stripe touches several disks; its container I/Os are handed to a fixed
//! number of scoped worker threads over a channel so disks are driven in
//! parallel while each job still takes its own disk lock.

use crossbeam_channel::{bounded, unbounded};
use std::thread;

/// Run `f` over every job on at most `threads` workers
///
/// Results come back in the order of `jobs`. A panicking job propagates
/// the panic to the caller once all workers have stopped.
pub(crate) fn fan_out<J, T, F>(threads: usize, jobs: Vec<J>, f: F) -> Vec<T>
where
    J: Send,
    T: Send,
    F: Fn(J) -> T + Sync,
{
    let count = jobs.len();
    if count == 0 {
        return Vec::new();
    }
    let workers = threads.clamp(1, count);

    let (job_tx, job_rx) = bounded(count);
    for job in jobs.into_iter().enumerate() {
        // Capacity equals the job count and the receiver is alive
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let (result_tx, result_rx) = unbounded();
    let f = &f;
    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (index, job) in job_rx {
                    let _ = result_tx.send((index, f(job)));
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(count).collect();
    for (index, result) in result_rx {
        slots[index] = Some(result);
    }
    let results: Vec<T> = slots.into_iter().flatten().collect();
    debug_assert_eq!(results.len(), count);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_fan_out_keeps_order() {
        let jobs: Vec<u32> = (0..50).collect();
        let results = fan_out(4, jobs, |x| x * 2);
        assert_eq!(results, (0..50).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_fan_out_empty() {
        let results: Vec<u32> = fan_out(4, Vec::<u32>::new(), |x| x);
        assert!(results.is_empty());
    }

    #[test]
    fn test_fan_out_bounded_workers() {
        let seen = Mutex::new(HashSet::new());
        let _ = fan_out(2, (0..32).collect::<Vec<u32>>(), |_| {
            seen.lock().unwrap().insert(thread::current().id());
            thread::sleep(std::time::Duration::from_millis(1));
        });
        let workers = seen.lock().unwrap().len();
        assert!((1..=2).contains(&workers));
    }

    #[test]
    fn test_fan_out_mutable_jobs() {
        let mut bufs = vec![vec![0u8; 4]; 8];
        let jobs: Vec<(usize, &mut Vec<u8>)> = bufs.iter_mut().enumerate().collect();
        let _ = fan_out(3, jobs, |(i, buf)| buf.fill(i as u8));
        for (i, buf) in bufs.iter().enumerate() {
            assert!(buf.iter().all(|&b| b == i as u8));
        }
    }
}
