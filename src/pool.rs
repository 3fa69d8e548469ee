//! A fixed-size worker pool over channels.
//!
//! Workers pull jobs, apply the function, and push results. They shut
//! down when the job channel closes, or early when the done channel
//! closes. The result channel is closed exactly once, after every
//! worker has exited - `run` returns only then.

use crossbeam_channel::{Receiver, Sender, select};

/// Convention used throughout: cancellation is signaled by *closing*
/// the done channel (dropping all its senders). Hold the sender to keep
/// things running.
pub fn cancellation() -> (Sender<()>, Receiver<()>) {
    crossbeam_channel::bounded(0)
}

/// Runs `workers` threads applying `f` to every job until the job
/// channel closes or `done` fires. Blocks until all workers finish.
pub fn run<J, R, F>(workers: usize, jobs: Receiver<J>, results: Sender<R>, done: Receiver<()>, f: F)
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    assert!(workers > 0);
    std::thread::scope(|s| {
        for _ in 0..workers {
            let jobs = jobs.clone();
            let results = results.clone();
            let done = done.clone();
            let f = &f;
            s.spawn(move || {
                loop {
                    select! {
                        recv(done) -> _ => return, // closed or fired: stop now
                        recv(jobs) -> job => match job {
                            Ok(job) => {
                                if results.send(f(job)).is_err() {
                                    // Nobody's listening anymore.
                                    return;
                                }
                            }
                            Err(_) => return, // out of work
                        },
                    }
                }
            });
        }
    });
    // `results` (and the workers' clones) drop here: channel closed once.
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn maps_everything() {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        let (_keep_alive, done) = cancellation();

        for i in 0..100 {
            job_tx.send(i).unwrap();
        }
        drop(job_tx);

        run(4, job_rx, res_tx, done, |i: u64| i * 2);

        let mut results: Vec<u64> = res_rx.iter().collect();
        results.sort_unstable();
        assert_eq!(results, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn cancellation_stops_workers_early() {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        let (cancel, done) = cancellation();

        for i in 0..100_000 {
            job_tx.send(i).unwrap();
        }
        drop(job_tx);

        let processed = AtomicUsize::new(0);
        // Cancel as soon as the first result lands.
        std::thread::scope(|s| {
            s.spawn(|| {
                let _first = res_rx.recv().unwrap();
                drop(cancel);
                // Drain whatever the workers managed before exiting.
                for _ in res_rx.iter() {}
            });
            run(4, job_rx, res_tx, done, |i: u64| {
                processed.fetch_add(1, Ordering::Relaxed);
                // Slow enough that cancellation lands mid-queue.
                std::thread::sleep(std::time::Duration::from_micros(50));
                i
            });
        });

        assert!(processed.load(Ordering::SeqCst) < 100_000);
    }

    #[test]
    fn result_channel_closes_after_workers_exit() {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        let (_keep_alive, done) = cancellation();

        job_tx.send(1).unwrap();
        drop(job_tx);
        run(2, job_rx, res_tx, done, |i: i32| i);

        assert_eq!(res_rx.iter().count(), 1); // ...then Disconnected.
    }
}
