//! Fixed worker pool overlapping block transforms with ordered file I/O
//!
//! Transforms run on scoped OS threads in any order; every file access
//! happens on the calling thread, strictly ascending by position.

use crate::error::{Result, VdsError};
use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::debug;

/// Shared abort state of one pool call
struct Abort {
    flag: AtomicBool,
    first: Mutex<Option<VdsError>>,
}

impl Abort {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            first: Mutex::new(None),
        }
    }

    fn fail(&self, err: VdsError) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err);
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn into_result(self) -> Result<()> {
        match self.first.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Pool of `num_threads` transform workers
#[derive(Debug, Clone, Copy)]
pub struct BlockPool {
    num_threads: usize,
}

impl BlockPool {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn workers_for(&self, count: usize) -> usize {
        self.num_threads.min(count).max(1)
    }

    /// Transform `items` in parallel and hand each result to `write` in
    /// ascending position order.
    ///
    /// Worker `w` takes positions `w, w + n, w + 2n, ...`. Results arriving
    /// early are buffered until their turn. The first failure stops the call.
    pub fn ordered_write<T, St, P>(
        &self,
        items: &[T],
        make_state: impl Fn() -> St + Sync,
        transform: impl Fn(&mut St, usize, &T) -> Result<P> + Sync,
        mut write: impl FnMut(usize, P) -> Result<()>,
    ) -> Result<()>
    where
        T: Sync,
        P: Send,
    {
        let count = items.len();
        if count == 0 {
            return Ok(());
        }
        let workers = self.workers_for(count);
        debug!(count, workers, "ordered write");
        let abort = Abort::new();
        let (tx, rx) = unbounded::<(usize, Result<P>)>();

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for w in 0..workers {
                let tx = tx.clone();
                let abort = &abort;
                let make_state = &make_state;
                let transform = &transform;
                handles.push(scope.spawn(move || {
                    let mut state = make_state();
                    for pos in (w..count).step_by(workers) {
                        if abort.is_set() {
                            break;
                        }
                        let result = transform(&mut state, pos, &items[pos]);
                        let failed = result.is_err();
                        if tx.send((pos, result)).is_err() || failed {
                            break;
                        }
                    }
                }));
            }
            drop(tx);

            let mut pending = BTreeMap::new();
            let mut next = 0;
            for (pos, result) in rx.iter() {
                if abort.is_set() {
                    continue;
                }
                match result {
                    Ok(payload) => {
                        pending.insert(pos, payload);
                    }
                    Err(err) => {
                        abort.fail(err);
                        continue;
                    }
                }
                while let Some(payload) = pending.remove(&next) {
                    if let Err(err) = write(next, payload) {
                        abort.fail(err);
                        break;
                    }
                    next += 1;
                }
            }

            for handle in handles {
                if handle.join().is_err() {
                    abort.fail(VdsError::Worker("transform worker panicked".to_string()));
                }
            }
        });

        abort.into_result()
    }

    /// Read `count` records in ascending order on the calling thread and
    /// transform them in parallel. Record `pos` goes to worker `pos % n`.
    /// Results are returned in position order.
    pub fn ordered_read<R, St, P>(
        &self,
        count: usize,
        mut read: impl FnMut(usize) -> Result<R>,
        make_state: impl Fn() -> St + Sync,
        transform: impl Fn(&mut St, usize, R) -> Result<P> + Sync,
    ) -> Result<Vec<P>>
    where
        R: Send,
        P: Send,
    {
        if count == 0 {
            return Ok(Vec::new());
        }
        let workers = self.workers_for(count);
        debug!(count, workers, "ordered read");
        let abort = Abort::new();
        let (out_tx, out_rx) = unbounded::<(usize, P)>();
        let mut results: Vec<Option<P>> = (0..count).map(|_| None).collect();

        thread::scope(|scope| {
            let mut senders = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let (tx, rx) = bounded::<(usize, R)>(2);
                senders.push(tx);
                let out_tx = out_tx.clone();
                let abort = &abort;
                let make_state = &make_state;
                let transform = &transform;
                handles.push(scope.spawn(move || {
                    let mut state = make_state();
                    for (pos, record) in rx.iter() {
                        if abort.is_set() {
                            continue;
                        }
                        match transform(&mut state, pos, record) {
                            Ok(payload) => {
                                if out_tx.send((pos, payload)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => abort.fail(err),
                        }
                    }
                }));
            }
            drop(out_tx);

            for pos in 0..count {
                if abort.is_set() {
                    break;
                }
                match read(pos) {
                    Ok(record) => {
                        if senders[pos % workers].send((pos, record)).is_err() {
                            abort.fail(VdsError::Worker(format!(
                                "worker for block position {} exited",
                                pos
                            )));
                        }
                    }
                    Err(err) => abort.fail(err),
                }
            }
            drop(senders);

            for (pos, payload) in out_rx.iter() {
                results[pos] = Some(payload);
            }
            for handle in handles {
                if handle.join().is_err() {
                    abort.fail(VdsError::Worker("reconstruct worker panicked".to_string()));
                }
            }
        });

        abort.into_result()?;
        results
            .into_iter()
            .enumerate()
            .map(|(pos, r)| {
                r.ok_or_else(|| VdsError::Worker(format!("no result for block position {}", pos)))
            })
            .collect()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
