//! The durability worker.
//!
//! All log writes happen on the owning task; making them durable is the job
//! of a dedicated worker thread holding the only handle that may fsync the
//! cluster log. The handshake is two monotone counters guarded by a mutex:
//!
//! - `requested`: bumped by the owning task whenever new writes must become
//!   durable; each bump yields a sequence number that gates a waiter.
//! - `committed`: advanced by the worker after a successful fsync.
//!
//! A waiter with sequence number `s` may fire only once `committed >= s`.
//! A failed fsync leaves `committed` untouched; the failure is logged and
//! the request stays pending until new work arrives. Shutdown is signaled
//! by setting `requested` to a sentinel.

use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;

const SHUTDOWN: u64 = u64::MAX;

struct State {
    requested: u64,
    committed: u64,
    target: Arc<File>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cheap handle onto the worker's counters.
#[derive(Clone)]
pub struct DurabilityHandle {
    shared: Arc<Shared>,
}

impl DurabilityHandle {
    /// The highest sequence number requested so far.
    pub fn requested(&self) -> u64 {
        let state = self.shared.state.lock();
        if state.requested == SHUTDOWN {
            state.committed
        } else {
            state.requested
        }
    }

    /// The highest durable sequence number.
    pub fn committed(&self) -> u64 {
        self.shared.state.lock().committed
    }

    /// Block until `committed >= seqno` (or shutdown).
    pub fn wait_committed(&self, seqno: u64) {
        let mut state = self.shared.state.lock();
        while state.committed < seqno && state.requested != SHUTDOWN {
            self.shared.cond.wait(&mut state);
        }
    }
}

/// The background fsync worker.
pub struct DurabilityWorker {
    shared: Arc<Shared>,
    committed_rx: watch::Receiver<u64>,
    thread: Option<JoinHandle<()>>,
}

impl DurabilityWorker {
    /// Spawn the worker against the given file handle.
    pub fn spawn(target: Arc<File>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                requested: 0,
                committed: 0,
                target,
            }),
            cond: Condvar::new(),
        });
        let (committed_tx, committed_rx) = watch::channel(0);

        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("raft-fsync".to_string())
            .spawn(move || worker_loop(worker_shared, committed_tx))
            .unwrap_or_else(|err| panic!("cannot spawn fsync thread: {err}"));

        Self {
            shared,
            committed_rx,
            thread: Some(thread),
        }
    }

    /// Ask for everything written so far to become durable. Returns the
    /// sequence number to gate a waiter on.
    pub fn request(&self) -> u64 {
        let mut state = self.shared.state.lock();
        debug_assert!(state.requested != SHUTDOWN);
        state.requested += 1;
        let seqno = state.requested;
        self.shared.cond.notify_all();
        seqno
    }

    /// Point the worker at a new file handle after a log rewrite.
    pub fn retarget(&self, target: Arc<File>) {
        self.shared.state.lock().target = target;
    }

    /// Watch channel carrying the durable sequence number.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.committed_rx.clone()
    }

    pub fn handle(&self) -> DurabilityHandle {
        DurabilityHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the worker and join it. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.requested = SHUTDOWN;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DurabilityWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DurabilityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DurabilityWorker")
            .field("requested", &state.requested)
            .field("committed", &state.committed)
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, committed_tx: watch::Sender<u64>) {
    loop {
        let (seqno, target) = {
            let mut state = shared.state.lock();
            loop {
                if state.requested == SHUTDOWN {
                    return;
                }
                if state.requested > state.committed {
                    break (state.requested, Arc::clone(&state.target));
                }
                shared.cond.wait(&mut state);
            }
        };

        match target.sync_all() {
            Ok(()) => {
                let mut state = shared.state.lock();
                if state.committed < seqno {
                    state.committed = seqno;
                }
                shared.cond.notify_all();
                drop(state);
                let _ = committed_tx.send(seqno);
            }
            Err(err) => {
                tracing::warn!(error = %err, "cluster log fsync failed");
                // Stay pending; retry when new work arrives.
                let mut state = shared.state.lock();
                while state.requested == seqno {
                    shared.cond.wait(&mut state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn scratch_file(dir: &tempfile::TempDir) -> Arc<File> {
        let path = dir.path().join("scratch");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .unwrap();
        Arc::new(file)
    }

    #[test]
    fn test_commit_advances_past_request() {
        let dir = tempdir().unwrap();
        let file = scratch_file(&dir);
        (&*file).write_all(b"hello").unwrap();

        let worker = DurabilityWorker::spawn(file);
        let handle = worker.handle();
        let seqno = worker.request();
        handle.wait_committed(seqno);
        assert!(handle.committed() >= seqno);
    }

    #[test]
    fn test_seqnos_are_monotonic() {
        let dir = tempdir().unwrap();
        let worker = DurabilityWorker::spawn(scratch_file(&dir));
        let a = worker.request();
        let b = worker.request();
        assert!(b > a);

        let handle = worker.handle();
        handle.wait_committed(b);
        assert!(handle.committed() >= b);
    }

    #[test]
    fn test_watch_publishes_committed() {
        let dir = tempdir().unwrap();
        let worker = DurabilityWorker::spawn(scratch_file(&dir));
        let mut rx = worker.subscribe();
        let seqno = worker.request();
        for _ in 0..500 {
            if *rx.borrow_and_update() >= seqno {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("watch never observed the committed seqno");
    }

    #[test]
    fn test_shutdown_joins() {
        let dir = tempdir().unwrap();
        let mut worker = DurabilityWorker::spawn(scratch_file(&dir));
        worker.request();
        worker.shutdown();
        worker.shutdown();
    }
}
