//! Hands accepted connections from the master to workers.

use std::sync::Mutex;

use tcpd_core::ConnectionId;
use tokio::sync::mpsc;

/// A connection accepted by the master.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub fd: ConnectionId,
    pub reactor_id: usize,
    pub stream: std::net::TcpStream,
}

struct Inbox {
    generation: u64,
    tx: mpsc::UnboundedSender<Accepted>,
}

/// Worker inboxes, indexed by worker id.
///
/// Each slot belongs to the newest generation of its worker. A retiring generation keeps its slot, and keeps taking
/// connections, until its replacement registers.
pub(crate) struct Router {
    inboxes: Mutex<Vec<Option<Inbox>>>,
}

impl Router {
    pub fn new(worker_num: usize) -> Self {
        Self {
            inboxes: Mutex::new((0..worker_num).map(|_| None).collect()),
        }
    }

    /// Registers the inbox of a worker, replacing any older generation.
    pub fn register(&self, worker_id: usize, generation: u64, tx: mpsc::UnboundedSender<Accepted>) {
        if let Some(slot) = self.lock().get_mut(worker_id) {
            *slot = Some(Inbox { generation, tx });
        }
    }

    /// Removes the inbox of a worker, unless a newer generation already replaced it.
    pub fn unregister(&self, worker_id: usize, generation: u64) {
        if let Some(slot) = self.lock().get_mut(worker_id) {
            if slot.as_ref().is_some_and(|inbox| inbox.generation == generation) {
                *slot = None;
            }
        }
    }

    /// Routes a connection to the worker chosen by its id.
    ///
    /// If that worker is being replaced, the next worker that takes connections is used instead. Returns the
    /// connection back if no worker can take it.
    pub fn route(&self, mut accepted: Accepted) -> Result<usize, Accepted> {
        let inboxes = self.lock();
        let worker_num = inboxes.len();
        if worker_num == 0 {
            return Err(accepted);
        }

        let preferred = (accepted.fd.as_u64() % worker_num as u64) as usize;
        for offset in 0..worker_num {
            let worker_id = (preferred + offset) % worker_num;
            if let Some(inbox) = &inboxes[worker_id] {
                match inbox.tx.send(accepted) {
                    Ok(()) => return Ok(worker_id),
                    Err(e) => accepted = e.0,
                }
            }
        }

        Err(accepted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<Inbox>>> {
        self.inboxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
