//! Run-level concurrency gate.
//!
//! Serializes or cancels whole pipeline runs that share a concurrency
//! key. State is process-wide and long-lived: an explicitly owned,
//! lock-guarded table, never ambient globals. The lock is held only
//! for the check-and-set; the sole liveness guarantee is that at most
//! one run holds a key at any instant — there is no fairness promise
//! across distinct keys.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};
use trellis_core::document::Concurrency;
use trellis_core::ids::RunId;

use crate::scheduler::CancelSignal;

/// Proof that a run holds its concurrency key. Carries the signal the
/// gate uses to request cancellation of the holder.
#[derive(Debug)]
pub struct RunPermit {
    pub run_id: RunId,
    pub key: String,
    cancel: CancelSignal,
}

impl RunPermit {
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }
}

/// Admission decision for a new run.
#[derive(Debug)]
pub enum Admission {
    /// No run holds the key; proceed immediately.
    Proceed(RunPermit),
    /// The key is held; the ticket resolves when this run is promoted
    /// to holder, or to canceled if it is superseded while waiting.
    Wait(AdmitTicket),
}

#[derive(Debug)]
pub struct AdmitTicket {
    rx: oneshot::Receiver<Option<RunPermit>>,
}

impl AdmitTicket {
    /// Wait for promotion. `None` means the run was superseded and
    /// canceled while queued.
    pub async fn admitted(self) -> Option<RunPermit> {
        self.rx.await.ok().flatten()
    }
}

struct Holder {
    run_id: RunId,
    cancel_tx: watch::Sender<Option<String>>,
}

struct Waiter {
    run_id: RunId,
    admit_tx: oneshot::Sender<Option<RunPermit>>,
}

#[derive(Default)]
struct Group {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
}

/// Process-wide concurrency group table.
#[derive(Default)]
pub struct ConcurrencyGate {
    groups: Mutex<HashMap<String, Group>>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request admission for a run under the document's concurrency
    /// declaration.
    pub fn admit(&self, run_id: RunId, concurrency: &Concurrency) -> Admission {
        let mut groups = self.groups.lock().expect("gate lock");
        let group = groups.entry(concurrency.group.clone()).or_default();

        if let Some(holder) = &group.holder
            && holder.run_id == run_id
        {
            // Double admission for a held key: an internal invariant
            // violation, not a user-facing error.
            debug_assert!(false, "run {run_id} already holds key {}", concurrency.group);
            error!(%run_id, key = %concurrency.group, "double admission for held key");
        }

        if group.holder.is_none() {
            let permit = install_holder(group, run_id, &concurrency.group);
            info!(%run_id, key = %concurrency.group, "admitted");
            return Admission::Proceed(permit);
        }

        if concurrency.cancel_in_progress {
            if let Some(holder) = &group.holder {
                debug!(holder = %holder.run_id, key = %concurrency.group, "canceling holder");
                let _ = holder
                    .cancel_tx
                    .send(Some("superseded by newer run".to_string()));
            }
            // Queued runs are superseded outright.
            for waiter in group.queue.drain(..) {
                let _ = waiter.admit_tx.send(None);
            }
        }

        let (admit_tx, rx) = oneshot::channel();
        group.queue.push_back(Waiter { run_id, admit_tx });
        debug!(%run_id, key = %concurrency.group, position = group.queue.len(), "queued");
        Admission::Wait(AdmitTicket { rx })
    }

    /// Release a key once its run reaches a terminal state, promoting
    /// the next queued run if any.
    pub fn release(&self, key: &str, run_id: RunId) {
        let mut groups = self.groups.lock().expect("gate lock");
        let Some(group) = groups.get_mut(key) else {
            return;
        };

        match &group.holder {
            Some(holder) if holder.run_id == run_id => {
                group.holder = None;
                while let Some(waiter) = group.queue.pop_front() {
                    let next_run = waiter.run_id;
                    let permit = install_holder(group, next_run, key);
                    if waiter.admit_tx.send(Some(permit)).is_ok() {
                        info!(run_id = %next_run, key, "promoted from queue");
                        break;
                    }
                    // The waiter vanished; undo and try the next one.
                    group.holder = None;
                }
            }
            _ => {
                // A queued run finished (canceled) before promotion.
                group.queue.retain(|waiter| waiter.run_id != run_id);
            }
        }
    }

    pub fn holder(&self, key: &str) -> Option<RunId> {
        let groups = self.groups.lock().expect("gate lock");
        groups
            .get(key)
            .and_then(|group| group.holder.as_ref().map(|h| h.run_id))
    }

    pub fn queue_len(&self, key: &str) -> usize {
        let groups = self.groups.lock().expect("gate lock");
        groups.get(key).map_or(0, |group| group.queue.len())
    }

    /// Drop group records with no holder and no waiters. Safe to call
    /// at any time; groups are recreated on first use.
    pub fn evict_idle(&self) {
        let mut groups = self.groups.lock().expect("gate lock");
        groups.retain(|_, group| group.holder.is_some() || !group.queue.is_empty());
    }
}

fn install_holder(group: &mut Group, run_id: RunId, key: &str) -> RunPermit {
    let (cancel_tx, cancel_rx) = watch::channel(None);
    group.holder = Some(Holder { run_id, cancel_tx });
    RunPermit {
        run_id,
        key: key.to_string(),
        cancel: cancel_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concurrency(group: &str, cancel_in_progress: bool) -> Concurrency {
        Concurrency {
            group: group.to_string(),
            cancel_in_progress,
        }
    }

    #[tokio::test]
    async fn test_first_run_proceeds() {
        let gate = ConcurrencyGate::new();
        let run = RunId::new();
        match gate.admit(run, &concurrency("deploy-prod", false)) {
            Admission::Proceed(permit) => assert_eq!(permit.run_id, run),
            Admission::Wait(_) => panic!("first run must proceed"),
        }
        assert_eq!(gate.holder("deploy-prod"), Some(run));
    }

    #[tokio::test]
    async fn test_second_run_waits_until_release() {
        let gate = ConcurrencyGate::new();
        let first = RunId::new();
        let second = RunId::new();

        let Admission::Proceed(_) = gate.admit(first, &concurrency("deploy-prod", false)) else {
            panic!("first run must proceed");
        };
        let Admission::Wait(ticket) = gate.admit(second, &concurrency("deploy-prod", false))
        else {
            panic!("second run must wait");
        };

        assert_eq!(gate.holder("deploy-prod"), Some(first));
        gate.release("deploy-prod", first);

        let permit = ticket.admitted().await.expect("promoted");
        assert_eq!(permit.run_id, second);
        assert_eq!(gate.holder("deploy-prod"), Some(second));
    }

    #[tokio::test]
    async fn test_cancel_in_progress_signals_holder() {
        let gate = ConcurrencyGate::new();
        let first = RunId::new();
        let second = RunId::new();

        let Admission::Proceed(permit) = gate.admit(first, &concurrency("deploy-prod", false))
        else {
            panic!("first run must proceed");
        };
        let mut cancel = permit.cancel_signal();
        assert!(cancel.borrow().is_none());

        let Admission::Wait(ticket) = gate.admit(second, &concurrency("deploy-prod", true))
        else {
            panic!("second run must wait for the holder to wind down");
        };

        cancel.changed().await.expect("cancel signaled");
        assert!(cancel.borrow().is_some());

        // The holder winds down and releases; the new run is promoted.
        gate.release("deploy-prod", first);
        let permit = ticket.admitted().await.expect("promoted");
        assert_eq!(permit.run_id, second);
    }

    #[tokio::test]
    async fn test_superseded_waiter_is_canceled() {
        let gate = ConcurrencyGate::new();
        let first = RunId::new();
        let second = RunId::new();
        let third = RunId::new();

        let Admission::Proceed(_) = gate.admit(first, &concurrency("k", false)) else {
            panic!("first run must proceed");
        };
        let Admission::Wait(second_ticket) = gate.admit(second, &concurrency("k", false)) else {
            panic!("second run must wait");
        };
        let Admission::Wait(_third_ticket) = gate.admit(third, &concurrency("k", true)) else {
            panic!("third run must wait");
        };

        assert!(second_ticket.admitted().await.is_none());
    }

    #[tokio::test]
    async fn test_mutual_exclusion_single_holder() {
        let gate = ConcurrencyGate::new();
        let runs: Vec<RunId> = (0..5).map(|_| RunId::new()).collect();

        let mut proceed = 0;
        for run in &runs {
            if let Admission::Proceed(_) = gate.admit(*run, &concurrency("k", false)) {
                proceed += 1;
            }
        }
        assert_eq!(proceed, 1);
        assert_eq!(gate.queue_len("k"), 4);
    }

    #[tokio::test]
    async fn test_evict_idle_drops_empty_groups() {
        let gate = ConcurrencyGate::new();
        let run = RunId::new();
        let Admission::Proceed(_) = gate.admit(run, &concurrency("k", false)) else {
            panic!("first run must proceed");
        };
        gate.release("k", run);
        gate.evict_idle();
        assert_eq!(gate.holder("k"), None);
        assert_eq!(gate.queue_len("k"), 0);
    }
}
