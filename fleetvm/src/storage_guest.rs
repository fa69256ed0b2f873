//! Optional storage guest pairing (§4.7, §4.13): a second guest booted from
//! the same image with a distinguishing flag, paired 1-to-1 with a primary
//! Worker by index. Specified at interface level only; the Pool is
//! responsible for serializing access via a single mutex (§5 "the only
//! mutex on the hot path").

use fleetvm_shared::{FleetError, FleetResult};

use crate::master::MasterGuest;
use crate::worker::Worker;

/// A storage guest's Master plus one Worker per primary Worker index.
pub struct StorageGuestPair {
    master: MasterGuest,
    workers: Vec<Worker>,
}

impl StorageGuestPair {
    pub fn new(master: MasterGuest, workers: Vec<Worker>) -> Self {
        Self { master, workers }
    }

    pub fn master(&self) -> &MasterGuest {
        &self.master
    }

    pub fn worker_for(&mut self, primary_worker_id: usize) -> Option<&mut Worker> {
        self.workers.get_mut(primary_worker_id)
    }

    /// Invokes `f` against the storage worker paired with `primary_worker_id`
    /// — the "bidirectional shared-memory call" of §4.7, reduced to an
    /// in-process closure since the remote-connect transport itself is part
    /// of the out-of-scope `Machine` back-end.
    pub fn call_paired<R>(
        &mut self,
        primary_worker_id: usize,
        f: impl FnOnce(&mut Worker) -> FleetResult<R>,
    ) -> FleetResult<R> {
        let worker = self.worker_for(primary_worker_id).ok_or_else(|| {
            FleetError::Internal(format!(
                "no storage guest worker paired with primary worker {primary_worker_id}"
            ))
        })?;
        f(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, RawPathEntry};
    use crate::sandbox::Sandbox;
    use crate::vm::mock::{GuestAction, MockMachine};
    use crate::vm::{BinaryType, MasterHooks};
    use crate::worker::ResetPolicy;
    use std::sync::Arc;

    fn sandbox() -> Sandbox {
        let raws: Vec<RawPathEntry> = Vec::new();
        let policy = Policy::build(std::path::Path::new("/"), &raws, &[], &[], &[]).unwrap();
        Sandbox::new(Arc::new(policy), "/")
    }

    fn frozen_master() -> MasterGuest {
        let machine = MockMachine::new(
            vec![GuestAction::Listen { vfd: 4 }, GuestAction::EpollWait { registered: vec![4] }],
            BinaryType::Static,
            1 << 32,
            Box::new(MasterHooks::new(4)),
        );
        let mut master = MasterGuest::new(Box::new(machine), sandbox(), 4, 10);
        master.boot(None).unwrap();
        master.freeze().unwrap();
        master
    }

    fn reset_policy() -> ResetPolicy {
        ResetPolicy {
            reset_free_work_mem: 1 << 20,
            reset_copy_all_registers: true,
            reset_keep_all_work_memory: false,
        }
    }

    #[test]
    fn call_paired_invokes_closure_for_a_known_worker() {
        let master = frozen_master();
        let worker_machine = master.fork_worker_machine(1 << 20).unwrap();
        let worker = Worker::new(0, worker_machine, sandbox(), true, reset_policy());
        let mut pair = StorageGuestPair::new(master, vec![worker]);

        let id = pair.call_paired(0, |w| Ok(w.id())).unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn call_paired_errors_for_an_unknown_worker() {
        let master = frozen_master();
        let mut pair = StorageGuestPair::new(master, Vec::new());
        assert!(pair.call_paired(0, |_w| Ok(())).is_err());
    }
}
