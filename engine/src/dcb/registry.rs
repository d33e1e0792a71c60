//! Per-worker DCB pool. DCBs live in their owner's registry under a
//! stable id; sessions and routers hold ids, never references. Closing is
//! two-phase: the DCB first leaves the poller, then the slot is released
//! by the worker on a later tick.

use crate::dcb::{Dcb, DcbId, Role};

#[derive(Debug, Default)]
pub struct DcbRegistry {
    dcbs: std::collections::HashMap<DcbId, Dcb>,
    next_id: DcbId,
    /// Lifetime count, for diagnostics.
    total_added: u64,
}

impl DcbRegistry {
    pub fn new() -> Self {
        DcbRegistry {
            dcbs: std::collections::HashMap::new(),
            next_id: 1,
            total_added: 0,
        }
    }

    /// Register a DCB with the given owning worker, assigning its id.
    pub fn add(&mut self, mut dcb: Dcb, owner: usize) -> DcbId {
        let id = self.next_id;
        self.next_id += 1;
        self.total_added += 1;

        dcb.assign(id, owner);
        self.dcbs.insert(id, dcb);
        id
    }

    /// Temporarily remove a DCB for event dispatch. The worker puts it
    /// back unless the handler closed it.
    pub fn take(&mut self, id: DcbId) -> Option<Dcb> {
        self.dcbs.remove(&id)
    }

    pub fn put_back(&mut self, id: DcbId, dcb: Dcb) {
        debug_assert_eq!(dcb.id(), id);
        self.dcbs.insert(id, dcb);
    }

    pub fn remove(&mut self, id: DcbId) -> Option<Dcb> {
        self.dcbs.remove(&id)
    }

    pub fn get_mut(&mut self, id: DcbId) -> Option<&mut Dcb> {
        self.dcbs.get_mut(&id)
    }

    pub fn contains(&self, id: DcbId) -> bool {
        self.dcbs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.dcbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dcbs.is_empty()
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn count_by_role(&self, role: Role) -> usize {
        self.dcbs.values().filter(|d| d.role() == role).count()
    }

    /// Ids currently in the pool, for shutdown sweeps.
    pub fn ids(&self) -> Vec<DcbId> {
        self.dcbs.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use std::net::{TcpListener, TcpStream};

    use crate::dcb::{Dcb, DcbHandler, Role};
    use crate::worker::Worker;

    use super::DcbRegistry;

    struct NullHandler;

    impl DcbHandler for NullHandler {
        fn ready_for_reading(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn write_ready(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn error(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
        fn hangup(&mut self, _dcb: &mut Dcb, _worker: &Worker) {}
    }

    fn make_dcb(role: Role) -> (Dcb, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Dcb::new(server, addr.to_string(), role, Box::new(NullHandler)).unwrap(),
            client,
        )
    }

    #[test]
    fn ids_are_stable_and_unique() {
        let mut registry = DcbRegistry::new();
        let (a, _ka) = make_dcb(Role::Client);
        let (b, _kb) = make_dcb(Role::Backend);

        let id_a = registry.add(a, 0);
        let id_b = registry.add(b, 0);
        assert_ne!(id_a, id_b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.count_by_role(Role::Client), 1);
        assert_eq!(registry.count_by_role(Role::Backend), 1);

        let taken = registry.take(id_a).unwrap();
        assert_eq!(taken.id(), id_a);
        assert_eq!(taken.owner(), Some(0));
        assert!(!registry.contains(id_a));

        registry.put_back(id_a, taken);
        assert!(registry.contains(id_a));

        registry.remove(id_a);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_added(), 2);
    }
}
