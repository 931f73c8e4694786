//! Deterministic port assignment with a vacancy free-list.
//!
//! Tuples are handed out monotonically from the configured base; tuples
//! freed by destroy are recycled LIFO before the monotonic counter
//! advances. An allocation is only a reservation until [`PortAllocator::
//! commit`] is called, so a failed create hands the same tuple to the next
//! attempt.

use sagent_core::{InstanceInfo, Ports};

/// The port allocator state owned by the lifecycle controller.
#[derive(Debug)]
pub struct PortAllocator {
    init: Ports,
    /// Tuples freed by destroyed instances, consumed from the back.
    vacant: Vec<Ports>,
    /// The tuple the next fresh (non-vacancy) allocation will return.
    next_fresh: Ports,
    /// Whether the most recent allocation came from the vacancy list.
    /// Starts true so the first fresh allocation seeds `next_fresh` from
    /// the catalog high-water mark.
    last_from_vacant: bool,
}

impl PortAllocator {
    /// Creates an allocator starting at the configured base tuple.
    #[must_use]
    pub const fn new(init: Ports) -> Self {
        Self {
            init,
            vacant: Vec::new(),
            next_fresh: init,
            last_from_vacant: true,
        }
    }

    /// Scans the live instances and records every tuple between the base
    /// and the catalog's peer-port high-water mark that no instance
    /// holds. Called once at startup.
    pub fn populate_vacancies(&mut self, instances: &[InstanceInfo]) {
        let Some(max_peer) = instances
            .iter()
            .map(|info| info.assigned_ports.peer_port)
            .max()
        else {
            return;
        };

        let mut cursor = self.init;
        while cursor.peer_port < max_peer {
            let held = instances
                .iter()
                .any(|info| info.assigned_ports.peer_port == cursor.peer_port);
            if !held {
                self.vacant.push(cursor);
            }
            cursor = cursor.next();
        }
    }

    /// Reserves the next tuple without committing it.
    ///
    /// Vacancies are drained LIFO; otherwise the tuple after the fresh
    /// high-water mark is returned. `fetch_max` is consulted only when the
    /// allocator switches from recycling back to fresh assignment, once
    /// per fresh streak.
    ///
    /// # Errors
    ///
    /// Propagates the error of `fetch_max`.
    pub fn allocate<E>(
        &mut self,
        fetch_max: impl FnOnce() -> Result<Option<Ports>, E>,
    ) -> Result<Ports, E> {
        if let Some(&tuple) = self.vacant.last() {
            self.last_from_vacant = true;
            return Ok(tuple);
        }

        if self.last_from_vacant {
            self.next_fresh = match fetch_max()? {
                Some(max) => max.next(),
                None => self.init,
            };
            self.last_from_vacant = false;
        }
        Ok(self.next_fresh)
    }

    /// Commits the most recent reservation: pops the consumed vacancy or
    /// advances the fresh counter past `ports`.
    pub fn commit(&mut self, ports: Ports) {
        if self.last_from_vacant {
            self.vacant.pop();
        } else {
            self.next_fresh = ports.next();
        }
    }

    /// Returns a destroyed instance's tuple to the vacancy list.
    ///
    /// Rows written before the general-purpose ranges existed carry a zero
    /// `gp_tcp_port_start`; their GP starts are recomputed from the peer
    /// offset (two GP ports per instance) before reinsertion. Duplicates
    /// are dropped.
    pub fn release(&mut self, ports: Ports) {
        let tuple = if ports.gp_tcp_port_start == 0 {
            let offset = ports.peer_port.saturating_sub(self.init.peer_port) * 2;
            Ports {
                peer_port: ports.peer_port,
                user_port: ports.user_port,
                gp_tcp_port_start: self.init.gp_tcp_port_start + offset,
                gp_udp_port_start: self.init.gp_udp_port_start + offset,
            }
        } else {
            ports
        };

        if !self.vacant.contains(&tuple) {
            self.vacant.push(tuple);
        }
    }

    /// The current vacancy list, oldest first.
    #[must_use]
    pub fn vacancies(&self) -> &[Ports] {
        &self.vacant
    }
}

#[cfg(test)]
mod tests {
    use sagent_core::InstanceStatus;

    use super::*;

    const INIT: Ports = Ports {
        peer_port: 22861,
        user_port: 26201,
        gp_tcp_port_start: 36525,
        gp_udp_port_start: 39064,
    };

    fn never_called() -> Result<Option<Ports>, std::convert::Infallible> {
        panic!("allocator consulted the catalog during a vacancy streak");
    }

    fn instance_at(name: &str, ports: Ports) -> InstanceInfo {
        InstanceInfo {
            container_name: name.into(),
            owner_pubkey: "ed0a".into(),
            contract_id: "3b241101-e2bb-4255-8caf-4136c566a962".into(),
            pubkey: "ed0b".into(),
            contract_dir: format!("/home/sashi1/{name}"),
            image_name: "repo/app:1".into(),
            ip: String::new(),
            username: "sashi1".into(),
            assigned_ports: ports,
            status: InstanceStatus::Created,
        }
    }

    #[test]
    fn fresh_state_starts_at_the_base_tuple() {
        let mut alloc = PortAllocator::new(INIT);
        let first = alloc
            .allocate(|| Ok::<_, std::convert::Infallible>(None))
            .unwrap();
        assert_eq!(first, INIT);
        alloc.commit(first);

        let second = alloc.allocate(never_called).unwrap();
        assert_eq!(second, INIT.next());
    }

    #[test]
    fn uncommitted_reservation_is_reissued() {
        let mut alloc = PortAllocator::new(INIT);
        let first = alloc
            .allocate(|| Ok::<_, std::convert::Infallible>(None))
            .unwrap();
        // Create failed: no commit. The same tuple must come back.
        let retry = alloc.allocate(never_called).unwrap();
        assert_eq!(first, retry);
    }

    #[test]
    fn resumes_after_catalog_high_water_mark() {
        let mut alloc = PortAllocator::new(INIT);
        let existing_max = INIT.next().next();
        let next = alloc
            .allocate(|| Ok::<_, std::convert::Infallible>(Some(existing_max)))
            .unwrap();
        assert_eq!(next, existing_max.next());
    }

    #[test]
    fn vacancies_drain_lifo_before_fresh_assignment() {
        let mut alloc = PortAllocator::new(INIT);
        let a = INIT;
        let b = INIT.next();
        alloc.release(a);
        alloc.release(b);

        let first = alloc.allocate(never_called).unwrap();
        assert_eq!(first, b);
        alloc.commit(first);

        let second = alloc.allocate(never_called).unwrap();
        assert_eq!(second, a);
        alloc.commit(second);

        // List drained; fresh assignment consults the catalog again.
        let third = alloc
            .allocate(|| Ok::<_, std::convert::Infallible>(Some(b)))
            .unwrap();
        assert_eq!(third, b.next());
    }

    #[test]
    fn release_deduplicates() {
        let mut alloc = PortAllocator::new(INIT);
        alloc.release(INIT);
        alloc.release(INIT);
        assert_eq!(alloc.vacancies().len(), 1);
    }

    #[test]
    fn release_normalizes_legacy_rows_without_gp_ports() {
        let mut alloc = PortAllocator::new(INIT);
        let legacy = Ports {
            peer_port: INIT.peer_port + 3,
            user_port: INIT.user_port + 3,
            gp_tcp_port_start: 0,
            gp_udp_port_start: 0,
        };
        alloc.release(legacy);

        let tuple = alloc.vacancies()[0];
        assert_eq!(tuple.peer_port, INIT.peer_port + 3);
        assert_eq!(tuple.user_port, INIT.user_port + 3);
        assert_eq!(tuple.gp_tcp_port_start, INIT.gp_tcp_port_start + 6);
        assert_eq!(tuple.gp_udp_port_start, INIT.gp_udp_port_start + 6);
    }

    #[test]
    fn startup_scan_finds_holes_below_the_high_water_mark() {
        let mut alloc = PortAllocator::new(INIT);
        // Rows at offsets 0 and 2; offset 1 was destroyed in a previous
        // run of the daemon.
        let instances = vec![
            instance_at("c1", INIT),
            instance_at("c3", INIT.next().next()),
        ];
        alloc.populate_vacancies(&instances);

        assert_eq!(alloc.vacancies(), &[INIT.next()]);
        let next = alloc.allocate(never_called).unwrap();
        assert_eq!(next, INIT.next());
    }

    #[test]
    fn startup_scan_on_empty_catalog_is_a_noop() {
        let mut alloc = PortAllocator::new(INIT);
        alloc.populate_vacancies(&[]);
        assert!(alloc.vacancies().is_empty());
    }
}
