//! In-process clusters shared by the integration tests

#![allow(dead_code)]

use std::thread::{self, JoinHandle};

use dsmbuf::buffer::DsmBuffer;
use dsmbuf::comm::{Communicator, LocalFabric, ProcessGroup, RendezvousFile};
use dsmbuf::layout::{AddressMap, LayoutSpec};
use dsmbuf::protocol::Opcode;
use dsmbuf::DsmResult;

/// Server ranks running their service loops on background threads
pub struct Servers {
    handles: Vec<JoinHandle<DsmResult<Opcode>>>,
}

impl Servers {
    /// Wait for every service loop to end
    pub fn join(self) -> Vec<DsmResult<Opcode>> {
        self.handles
            .into_iter()
            .map(|h| h.join().expect("server thread panicked"))
            .collect()
    }
}

pub fn bind(comm: &Communicator) -> ProcessGroup {
    ProcessGroup::bind(comm, RendezvousFile::new("unused")).unwrap()
}

/// Start `servers` server ranks serving `spec` and return `workers`
/// configured client buffers
///
/// Ranks `0..servers` serve, the remaining ranks are workers.
pub fn start_cluster(spec: LayoutSpec, servers: usize, workers: usize) -> (Vec<DsmBuffer>, Servers) {
    let size = servers + workers;
    let map = spec
        .with_servers(0, servers - 1)
        .build(size)
        .expect("valid layout");
    let mut comms = LocalFabric::create(size);
    let worker_comms = comms.split_off(servers);

    let handles = comms
        .into_iter()
        .map(|comm| {
            let map = map.clone();
            thread::spawn(move || {
                let mut buffer = DsmBuffer::new(bind(&comm));
                buffer.configure(map)?;
                buffer.service_loop()
            })
        })
        .collect();

    let clients = worker_comms
        .iter()
        .map(|comm| worker(comm, map.clone()))
        .collect();
    (clients, Servers { handles })
}

pub fn worker(comm: &Communicator, map: AddressMap) -> DsmBuffer {
    let mut buffer = DsmBuffer::new(bind(comm));
    buffer.configure(map).unwrap();
    buffer
}

/// Stop the servers through the first client and collect their results
pub fn stop_cluster(mut clients: Vec<DsmBuffer>, servers: Servers) -> Vec<DsmResult<Opcode>> {
    clients[0].send_done().unwrap();
    drop(clients);
    servers.join()
}
