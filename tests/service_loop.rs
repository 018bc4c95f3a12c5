//! Integration tests for the server service loop driven by hand-built
//! command headers.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use zerocopy::IntoBytes;

use dsmbuf::buffer::{BufferState, DsmBuffer, ServiceStep};
use dsmbuf::comm::{Communicator, LocalFabric, ProcessGroup};
use dsmbuf::constants::{tags, STATUS_SUCCESS};
use dsmbuf::layout::{AddressMap, LayoutSpec};
use dsmbuf::protocol::{decode_ack, CommandHeader, Opcode, ProtocolError};
use dsmbuf::{DsmError, DsmResult};

use common::bind;

type ServerResult = (DsmResult<Opcode>, BufferState);

fn spawn_server(comm: Communicator, map: AddressMap) -> JoinHandle<ServerResult> {
    thread::spawn(move || {
        let mut buffer = DsmBuffer::new(bind(&comm));
        buffer.configure(map).unwrap();
        let result = buffer.service_loop();
        (result, buffer.state())
    })
}

/// Two servers (ranks 0 and 1) and a raw client group handle on rank 2
fn scripted_cluster() -> (ProcessGroup, Vec<JoinHandle<ServerResult>>) {
    let map = LayoutSpec::uniform(64).with_servers(0, 1).build(3).unwrap();
    let mut comms = LocalFabric::create(3);
    let client = comms.pop().unwrap();
    let servers = comms
        .into_iter()
        .map(|comm| spawn_server(comm, map.clone()))
        .collect();
    (bind(&client), servers)
}

fn send_header(comm: &Communicator, dest: usize, opcode: Opcode, address: u64, length: u64) {
    let header = CommandHeader::new(opcode, comm.rank(), address, length).unwrap();
    comm.send(dest, tags::COMMAND, header.as_bytes()).unwrap();
}

fn send_done(comm: &Communicator, servers: &[usize]) {
    for &server in servers {
        send_header(comm, server, Opcode::Done, 0, 0);
    }
}

// ============================================================================
// Data path
// ============================================================================

#[test]
fn test_put_and_get_headers() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    send_header(comm, 1, Opcode::Put, 10, 4);
    comm.send(1, tags::PUT_DATA, b"abcd").unwrap();
    let ack = comm.recv_exact(1, tags::SERVER_ACK, 4).unwrap();
    assert_eq!(decode_ack(&ack).unwrap(), STATUS_SUCCESS);

    send_header(comm, 1, Opcode::Get, 8, 8);
    let data = comm.recv_exact(1, tags::GET_DATA, 8).unwrap();
    assert_eq!(&data, b"\0\0abcd\0\0");

    send_done(comm, &[0, 1]);
    for handle in servers {
        let (result, state) = handle.join().unwrap();
        assert_eq!(result.unwrap(), Opcode::Done);
        assert_eq!(state, BufferState::Terminated);
    }
}

#[test]
fn test_zero_length_get_at_segment_end() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    send_header(comm, 0, Opcode::Get, 64, 0);
    let data = comm.recv_exact(0, tags::GET_DATA, 0).unwrap();
    assert!(data.is_empty());

    send_done(comm, &[0, 1]);
    for handle in servers {
        assert!(handle.join().unwrap().0.is_ok());
    }
}

// ============================================================================
// Home requests
// ============================================================================

#[test]
fn test_lock_request_forwarded_to_home() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    // rank 1 is not the home rank: it relays to rank 0, which grants
    send_header(comm, 1, Opcode::LockAcquire, 0, 4);
    comm.send(1, tags::EXCHANGE, b"mesh").unwrap();
    let grant = comm.recv_exact(0, tags::EXCHANGE, 4).unwrap();
    assert_eq!(decode_ack(&grant).unwrap(), STATUS_SUCCESS);

    send_header(comm, 0, Opcode::LockRelease, 0, 4);
    comm.send(0, tags::EXCHANGE, b"mesh").unwrap();

    send_done(comm, &[1, 0]);
    for handle in servers {
        assert!(handle.join().unwrap().0.is_ok());
    }
}

// ============================================================================
// Fatal input
// ============================================================================

#[test]
fn test_out_of_range_put_terminates_server() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    send_header(comm, 0, Opcode::Put, 60, 8);
    send_done(comm, &[1]);

    let mut results = servers.into_iter().map(|h| h.join().unwrap());
    let (first, state) = results.next().unwrap();
    assert!(matches!(
        first,
        Err(DsmError::Protocol(ProtocolError::OutOfRange { .. }))
    ));
    assert_eq!(state, BufferState::Terminated);
    assert!(results.next().unwrap().0.is_ok());
}

#[test]
fn test_unknown_opcode_terminates_server() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    let header = CommandHeader {
        opcode: 0x42,
        source: comm.rank() as i32,
        address: 0,
        length: 0,
    };
    comm.send(1, tags::COMMAND, header.as_bytes()).unwrap();
    send_done(comm, &[0]);

    let results: Vec<_> = servers.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results[0].0.is_ok());
    assert!(matches!(
        results[1].0,
        Err(DsmError::Protocol(ProtocolError::UnknownOpcode(0x42)))
    ));
}

#[test]
fn test_truncated_header_terminates_server() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    comm.send(0, tags::COMMAND, &[1, 0, 0]).unwrap();
    send_done(comm, &[1]);

    let results: Vec<_> = servers.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(matches!(
        results[0].0,
        Err(DsmError::Protocol(ProtocolError::Truncated { .. }))
    ));
}

#[test]
fn test_short_put_payload_terminates_server() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    send_header(comm, 0, Opcode::Put, 0, 4);
    comm.send(0, tags::PUT_DATA, b"abc").unwrap();
    send_done(comm, &[1]);

    let mut results = servers.into_iter().map(|h| h.join().unwrap());
    let (first, state) = results.next().unwrap();
    let err = first.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        DsmError::Protocol(ProtocolError::Truncated {
            expected: 4,
            actual: 3,
            ..
        })
    ));
    assert_eq!(state, BufferState::Terminated);
    assert!(results.next().unwrap().0.is_ok());
}

#[test]
fn test_long_put_payload_terminates_server() {
    let (group, servers) = scripted_cluster();
    let comm = group.local().unwrap();

    send_header(comm, 1, Opcode::Put, 0, 2);
    comm.send(1, tags::PUT_DATA, b"abcd").unwrap();
    send_done(comm, &[0]);

    let results: Vec<_> = servers.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results[0].0.is_ok());
    assert!(matches!(
        results[1].0,
        Err(DsmError::Protocol(ProtocolError::Malformed(_)))
    ));
    assert_eq!(results[1].1, BufferState::Terminated);
}

// ============================================================================
// Loop control
// ============================================================================

#[test]
fn test_shutdown_flag_ends_idle_loop() {
    let comms = LocalFabric::create(1);
    let map = LayoutSpec::uniform(16).build(1).unwrap();
    let mut buffer = DsmBuffer::new(bind(&comms[0]));
    buffer.configure(map).unwrap();
    buffer.set_shutdown_flag(Arc::new(AtomicBool::new(true)));

    assert_eq!(buffer.service_loop().unwrap(), Opcode::Done);
    assert_eq!(buffer.state(), BufferState::Terminated);
    assert_eq!(buffer.service_once().unwrap(), ServiceStep::Terminated);
}

#[test]
fn test_workers_do_not_serve() {
    let comms = LocalFabric::create(2);
    let map = LayoutSpec::uniform(16).with_servers(0, 0).build(2).unwrap();
    let mut worker = DsmBuffer::new(bind(&comms[1]));
    worker.configure(map).unwrap();
    assert!(matches!(
        worker.service_once(),
        Err(DsmError::InvalidState(_))
    ));
}

#[test]
fn test_service_once_steps_single_commands() {
    let comms = LocalFabric::create(2);
    let map = LayoutSpec::uniform(16).with_servers(0, 0).build(2).unwrap();
    let mut server = DsmBuffer::new(bind(&comms[0]));
    server.configure(map).unwrap();

    let client = bind(&comms[1]);
    let comm = client.local().unwrap();
    send_header(comm, 0, Opcode::Get, 0, 2);
    send_header(comm, 0, Opcode::Done, 0, 0);

    assert_eq!(
        server.service_once().unwrap(),
        ServiceStep::Serviced(Opcode::Get)
    );
    assert_eq!(server.state(), BufferState::Servicing);
    assert_eq!(comm.recv_exact(0, tags::GET_DATA, 2).unwrap(), vec![0, 0]);
    assert_eq!(server.service_once().unwrap(), ServiceStep::Terminated);
}
