//! Integration tests for published server groups and attaching client
//! groups over TCP.

use std::path::Path;
use std::thread::{self, JoinHandle};

use tempfile::TempDir;

use dsmbuf::buffer::{BufferState, Role};
use dsmbuf::comm::LocalFabric;
use dsmbuf::config::DsmConfig;
use dsmbuf::layout::DsmType;
use dsmbuf::manager::{DsmManager, Mode};
use dsmbuf::DsmResult;

fn config(dir: &Path, num_connections: usize) -> DsmConfig {
    let mut config = DsmConfig::default();
    config.buffer.length_bytes = Some(256);
    config.network.rendezvous_file = dir.join("servers.addr");
    config.network.num_connections = num_connections;
    config.network.connect_timeout_secs = 20;
    config.network.connect_retry_ms = 20;
    config
}

/// Publish a server group of `size` in-process ranks
fn publish(size: usize, config: &DsmConfig) -> Vec<JoinHandle<DsmResult<BufferState>>> {
    LocalFabric::create(size)
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            thread::spawn(move || {
                let mut manager = DsmManager::publish(&comm, &config, None)?;
                assert_eq!(manager.mode(), Mode::Published);
                manager.destroy()?;
                Ok(manager.buffer().state())
            })
        })
        .collect()
}

fn join_servers(servers: Vec<JoinHandle<DsmResult<BufferState>>>) {
    for handle in servers {
        let state = handle.join().unwrap().expect("server group ran cleanly");
        assert_eq!(state, BufferState::Terminated);
    }
}

// ============================================================================
// Attach
// ============================================================================

#[test]
fn test_client_group_attaches_and_stops_servers() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), 2);
    let servers = publish(2, &config);

    let clients: Vec<_> = LocalFabric::create(2)
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            thread::spawn(move || {
                let mut manager = DsmManager::attach(&comm, &config).unwrap();
                let buffer = manager.buffer_mut();
                assert_eq!(buffer.role(), Role::Remote);
                assert_eq!(buffer.total_length().unwrap(), 512);
                assert_eq!(buffer.map().unwrap().dsm_type(), DsmType::Uniform);

                // rank r writes across the server boundary at 200 + 30r
                let rank = comm.rank() as u8;
                let address = 200 + 30 * comm.rank() as u64;
                let data = vec![rank + 1; 100];
                buffer.put(address, &data).unwrap();
                let mut out = vec![0u8; 100];
                buffer.get(address, &mut out).unwrap();

                manager.destroy().unwrap();
                assert_eq!(manager.buffer().state(), BufferState::Disconnected);
                (address, out)
            })
        })
        .collect();

    for handle in clients {
        let (address, out) = handle.join().unwrap();
        // the other rank may have overwritten part of the range
        assert!(out.iter().all(|b| *b == 1 || *b == 2), "range at {}", address);
    }
    join_servers(servers);
    assert!(!dir.path().join("servers.addr").exists());
}

#[test]
fn test_servers_readmit_after_disconnect() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), 1);
    let servers = publish(2, &config);

    // first client leaves without stopping the servers
    {
        let comms = LocalFabric::create(1);
        let mut manager = DsmManager::attach(&comms[0], &config).unwrap();
        manager.set_shutdown_on_detach(false);
        manager.buffer_mut().put(250, b"persist").unwrap();
        manager.destroy().unwrap();
    }

    // a second client sees the data and stops the group
    let comms = LocalFabric::create(1);
    let mut manager = DsmManager::attach(&comms[0], &config).unwrap();
    let mut out = [0u8; 7];
    manager.buffer_mut().get(250, &mut out).unwrap();
    assert_eq!(&out, b"persist");
    manager.destroy().unwrap();

    join_servers(servers);
}

#[test]
fn test_remote_clients_cannot_accept() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), 1);
    let servers = publish(1, &config);

    let comms = LocalFabric::create(1);
    let mut manager = DsmManager::attach(&comms[0], &config).unwrap();
    assert!(manager.buffer_mut().send_accept(1).is_err());
    manager.destroy().unwrap();

    join_servers(servers);
}
