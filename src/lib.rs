//! dsmbuf - A Distributed Shared Memory Buffer
//!
//! dsmbuf spreads one virtual byte buffer across a group of server
//! processes. Client processes address the buffer with global offsets; the
//! library splits every request along the server layout and moves the
//! pieces over message channels. It features:
//!
//! - **Pluggable layouts**: contiguous (uniform), block-cyclic,
//!   block-random and mixed per-rank extents behind one address map
//! - **Two topologies**: servers and workers inside one process group, or a
//!   published server group that independently launched client groups
//!   attach to over TCP
//! - **Coordination services**: named locks, notifications and a registry of
//!   named regions, all kept on the first server rank
//! - **File-like access**: open, read, write and close named regions
//!
//! # Architecture
//!
//! - **Communication** ([`comm`]): tag-matched message channels over an
//!   in-process fabric or TCP, plus the process group descriptor
//! - **Layout** ([`layout`]): the address map from global offsets to
//!   (rank, local offset)
//! - **Protocol** ([`protocol`]): command headers and exchanged records
//! - **Buffer** ([`buffer`]): local segment, client operations and the
//!   server service loop
//! - **Manager** ([`manager`]): assembly and teardown of a buffer
//! - **API Layer** ([`api`]): file operations over named regions
//!
//! # Example
//!
//! ```rust,no_run
//! use dsmbuf::comm::LocalFabric;
//! use dsmbuf::config::DsmConfig;
//! use dsmbuf::manager::DsmManager;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = DsmConfig::default();
//! config.buffer.length_bytes = Some(4096);
//! config.buffer.end_server = Some(0);
//!
//! let comms = LocalFabric::create(2);
//! let mut ranks = comms.into_iter();
//! let server = ranks.next().unwrap();
//! let worker = ranks.next().unwrap();
//!
//! let server_config = config.clone();
//! let handle = std::thread::spawn(move || {
//!     // serves until the worker sends DONE
//!     DsmManager::create(&server, &server_config).map(|_| ())
//! });
//!
//! let mut manager = DsmManager::create(&worker, &config)?;
//! manager.buffer_mut().put(100, b"Hello, DSM!")?;
//! let mut buf = [0u8; 11];
//! manager.buffer_mut().get(100, &mut buf)?;
//! manager.destroy()?;
//! handle.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod constants;
pub mod error;
pub mod layout;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod server;

pub use buffer::DsmBuffer;
pub use error::{DsmError, DsmResult};
pub use manager::DsmManager;
