//! TCP wire: one stream per peer, one reader thread per stream.
//!
//! Frames are a fixed [`FrameHeader`] followed by the payload. Every link
//! opens with a [`LinkHello`] from the dialing side announcing its rank and
//! the size of its group.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::communicator::{Communicator, Wire};
use super::mailbox::{Frame, Mailbox};
use super::{CommError, CommResult, Rank};
use crate::constants::LINK_MAGIC;

/// Poll interval while waiting on a non-blocking listener
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct FrameHeader {
    pub context: u64,
    pub length: u64,
    pub source: u32,
    pub tag: i32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct LinkHello {
    pub magic: u64,
    pub group_size: u32,
    pub rank: u32,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == 24);
const _: () = assert!(std::mem::size_of::<LinkHello>() == 16);

impl LinkHello {
    pub fn new(group_size: usize, rank: Rank) -> Self {
        Self {
            magic: LINK_MAGIC,
            group_size: group_size as u32,
            rank: rank as u32,
        }
    }
}

pub(crate) fn write_hello(stream: &mut TcpStream, group_size: usize, rank: Rank) -> CommResult<()> {
    stream.write_all(LinkHello::new(group_size, rank).as_bytes())?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_hello(stream: &mut TcpStream) -> CommResult<LinkHello> {
    let mut buf = [0u8; std::mem::size_of::<LinkHello>()];
    stream.read_exact(&mut buf)?;
    let hello = LinkHello::read_from_bytes(&buf)
        .map_err(|_| CommError::Handshake("short hello".to_string()))?;
    if hello.magic != LINK_MAGIC {
        return Err(CommError::Handshake(format!(
            "bad link magic {:#x}",
            hello.magic
        )));
    }
    Ok(hello)
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> io::Result<()> {
    let header = FrameHeader {
        context: frame.context,
        length: frame.payload.len() as u64,
        source: frame.source as u32,
        tag: frame.tag,
    };
    stream.write_all(header.as_bytes())?;
    stream.write_all(&frame.payload)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Frame> {
    let mut buf = [0u8; std::mem::size_of::<FrameHeader>()];
    stream.read_exact(&mut buf)?;
    let header = FrameHeader::read_from_bytes(&buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload)?;
    Ok(Frame {
        context: header.context,
        source: header.source as Rank,
        tag: header.tag,
        payload,
    })
}

/// TCP-backed wire
#[derive(Debug)]
pub struct TcpWire {
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    links: Mutex<HashMap<Rank, Arc<Mutex<TcpStream>>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpWire {
    /// Create an unlinked wire for `rank` in a group of `size`
    pub fn new(rank: Rank, size: usize) -> Arc<Self> {
        Arc::new(Self {
            rank,
            size,
            mailbox: Arc::new(Mailbox::new()),
            links: Mutex::new(HashMap::new()),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Bind `stream` as the link to `peer` and start its reader
    pub fn attach(&self, peer: Rank, stream: TcpStream) -> CommResult<()> {
        if peer >= self.size || peer == self.rank {
            return Err(CommError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;

        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if links.contains_key(&peer) {
            return Err(CommError::Handshake(format!(
                "rank {} linked twice to rank {}",
                peer, self.rank
            )));
        }
        links.insert(peer, Arc::new(Mutex::new(stream)));
        drop(links);

        let handle = spawn_reader(self.rank, peer, reader_stream, self.mailbox.clone())?;
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        tracing::debug!("Rank {} linked to rank {}", self.rank, peer);
        Ok(())
    }

    pub fn linked_peers(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn into_communicator(self: Arc<Self>) -> Communicator {
        Communicator::from_wire(self)
    }
}

impl Wire for TcpWire {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn transmit(&self, dest: Rank, frame: Frame) -> CommResult<()> {
        if dest == self.rank {
            return self.mailbox.push(frame);
        }
        let link = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dest)
            .cloned()
            .ok_or(CommError::Unreachable(dest))?;
        let mut stream = link.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut stream, &frame)?;
        Ok(())
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn reaches(&self, dest: Rank) -> bool {
        dest == self.rank
            || self
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&dest)
    }
}

impl Drop for TcpWire {
    fn drop(&mut self) {
        let links = std::mem::take(self.links.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (peer, link) in links {
            let stream = link.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::trace!("Shutdown of link to rank {} failed: {}", peer, e);
            }
        }
        self.mailbox.close();

        let readers = std::mem::take(self.readers.get_mut().unwrap_or_else(PoisonError::into_inner));
        for handle in readers {
            let _ = handle.join();
        }
        tracing::debug!("Rank {} released its TCP wire", self.rank);
    }
}

fn spawn_reader(
    me: Rank,
    peer: Rank,
    mut stream: TcpStream,
    mailbox: Arc<Mailbox>,
) -> CommResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("dsm-link-{}-{}", me, peer))
        .spawn(move || loop {
            match read_frame(&mut stream) {
                Ok(mut frame) => {
                    if frame.source != peer {
                        tracing::warn!(
                            "Frame on link {}<-{} claims source {}",
                            me,
                            peer,
                            frame.source
                        );
                        frame.source = peer;
                    }
                    if mailbox.push(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Link {}<-{} closed: {}", me, peer, e);
                    break;
                }
            }
        })?;
    Ok(handle)
}

/// Accept one connection, polling when a deadline is set
pub(crate) fn accept_until(
    listener: &TcpListener,
    deadline: Option<Instant>,
) -> CommResult<TcpStream> {
    let Some(deadline) = deadline else {
        listener.set_nonblocking(false)?;
        let (stream, _) = listener.accept()?;
        return Ok(stream);
    };

    listener.set_nonblocking(true)?;
    let result = loop {
        match listener.accept() {
            Ok((stream, _)) => break Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() > deadline {
                    break Err(CommError::Timeout("incoming link".to_string()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => break Err(e.into()),
        }
    };
    listener.set_nonblocking(false)?;
    let stream = result?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Source, TagFilter};
    use crate::constants::tags;

    #[test]
    fn test_header_sizes() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), 24);
        assert_eq!(std::mem::size_of::<LinkHello>(), 16);
    }

    #[test]
    fn test_linked_pair_exchanges_frames() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            write_hello(&mut stream, 2, 1).unwrap();
            let wire = TcpWire::new(1, 2);
            wire.attach(0, stream).unwrap();
            let comm = wire.into_communicator();
            comm.send(0, tags::EXCHANGE, b"ping").unwrap();
            let env = comm.recv(Source::Rank(0), TagFilter::Any).unwrap();
            assert_eq!(env.payload, b"pong");
        });

        let mut stream = accept_until(&listener, None).unwrap();
        let hello = read_hello(&mut stream).unwrap();
        assert_eq!(hello.rank, 1);
        assert_eq!(hello.group_size, 2);
        let wire = TcpWire::new(0, 2);
        wire.attach(1, stream).unwrap();
        assert_eq!(wire.linked_peers(), 1);
        let comm = wire.into_communicator();

        let env = comm
            .recv(Source::Rank(1), TagFilter::Only(tags::EXCHANGE))
            .unwrap();
        assert_eq!(env.payload, b"ping");
        comm.send(1, tags::EXCHANGE, b"pong").unwrap();
        dialer.join().unwrap();
    }

    #[test]
    fn test_unlinked_peer_is_unreachable() {
        let comm = TcpWire::new(0, 3).into_communicator();
        assert!(!comm.reaches(2));
        assert!(matches!(
            comm.send(2, tags::DEFAULT, b"x"),
            Err(CommError::Unreachable(2))
        ));
        // self-sends never touch a socket
        comm.send(0, tags::DEFAULT, b"me").unwrap();
        assert!(comm.try_recv(Source::Rank(0), TagFilter::Any).unwrap().is_some());
    }

    #[test]
    fn test_accept_until_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(matches!(
            accept_until(&listener, Some(deadline)),
            Err(CommError::Timeout(_))
        ));
    }
}
