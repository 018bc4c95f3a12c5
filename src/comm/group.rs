//! Process group descriptor: a local group plus an optional peer channel.

use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};

use super::communicator::Wire;
use super::rendezvous::RendezvousFile;
use super::tcp::{accept_until, read_hello, write_hello, TcpWire};
use super::{CommError, CommResult, Communicator, Rank, Source, TagFilter};
use crate::constants::tags;

/// Coarse view of [`ChannelState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    None,
    Listening,
    Connected,
}

/// State of the remote (peer group) channel
pub enum ChannelState {
    /// No peer channel
    Unbound,
    /// Published and waiting for a peer group
    Listening { listener: TcpListener },
    /// Merged with a peer group
    ///
    /// `remote_rank`/`remote_size` are this process's rank and the total size
    /// of the merged group. The listener is kept by the accepting side so the
    /// channel can be re-entered after the peers leave.
    Connected {
        channel: Communicator,
        remote_rank: Rank,
        remote_size: usize,
        listener: Option<TcpListener>,
    },
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Unbound => write!(f, "Unbound"),
            ChannelState::Listening { listener } => {
                write!(f, "Listening({:?})", listener.local_addr().ok())
            }
            ChannelState::Connected {
                remote_rank,
                remote_size,
                ..
            } => write!(f, "Connected({}/{})", remote_rank, remote_size),
        }
    }
}

impl ChannelState {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelState::Unbound => ChannelKind::None,
            ChannelState::Listening { .. } => ChannelKind::Listening,
            ChannelState::Connected { .. } => ChannelKind::Connected,
        }
    }
}

/// Identity of this process within its local group and, once connected,
/// within the merged peer group
#[derive(Debug)]
pub struct ProcessGroup {
    local: Option<Communicator>,
    identity: Option<(Rank, usize)>,
    channel: ChannelState,
    rendezvous: RendezvousFile,
    bind_host: String,
    published: bool,
}

impl ProcessGroup {
    /// An unbound descriptor publishing to / reading from `rendezvous`
    pub fn new(rendezvous: RendezvousFile) -> Self {
        Self {
            local: None,
            identity: None,
            channel: ChannelState::Unbound,
            rendezvous,
            bind_host: "127.0.0.1".to_string(),
            published: false,
        }
    }

    /// Duplicate `handle` as the local group and initialize
    pub fn bind(handle: &Communicator, rendezvous: RendezvousFile) -> CommResult<Self> {
        let mut group = Self::new(rendezvous);
        group.duplicate_local(handle)?;
        group.init()?;
        Ok(group)
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Capture rank and size from the bound local group
    pub fn init(&mut self) -> CommResult<()> {
        let local = self.local.as_ref().ok_or(CommError::Unbound)?;
        self.identity = Some((local.rank(), local.size()));
        tracing::debug!("Process group initialized: rank {}/{}", local.rank(), local.size());
        Ok(())
    }

    /// Adopt a private duplicate of `handle` as the local group
    pub fn duplicate_local(&mut self, handle: &Communicator) -> CommResult<()> {
        let dup = handle.duplicate()?;
        self.local = Some(dup);
        self.identity = None;
        Ok(())
    }

    /// Adopt a private duplicate of `handle` as the connected peer channel
    pub fn duplicate_remote(&mut self, handle: &Communicator) -> CommResult<()> {
        let dup = handle.duplicate()?;
        let listener = self.take_listener();
        self.channel = ChannelState::Connected {
            remote_rank: dup.rank(),
            remote_size: dup.size(),
            channel: dup,
            listener,
        };
        Ok(())
    }

    pub fn local(&self) -> CommResult<&Communicator> {
        self.local.as_ref().ok_or(CommError::Unbound)
    }

    pub fn local_rank(&self) -> CommResult<Rank> {
        self.identity.map(|(r, _)| r).ok_or(CommError::Unbound)
    }

    pub fn local_size(&self) -> CommResult<usize> {
        self.identity.map(|(_, s)| s).ok_or(CommError::Unbound)
    }

    pub fn channel(&self) -> &ChannelState {
        &self.channel
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// The merged peer channel, when connected
    pub fn remote(&self) -> Option<&Communicator> {
        match &self.channel {
            ChannelState::Connected { channel, .. } => Some(channel),
            _ => None,
        }
    }

    pub fn remote_rank(&self) -> Option<Rank> {
        match &self.channel {
            ChannelState::Connected { remote_rank, .. } => Some(*remote_rank),
            _ => None,
        }
    }

    pub fn remote_size(&self) -> Option<usize> {
        match &self.channel {
            ChannelState::Connected { remote_size, .. } => Some(*remote_size),
            _ => None,
        }
    }

    pub fn rendezvous(&self) -> &RendezvousFile {
        &self.rendezvous
    }

    /// Bind a listener on every local rank and publish the address list
    ///
    /// Collective over the local group: rank 0 gathers every rank's address
    /// and writes the rendezvous file.
    pub fn open_channel(&mut self) -> CommResult<()> {
        if self.has_listener() {
            return Ok(());
        }
        let (rank, size) = self.identity.ok_or(CommError::Unbound)?;
        let local = self.local()?;

        let listener = TcpListener::bind((self.bind_host.as_str(), 0))?;
        let addr = listener.local_addr()?;

        if rank == 0 {
            let mut addresses = vec![addr];
            for peer in 1..size {
                let env = local.recv(Source::Rank(peer), TagFilter::Only(tags::EXCHANGE))?;
                let text = String::from_utf8(env.payload).map_err(|_| {
                    CommError::Rendezvous(format!("rank {} sent a non-UTF-8 address", peer))
                })?;
                let peer_addr: SocketAddr = text.parse().map_err(|_| {
                    CommError::Rendezvous(format!("rank {} sent bad address '{}'", peer, text))
                })?;
                addresses.push(peer_addr);
            }
            self.rendezvous.publish(&addresses)?;
            self.published = true;
        } else {
            local.send(0, tags::EXCHANGE, addr.to_string().as_bytes())?;
        }

        tracing::info!("Rank {} listening for peers on {}", rank, addr);
        self.channel = match std::mem::replace(&mut self.channel, ChannelState::Unbound) {
            ChannelState::Connected {
                channel,
                remote_rank,
                remote_size,
                ..
            } => ChannelState::Connected {
                channel,
                remote_rank,
                remote_size,
                listener: Some(listener),
            },
            _ => ChannelState::Listening { listener },
        };
        Ok(())
    }

    /// Stop listening and withdraw the rendezvous file
    pub fn close_channel(&mut self) -> CommResult<()> {
        self.channel = match std::mem::replace(&mut self.channel, ChannelState::Unbound) {
            ChannelState::Listening { .. } => ChannelState::Unbound,
            ChannelState::Connected {
                channel,
                remote_rank,
                remote_size,
                ..
            } => ChannelState::Connected {
                channel,
                remote_rank,
                remote_size,
                listener: None,
            },
            ChannelState::Unbound => ChannelState::Unbound,
        };
        if self.published {
            self.rendezvous.remove()?;
            self.published = false;
        }
        Ok(())
    }

    /// Admit `num_connections` processes of one peer group
    ///
    /// Peers take merged ranks `local_size + peer_rank`. Blocks until every
    /// expected peer has completed its hello.
    pub fn accept(&mut self, num_connections: usize) -> CommResult<()> {
        let (rank, size) = self.identity.ok_or(CommError::Unbound)?;
        let listener = match std::mem::replace(&mut self.channel, ChannelState::Unbound) {
            ChannelState::Listening { listener } => listener,
            other => {
                self.channel = other;
                return Err(CommError::NotListening);
            }
        };

        let merged_size = size + num_connections;
        let wire = TcpWire::new(rank, merged_size);
        let mut admitted = 0;
        while admitted < num_connections {
            let mut stream = match accept_until(&listener, None) {
                Ok(stream) => stream,
                Err(e) => {
                    self.channel = ChannelState::Listening { listener };
                    return Err(e);
                }
            };
            let admitted_peer = admit(&wire, &mut stream, size, num_connections)
                .and_then(|peer| wire.attach(peer, stream));
            match admitted_peer {
                Ok(()) => admitted += 1,
                Err(e) => tracing::warn!("Rank {} rejected an incoming link: {}", rank, e),
            }
        }

        tracing::info!(
            "Rank {} accepted {} peers (merged size {})",
            rank,
            num_connections,
            merged_size
        );
        self.channel = ChannelState::Connected {
            channel: wire.into_communicator(),
            remote_rank: rank,
            remote_size: merged_size,
            listener: Some(listener),
        };
        Ok(())
    }

    /// Join the group published at the rendezvous path
    ///
    /// Returns `Ok(false)` when nothing is published or a listed rank refuses
    /// the connection; callers poll. Every listed rank is dialed before any
    /// hello goes out, so a refused dial leaves no server counting a peer.
    pub fn connect(&mut self) -> CommResult<bool> {
        if self.kind() == ChannelKind::Connected {
            return Ok(true);
        }
        let (rank, size) = self.identity.ok_or(CommError::Unbound)?;

        let addresses = match self.rendezvous.read() {
            Ok(Some(addresses)) => addresses,
            Ok(None) => {
                tracing::debug!("No rendezvous at {:?}", self.rendezvous.path());
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!("Unreadable rendezvous: {}", e);
                return Ok(false);
            }
        };

        let server_size = addresses.len();
        let merged_rank = server_size + rank;
        let merged_size = server_size + size;
        let wire = TcpWire::new(merged_rank, merged_size);

        let mut streams = Vec::with_capacity(server_size);
        for (peer, addr) in addresses.iter().enumerate() {
            match TcpStream::connect(addr) {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    tracing::debug!("Rank {} at {} refused connection: {}", peer, addr, e);
                    return Ok(false);
                }
            }
        }
        for (peer, mut stream) in streams.into_iter().enumerate() {
            if let Err(e) = write_hello(&mut stream, size, rank) {
                tracing::warn!("Hello to listening rank {} failed: {}", peer, e);
                if peer == 0 {
                    return Ok(false);
                }
                // earlier ranks already admitted this process
                return Err(CommError::Unreachable(peer));
            }
            wire.attach(peer, stream)?;
        }

        tracing::info!(
            "Rank {} connected to {} listening ranks (merged rank {}/{})",
            rank,
            server_size,
            merged_rank,
            merged_size
        );
        let listener = self.take_listener();
        self.channel = ChannelState::Connected {
            channel: wire.into_communicator(),
            remote_rank: merged_rank,
            remote_size: merged_size,
            listener,
        };
        Ok(true)
    }

    /// Drop the peer channel; a kept listener returns the state to listening
    pub fn disconnect(&mut self) {
        self.channel = match std::mem::replace(&mut self.channel, ChannelState::Unbound) {
            ChannelState::Connected {
                listener: Some(listener),
                ..
            } => {
                tracing::info!("Peer channel dropped, listening again");
                ChannelState::Listening { listener }
            }
            ChannelState::Connected { listener: None, .. } => {
                tracing::info!("Peer channel dropped");
                ChannelState::Unbound
            }
            other => other,
        };
    }

    fn has_listener(&self) -> bool {
        matches!(
            self.channel,
            ChannelState::Listening { .. }
                | ChannelState::Connected {
                    listener: Some(_),
                    ..
                }
        )
    }

    fn take_listener(&mut self) -> Option<TcpListener> {
        match std::mem::replace(&mut self.channel, ChannelState::Unbound) {
            ChannelState::Listening { listener } => Some(listener),
            ChannelState::Connected { listener, .. } => listener,
            ChannelState::Unbound => None,
        }
    }
}

fn admit(
    wire: &TcpWire,
    stream: &mut TcpStream,
    local_size: usize,
    expected: usize,
) -> CommResult<Rank> {
    let hello = read_hello(stream)?;
    if hello.group_size as usize != expected || hello.rank as usize >= expected {
        return Err(CommError::Handshake(format!(
            "peer rank {} of group size {} does not match {} expected connections",
            hello.rank, hello.group_size, expected
        )));
    }
    let peer = local_size + hello.rank as usize;
    if wire.reaches(peer) {
        return Err(CommError::Handshake(format!("peer rank {} connected twice", peer)));
    }
    Ok(peer)
}
