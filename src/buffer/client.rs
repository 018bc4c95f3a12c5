use std::ops::Range;

use zerocopy::IntoBytes;

use super::{channel, BufferState, DsmBuffer, Role, Route};
use crate::comm::{Communicator, Rank, Source, TagFilter};
use crate::constants::{tags, MAX_NAME_LENGTH, STATUS_SUCCESS};
use crate::error::{DsmError, DsmResult};
use crate::layout::AddressMap;
use crate::protocol::{
    decode_ack, decode_info, encode_ack, encode_info, encode_page_request, CommandHeader,
    FileDescription, InfoMsg, MixedExtentWire, Opcode, ProtocolError,
};

/// A sub-request that touches a single server rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub rank: Rank,
    /// Offset in the owner's segment
    pub offset: u64,
    /// Bytes of the caller's buffer covered by this piece
    pub span: Range<usize>,
}

/// Split `[address, address + length)` into single-owner pieces, in address
/// order
///
/// Adjacent runs that continue contiguously on the same rank are merged.
pub fn split_range(map: &AddressMap, address: u64, length: usize) -> DsmResult<Vec<Piece>> {
    let total = map.total_length();
    let end = address
        .checked_add(length as u64)
        .filter(|end| *end <= total)
        .ok_or(DsmError::OutOfRange {
            address,
            length: length as u64,
            total,
        })?;

    let mut pieces: Vec<Piece> = Vec::new();
    let mut pos = address;
    while pos < end {
        let extent = map.locate(pos).ok_or(DsmError::OutOfRange {
            address,
            length: length as u64,
            total,
        })?;
        let stop = extent.end.min(end);
        let span = (pos - address) as usize..(stop - address) as usize;

        match pieces.last_mut() {
            Some(last)
                if last.rank == extent.rank
                    && last.offset + last.span.len() as u64 == extent.offset =>
            {
                last.span.end = span.end;
            }
            _ => pieces.push(Piece {
                rank: extent.rank,
                offset: extent.offset,
                span,
            }),
        }
        pos = stop;
    }
    Ok(pieces)
}

/// Translate a file-relative range through a page list into global runs
fn paged_runs(
    map: &AddressMap,
    pages: &[u32],
    offset: u64,
    length: usize,
) -> DsmResult<Vec<(u64, Range<usize>)>> {
    let block = map.block_length();
    if block == 0 {
        return Err(DsmError::InvalidState(
            "paged access needs a block layout".to_string(),
        ));
    }
    let capacity = pages.len() as u64 * block;
    if offset + length as u64 > capacity {
        return Err(DsmError::OutOfRange {
            address: offset,
            length: length as u64,
            total: capacity,
        });
    }

    let mut runs: Vec<(u64, Range<usize>)> = Vec::new();
    let mut done = 0usize;
    while done < length {
        let file_pos = offset + done as u64;
        let page = pages[(file_pos / block) as usize];
        let within = file_pos % block;
        let take = ((block - within) as usize).min(length - done);
        let global = map.page_address(page) + within;

        match runs.last_mut() {
            Some((start, span)) if *start + span.len() as u64 == global => {
                span.end += take;
            }
            _ => runs.push((global, done..done + take)),
        }
        done += take;
    }
    Ok(runs)
}

fn check_name(name: &str) -> DsmResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(DsmError::InvalidState(format!(
            "names must be 1..={} bytes, got {}",
            MAX_NAME_LENGTH,
            name.len()
        )));
    }
    Ok(())
}

fn expect_success(comm: &Communicator, from: Rank, what: &str) -> DsmResult<()> {
    let status = decode_ack(&comm.recv_exact(from, tags::SERVER_ACK, 4)?)?;
    if status != STATUS_SUCCESS {
        return Err(ProtocolError::Malformed(format!(
            "rank {} answered {} with status {}",
            from, what, status
        ))
        .into());
    }
    Ok(())
}

impl DsmBuffer {
    fn client_channel(&mut self) -> DsmResult<&Communicator> {
        match self.state {
            BufferState::Created | BufferState::Idle | BufferState::Servicing => {}
            other => {
                return Err(DsmError::InvalidState(format!(
                    "no requests can be issued in state {:?}",
                    other
                )))
            }
        }
        if self.state == BufferState::Created && self.role != Role::Server {
            self.state = BufferState::Idle;
        }
        let route = self.client_route();
        channel(&self.group, route)
    }

    /// Write `data` at global `address`
    ///
    /// Returns once every owning server has acknowledged its piece.
    pub fn put(&mut self, address: u64, data: &[u8]) -> DsmResult<()> {
        let pieces = split_range(self.map()?, address, data.len())?;
        tracing::debug!(
            "Put [{}, {}) in {} pieces",
            address,
            address + data.len() as u64,
            pieces.len()
        );

        let own = self.own_server_rank();
        let (local, remote): (Vec<Piece>, Vec<Piece>) =
            pieces.into_iter().partition(|p| Some(p.rank) == own);
        if let Some(segment) = self.segment.as_mut() {
            for piece in &local {
                segment.write(piece.offset, &data[piece.span.clone()])?;
            }
        }

        let comm = self.client_channel()?;
        for piece in &remote {
            let header = CommandHeader::new(
                Opcode::Put,
                comm.rank(),
                piece.offset,
                piece.span.len() as u64,
            )?;
            comm.send(piece.rank, tags::COMMAND, header.as_bytes())?;
            comm.send(piece.rank, tags::PUT_DATA, &data[piece.span.clone()])?;
        }
        for piece in &remote {
            expect_success(comm, piece.rank, "put")?;
        }
        Ok(())
    }

    /// Read `out.len()` bytes at global `address`
    pub fn get(&mut self, address: u64, out: &mut [u8]) -> DsmResult<()> {
        let pieces = split_range(self.map()?, address, out.len())?;
        tracing::debug!(
            "Get [{}, {}) in {} pieces",
            address,
            address + out.len() as u64,
            pieces.len()
        );

        let own = self.own_server_rank();
        let (local, remote): (Vec<Piece>, Vec<Piece>) =
            pieces.into_iter().partition(|p| Some(p.rank) == own);
        if let Some(segment) = self.segment.as_ref() {
            for piece in &local {
                out[piece.span.clone()]
                    .copy_from_slice(segment.read(piece.offset, piece.span.len())?);
            }
        }

        let comm = self.client_channel()?;
        for piece in &remote {
            let header = CommandHeader::new(
                Opcode::Get,
                comm.rank(),
                piece.offset,
                piece.span.len() as u64,
            )?;
            comm.send(piece.rank, tags::COMMAND, header.as_bytes())?;
        }
        for piece in &remote {
            let payload = comm.recv_exact(piece.rank, tags::GET_DATA, piece.span.len())?;
            out[piece.span.clone()].copy_from_slice(&payload);
        }
        Ok(())
    }

    /// Write `data` at file-relative `offset` of a paged file
    pub fn put_pages(&mut self, pages: &[u32], offset: u64, data: &[u8]) -> DsmResult<()> {
        for (address, span) in paged_runs(self.map()?, pages, offset, data.len())? {
            self.put(address, &data[span])?;
        }
        Ok(())
    }

    /// Read into `out` from file-relative `offset` of a paged file
    pub fn get_pages(&mut self, pages: &[u32], offset: u64, out: &mut [u8]) -> DsmResult<()> {
        for (address, span) in paged_runs(self.map()?, pages, offset, out.len())? {
            self.get(address, &mut out[span])?;
        }
        Ok(())
    }

    /// Send a request and its payload to the start server
    fn send_home(&mut self, opcode: Opcode, payload: &[u8]) -> DsmResult<(Rank, &Communicator)> {
        if self.role == Role::Server {
            return Err(DsmError::InvalidState(format!(
                "server ranks cannot issue {:?} requests",
                opcode
            )));
        }
        let home = self.map()?.start_server();
        let comm = self.client_channel()?;
        let header = CommandHeader::new(opcode, comm.rank(), 0, payload.len() as u64)?;
        comm.send(home, tags::COMMAND, header.as_bytes())?;
        comm.send(home, tags::EXCHANGE, payload)?;
        Ok((home, comm))
    }

    /// Block until the named lock is granted to this rank
    pub fn lock(&mut self, name: &str) -> DsmResult<()> {
        check_name(name)?;
        let (home, comm) = self.send_home(Opcode::LockAcquire, name.as_bytes())?;
        let grant = decode_ack(&comm.recv_exact(home, tags::EXCHANGE, 4)?)?;
        if grant != STATUS_SUCCESS {
            return Err(ProtocolError::Malformed(format!(
                "lock '{}' answered with {}",
                name, grant
            ))
            .into());
        }
        tracing::debug!("Acquired lock '{}'", name);
        Ok(())
    }

    pub fn unlock(&mut self, name: &str) -> DsmResult<()> {
        check_name(name)?;
        self.send_home(Opcode::LockRelease, name.as_bytes())?;
        tracing::debug!("Released lock '{}'", name);
        Ok(())
    }

    /// Block until someone calls [`DsmBuffer::wait_release`] on `name`;
    /// returns the delivered code
    pub fn wait_on(&mut self, name: &str) -> DsmResult<i32> {
        check_name(name)?;
        let (home, comm) = self.send_home(Opcode::SetNotify, name.as_bytes())?;
        let code = decode_ack(&comm.recv_exact(home, tags::EXCHANGE, 4)?)?;
        Ok(code)
    }

    /// Wake every rank waiting on `name` with `code`
    pub fn wait_release(&mut self, name: &str, code: i32) -> DsmResult<()> {
        check_name(name)?;
        let mut payload = encode_ack(code).to_vec();
        payload.extend_from_slice(name.as_bytes());
        self.send_home(Opcode::ClearNotify, &payload)?;
        Ok(())
    }

    /// Store `desc` in the start server's registry
    pub fn register_file(&mut self, desc: &FileDescription) -> DsmResult<()> {
        check_name(&desc.name)?;
        let (home, comm) = self.send_home(Opcode::RegisterFile, &desc.encode())?;
        expect_success(comm, home, "register file")
    }

    /// Grow (or create) `name` by `size` bytes
    pub fn request_pages(&mut self, name: &str, size: u64) -> DsmResult<FileDescription> {
        check_name(name)?;
        let (home, comm) = self.send_home(Opcode::RequestPages, &encode_page_request(size, name))?;
        let status = decode_ack(&comm.recv_exact(home, tags::SERVER_ACK, 4)?)?;
        if status != STATUS_SUCCESS {
            return Err(DsmError::NoSpace(format!(
                "no room for {} more bytes of '{}'",
                size, name
            )));
        }
        let reply = comm.recv(Source::Rank(home), TagFilter::Only(tags::EXCHANGE))?;
        Ok(FileDescription::decode(&reply.payload)?)
    }

    /// Fetch the description of `name`
    pub fn request_file(&mut self, name: &str) -> DsmResult<FileDescription> {
        check_name(name)?;
        let (home, comm) = self.send_home(Opcode::RequestFile, name.as_bytes())?;
        let status = decode_ack(&comm.recv_exact(home, tags::SERVER_ACK, 4)?)?;
        if status != STATUS_SUCCESS {
            return Err(DsmError::NotFound(format!("file '{}'", name)));
        }
        let reply = comm.recv(Source::Rank(home), TagFilter::Only(tags::EXCHANGE))?;
        Ok(FileDescription::decode(&reply.payload)?)
    }

    /// Send a bare control header to every server rank except this one
    fn broadcast_control(&mut self, opcode: Opcode, length: u64) -> DsmResult<Vec<Rank>> {
        let map = self.map()?;
        let mut servers: Vec<Rank> = map.servers().collect();
        let start = map.start_server();
        // the start server hears last, so its departure count completes last
        servers.sort_by_key(|r| *r == start);
        let own = self.own_server_rank();
        let route = self.client_route();
        let comm = channel(&self.group, route)?;

        let mut reached = Vec::new();
        for server in servers.into_iter().filter(|s| Some(*s) != own) {
            let header = CommandHeader::new(opcode, comm.rank(), 0, length)?;
            comm.send(server, tags::COMMAND, header.as_bytes())?;
            reached.push(server);
        }
        Ok(reached)
    }

    /// Terminate the service loop of every other server rank
    pub fn send_done(&mut self) -> DsmResult<()> {
        let reached = self.broadcast_control(Opcode::Done, 0)?;
        tracing::info!("Sent DONE to servers {:?}", reached);
        Ok(())
    }

    /// Leave the merged channel, telling every server first
    pub fn send_disconnect(&mut self) -> DsmResult<()> {
        if self.role != Role::Remote {
            return Err(DsmError::InvalidState(
                "only attached clients disconnect".to_string(),
            ));
        }
        self.broadcast_control(Opcode::Disconnect, 0)?;
        self.group.disconnect();
        self.state = BufferState::Disconnected;
        Ok(())
    }

    /// Drop the merged channel after the servers were told to stop
    pub fn detach(&mut self) {
        self.group.disconnect();
        self.state = BufferState::Disconnected;
    }

    /// Admit `num_connections` peer processes on every server
    ///
    /// Called by the start server outside the service loop. The other
    /// servers receive ACCEPT in their loops; the start server then
    /// describes the layout to every admitted peer.
    pub fn send_accept(&mut self, num_connections: usize) -> DsmResult<()> {
        if self.role != Role::Server {
            return Err(DsmError::InvalidState(
                "only servers accept peers".to_string(),
            ));
        }
        let reached = self.broadcast_control(Opcode::Accept, num_connections as u64)?;
        tracing::info!(
            "Accepting {} peers (also signalled servers {:?})",
            num_connections,
            reached
        );
        self.admit_peers(num_connections)
    }

    pub(crate) fn admit_peers(&mut self, num_connections: usize) -> DsmResult<()> {
        self.group.accept(num_connections)?;
        self.expected_peers = num_connections;
        self.departed = 0;
        if self.is_start_server() {
            self.send_info(Route::Remote)?;
        }
        Ok(())
    }

    /// Describe the layout to the clients on `route`
    ///
    /// Local route: every worker of the group. Remote route: every peer of
    /// the merged channel.
    pub fn send_info(&self, route: Route) -> DsmResult<()> {
        let map = self.map()?;
        let (info, table) = map.to_info();
        let bytes = encode_info(&info, &table);
        let comm = channel(&self.group, route)?;

        let recipients: Vec<Rank> = match route {
            Route::Local => (0..comm.size()).filter(|r| !map.is_server(*r)).collect(),
            Route::Remote => {
                let local_size = self.group.local_size()?;
                (local_size..comm.size()).collect()
            }
        };
        for rank in &recipients {
            comm.send(*rank, tags::EXCHANGE, &bytes)?;
        }
        tracing::debug!("Sent layout info to {:?} on {:?}", recipients, route);
        Ok(())
    }

    /// Receive the layout description sent by the start server
    pub fn receive_info(&self, route: Route) -> DsmResult<(InfoMsg, Vec<MixedExtentWire>)> {
        let comm = channel(&self.group, route)?;
        let envelope = comm.recv(Source::Any, TagFilter::Only(tags::EXCHANGE))?;
        Ok(decode_info(&envelope.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutSpec, MixedExtent};
    use proptest::prelude::*;

    #[test]
    fn test_split_across_uniform_boundary() {
        let map = LayoutSpec::uniform(1024).build(4).unwrap();
        let pieces = split_range(&map, 1500, 100).unwrap();
        assert_eq!(
            pieces,
            vec![
                Piece {
                    rank: 1,
                    offset: 476,
                    span: 0..48
                },
                Piece {
                    rank: 2,
                    offset: 0,
                    span: 48..100
                },
            ]
        );
    }

    #[test]
    fn test_split_ending_on_boundary_stays_on_one_rank() {
        let map = LayoutSpec::uniform(1024).build(4).unwrap();
        let pieces = split_range(&map, 1000, 24).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].rank, 0);
        assert!(split_range(&map, 4000, 96).is_ok());
        assert!(matches!(
            split_range(&map, 4000, 97),
            Err(DsmError::OutOfRange { .. })
        ));
        assert!(split_range(&map, 4096, 0).unwrap().is_empty());
    }

    #[test]
    fn test_split_merges_contiguous_local_runs() {
        // a single server: every page continues the previous one locally
        let map = LayoutSpec::block_cyclic(4 * 64, 64).build(1).unwrap();
        let pieces = split_range(&map, 10, 200).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].span, 0..200);
    }

    #[test]
    fn test_paged_runs_follow_page_list() {
        let map = LayoutSpec::block_cyclic(4 * 16, 16).build(2).unwrap();
        let runs = paged_runs(&map, &[5, 6, 1], 10, 30).unwrap();
        assert_eq!(runs, vec![(5 * 16 + 10, 0..22), (16, 22..30)]);
        assert!(paged_runs(&map, &[5], 10, 10).is_err());
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("f").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    fn maps() -> Vec<AddressMap> {
        vec![
            LayoutSpec::uniform(97).build(3).unwrap(),
            LayoutSpec::block_cyclic(128, 16).build(3).unwrap(),
            LayoutSpec::block_random(128, 16, 3).build(3).unwrap(),
            LayoutSpec::mixed(vec![
                MixedExtent { rank: 1, length: 90 },
                MixedExtent { rank: 0, length: 20 },
                MixedExtent { rank: 2, length: 33 },
                MixedExtent { rank: 1, length: 7 },
            ])
            .build(3)
            .unwrap(),
        ]
    }

    proptest! {
        /// Pieces tile the request in order, each stays inside one owner's
        /// run and maps every byte where the address map says it lives.
        #[test]
        fn prop_split_reconstructs_request(which in 0usize..4, start in 0u64..150, len in 0usize..150) {
            let map = &maps()[which];
            let total = map.total_length();
            prop_assume!(start + len as u64 <= total);

            let pieces = split_range(map, start, len).unwrap();
            let mut cursor = 0usize;
            for piece in &pieces {
                prop_assert_eq!(piece.span.start, cursor);
                prop_assert!(!piece.span.is_empty());
                for (i, byte) in piece.span.clone().enumerate() {
                    let extent = map.locate(start + byte as u64).unwrap();
                    prop_assert_eq!(extent.rank, piece.rank);
                    prop_assert_eq!(extent.offset, piece.offset + i as u64);
                }
                cursor = piece.span.end;
            }
            prop_assert_eq!(cursor, len);
        }
    }
}
