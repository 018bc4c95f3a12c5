use std::thread;
use std::time::Duration;

use zerocopy::IntoBytes;

use super::tables::{Release, Requester};
use super::{channel, BufferState, DsmBuffer, Role, Route};
use crate::comm::{ChannelKind, CommError, Communicator, Envelope, Rank, Source, Tag, TagFilter};
use crate::constants::{tags, trace_headers, SERVICE_IDLE_SLEEP_US, SERVICE_SPIN_LIMIT};
use crate::error::{DsmError, DsmResult};
use crate::protocol::{
    decode_ack, decode_name, decode_page_request, encode_ack, fail_ack, success_ack,
    CommandHeader, FileDescription, Opcode, ProtocolError,
};

/// Outcome of one service step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStep {
    /// A header was handled and the loop continues
    Serviced(Opcode),
    /// DONE was received or shutdown was requested
    Terminated,
}

impl DsmBuffer {
    /// Run the service loop until DONE
    ///
    /// Returns the opcode that ended the loop. A protocol error ends the loop
    /// and is returned to the caller.
    pub fn service_loop(&mut self) -> DsmResult<Opcode> {
        let rank = self.group.local_rank()?;
        tracing::info!("Rank {} entering service loop", rank);
        let mut serviced: u64 = 0;
        loop {
            match self.service_once()? {
                ServiceStep::Serviced(_) => serviced += 1,
                ServiceStep::Terminated => {
                    tracing::info!(
                        "Rank {} left service loop after {} commands",
                        rank,
                        serviced
                    );
                    return Ok(Opcode::Done);
                }
            }
        }
    }

    /// Receive one command header and dispatch it
    ///
    /// Blocks until a header arrives on either channel, or until the
    /// shutdown flag is raised.
    pub fn service_once(&mut self) -> DsmResult<ServiceStep> {
        match self.state {
            BufferState::Created | BufferState::Servicing => {}
            BufferState::Terminated => return Ok(ServiceStep::Terminated),
            other => {
                return Err(DsmError::InvalidState(format!(
                    "cannot service commands in state {:?}",
                    other
                )))
            }
        }
        if self.role != Role::Server {
            return Err(DsmError::InvalidState(format!(
                "{:?} ranks do not run the service loop",
                self.role
            )));
        }
        self.state = BufferState::Servicing;

        let Some((route, envelope)) = self.next_command()? else {
            tracing::info!("Shutdown requested, leaving service loop");
            self.state = BufferState::Terminated;
            return Ok(ServiceStep::Terminated);
        };

        match self.dispatch(route, envelope) {
            Ok(Opcode::Done) => {
                self.state = BufferState::Terminated;
                Ok(ServiceStep::Terminated)
            }
            Ok(opcode) => Ok(ServiceStep::Serviced(opcode)),
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!("Fatal error in service loop: {}", e);
                    self.state = BufferState::Terminated;
                }
                Err(e)
            }
        }
    }

    fn next_command(&self) -> DsmResult<Option<(Route, Envelope)>> {
        let local = self.group.local()?;
        let command = TagFilter::Only(tags::COMMAND);
        let mut idle = 0u32;
        loop {
            if let Some(envelope) = local.try_recv(Source::Any, command)? {
                return Ok(Some((Route::Local, envelope)));
            }
            if let Some(remote) = self.group.remote() {
                if let Some(envelope) = remote.try_recv(Source::Any, command)? {
                    return Ok(Some((Route::Remote, envelope)));
                }
            }
            if self.shutdown_requested() {
                return Ok(None);
            }

            if idle < SERVICE_SPIN_LIMIT {
                idle += 1;
                thread::yield_now();
            } else if let Some(envelope) = local.recv_timeout(
                Source::Any,
                command,
                Duration::from_micros(SERVICE_IDLE_SLEEP_US),
            )? {
                return Ok(Some((Route::Local, envelope)));
            }
        }
    }

    fn dispatch(&mut self, route: Route, envelope: Envelope) -> DsmResult<Opcode> {
        let header = CommandHeader::decode(&envelope.payload)?;
        let opcode = header.opcode()?;
        let who = envelope.source;
        if trace_headers() {
            tracing::info!(
                "{:?} from {} ({:?}): address {} length {}",
                opcode,
                who,
                route,
                header.address,
                header.length
            );
        } else {
            tracing::trace!("{:?} from {} ({:?})", opcode, who, route);
        }

        match opcode {
            Opcode::Put => self.handle_put(route, who, &header)?,
            Opcode::Get => self.handle_get(route, who, &header)?,
            Opcode::LockAcquire
            | Opcode::LockRelease
            | Opcode::SetNotify
            | Opcode::ClearNotify
            | Opcode::RegisterFile
            | Opcode::RequestPages
            | Opcode::RequestFile => self.handle_home_request(route, who, opcode, &header)?,
            Opcode::Accept => self.handle_accept(&header)?,
            Opcode::Disconnect => self.handle_disconnect(route, who)?,
            Opcode::Done => {}
        }
        Ok(opcode)
    }

    fn handle_put(&mut self, route: Route, who: Rank, header: &CommandHeader) -> DsmResult<()> {
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| DsmError::InvalidState("server without segment".to_string()))?;
        let (offset, length) = header.checked_range(segment.len())?;
        let comm = channel(&self.group, route)?;
        let data = recv_payload(comm, who, tags::PUT_DATA, length, "put payload")?;
        segment.write(offset as u64, &data)?;
        comm.send(who, tags::SERVER_ACK, &success_ack())?;
        Ok(())
    }

    fn handle_get(&mut self, route: Route, who: Rank, header: &CommandHeader) -> DsmResult<()> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| DsmError::InvalidState("server without segment".to_string()))?;
        let (offset, length) = header.checked_range(segment.len())?;
        let comm = channel(&self.group, route)?;
        comm.send(who, tags::GET_DATA, segment.read(offset as u64, length)?)?;
        Ok(())
    }

    /// Requests served by the start server: each carries one payload on the
    /// exchange tag. Other servers forward lock and notify requests.
    fn handle_home_request(
        &mut self,
        route: Route,
        who: Rank,
        opcode: Opcode,
        header: &CommandHeader,
    ) -> DsmResult<()> {
        let length = usize::try_from(header.length).map_err(|_| {
            ProtocolError::Malformed(format!("negative payload length {}", header.length))
        })?;
        let comm = channel(&self.group, route)?;
        let payload = recv_payload(comm, who, tags::EXCHANGE, length, "request payload")?;

        // address 0: the sender itself; otherwise a forwarded request on
        // behalf of `source` on the encoded route
        let requester = if header.address == 0 {
            Requester { route, rank: who }
        } else {
            let forwarded = Route::from_code(header.address).ok_or_else(|| {
                ProtocolError::Malformed(format!("unknown route code {}", header.address))
            })?;
            Requester {
                route: forwarded,
                rank: header.source_rank()?,
            }
        };

        if !self.is_start_server() {
            return self.forward_home(opcode, requester, &payload);
        }

        match opcode {
            Opcode::LockAcquire => {
                let name = decode_name(&payload)?;
                if self.locks.acquire(&name, requester) {
                    self.deliver(requester, &success_ack());
                } else {
                    tracing::debug!("Lock '{}' busy, queued {:?}", name, requester);
                }
            }
            Opcode::LockRelease => {
                let name = decode_name(&payload)?;
                match self.locks.release(&name, requester) {
                    Release::Freed | Release::StillHeld => {}
                    Release::HandedTo(next) => self.deliver(next, &success_ack()),
                    Release::NotHolder => {
                        tracing::warn!("{:?} released lock '{}' it does not hold", requester, name)
                    }
                }
            }
            Opcode::SetNotify => {
                let name = decode_name(&payload)?;
                self.notify.wait(&name, requester);
            }
            Opcode::ClearNotify => {
                if payload.len() < 4 {
                    return Err(ProtocolError::Truncated {
                        what: "notification",
                        expected: 4,
                        actual: payload.len(),
                    }
                    .into());
                }
                let code = decode_ack(&payload[..4])?;
                let name = decode_name(&payload[4..])?;
                for waiter in self.notify.release(&name) {
                    self.deliver(waiter, &encode_ack(code));
                }
            }
            Opcode::RegisterFile => {
                let desc = FileDescription::decode(&payload)?;
                if let Some(files) = self.files.as_mut() {
                    files.register(desc);
                }
                self.reply(requester, tags::SERVER_ACK, &success_ack())?;
            }
            Opcode::RequestPages => {
                let (size, name) = decode_page_request(&payload)?;
                let granted = match self.files.as_mut() {
                    Some(files) => files.request_pages(&name, size),
                    None => Err(DsmError::NoSpace("no file registry".to_string())),
                };
                self.reply_description(requester, granted)?;
            }
            Opcode::RequestFile => {
                let name = decode_name(&payload)?;
                let found = self
                    .files
                    .as_ref()
                    .and_then(|files| files.lookup(&name))
                    .cloned()
                    .ok_or_else(|| DsmError::NotFound(name));
                self.reply_description(requester, found)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn forward_home(&self, opcode: Opcode, requester: Requester, payload: &[u8]) -> DsmResult<()> {
        let home = self.map()?.start_server();
        let local = self.group.local()?;
        let header = CommandHeader::new(
            opcode,
            requester.rank,
            requester.route.code(),
            payload.len() as u64,
        )?;
        local.send(home, tags::COMMAND, header.as_bytes())?;
        local.send(home, tags::EXCHANGE, payload)?;
        tracing::debug!("Forwarded {:?} for {:?} to rank {}", opcode, requester, home);
        Ok(())
    }

    fn reply(&self, to: Requester, tag: i32, bytes: &[u8]) -> DsmResult<()> {
        channel(&self.group, to.route)?.send(to.rank, tag, bytes)?;
        Ok(())
    }

    /// Send an asynchronous grant or notification; a vanished client is
    /// only logged
    fn deliver(&self, to: Requester, bytes: &[u8]) {
        if let Err(e) = self.reply(to, tags::EXCHANGE, bytes) {
            tracing::warn!("Could not deliver to {:?}: {}", to, e);
        }
    }

    fn reply_description(
        &self,
        to: Requester,
        outcome: DsmResult<FileDescription>,
    ) -> DsmResult<()> {
        match outcome {
            Ok(desc) => {
                self.reply(to, tags::SERVER_ACK, &success_ack())?;
                self.reply(to, tags::EXCHANGE, &desc.encode())
            }
            Err(e) => {
                tracing::debug!("File request from {:?} failed: {}", to, e);
                self.reply(to, tags::SERVER_ACK, &fail_ack())
            }
        }
    }

    fn handle_accept(&mut self, header: &CommandHeader) -> DsmResult<()> {
        let count = usize::try_from(header.length).map_err(|_| {
            ProtocolError::Malformed(format!("negative peer count {}", header.length))
        })?;
        // departures still in flight from the previous peer group
        while self.group.kind() == ChannelKind::Connected {
            let remote = channel(&self.group, Route::Remote)?;
            let envelope = remote.recv(Source::Any, TagFilter::Only(tags::COMMAND))?;
            self.dispatch(Route::Remote, envelope)?;
        }
        self.admit_peers(count)
    }

    fn handle_disconnect(&mut self, route: Route, who: Rank) -> DsmResult<()> {
        if route != Route::Remote {
            tracing::warn!("DISCONNECT from local rank {} ignored", who);
            return Ok(());
        }
        self.departed += 1;
        tracing::debug!(
            "Peer {} left ({}/{})",
            who,
            self.departed,
            self.expected_peers
        );
        if self.departed < self.expected_peers {
            return Ok(());
        }

        self.group.disconnect();
        self.departed = 0;
        tracing::info!("All {} peers left the channel", self.expected_peers);
        if self.reaccept && self.is_start_server() && self.group.kind() == ChannelKind::Listening {
            let count = self.expected_peers;
            self.send_accept(count)?;
        }
        Ok(())
    }
}

/// Payload announced by a header; a length that disagrees with the header
/// is a protocol violation, which ends the loop
fn recv_payload(
    comm: &Communicator,
    who: Rank,
    tag: Tag,
    length: usize,
    what: &'static str,
) -> DsmResult<Vec<u8>> {
    match comm.recv_exact(who, tag, length) {
        Ok(data) => Ok(data),
        Err(CommError::LengthMismatch {
            expected, actual, ..
        }) if actual < expected => Err(ProtocolError::Truncated {
            what,
            expected,
            actual,
        }
        .into()),
        Err(CommError::LengthMismatch {
            expected, actual, ..
        }) => Err(ProtocolError::Malformed(format!(
            "{} of {} bytes, header announced {}",
            what, actual, expected
        ))
        .into()),
        Err(e) => Err(e.into()),
    }
}
