use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use crate::cyclic_buffer::RecvOutcome;
use crate::error::TunnelError;
use crate::framer::{ControlOp, Framer};
use crate::registry::{ClientRegistry, ClientState, client_id_from_token};
use crate::socket;

const LISTENER: Token = Token(0);
const TUNNEL: Token = Token(1);
const WAKE: Token = Token(usize::MAX);

/// Per-client inbound buffer size. Matches the reference implementation's
/// `BUFFER_SIZE`.
pub const CLIENT_BUFFER_SIZE: usize = 1024;
/// Large enough to hold one maximally-escaped frame built from a full
/// client buffer, plus the frame header overhead.
pub const FRAMER_CAPACITY: usize = 2 * CLIENT_BUFFER_SIZE + 3;

const CONNECT_WAIT: Duration = Duration::from_secs(5);

const EV_READABLE: u8 = 0b01;
const EV_ERROR: u8 = 0b10;

/// The single-threaded poll-based event loop that multiplexes accepted
/// client connections onto one upstream tunnel connection.
pub struct TunnelServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    tunnel: TcpStream,
    registry: ClientRegistry,
    framer: Framer,
    add_queue: VecDeque<u8>,
    ready_to_finalize: Vec<u8>,
    last_served_index: Option<usize>,
    send_count: usize,
    tunnel_writable_armed: bool,
    shutdown: Arc<AtomicBool>,
}

impl TunnelServer {
    /// Binds `listen_addr`, connects to `dest_addr`, and waits (bounded by
    /// `CONNECT_WAIT`) for that connection to establish before returning.
    /// `shutdown` is shared with the caller, which is expected to flip it
    /// from a signal handler; the returned `Waker` must be used by that
    /// same handler to interrupt a blocked `poll()`.
    pub fn new(listen_addr: SocketAddr, dest_addr: SocketAddr, shutdown: Arc<AtomicBool>) -> Result<(Self, Arc<Waker>), TunnelError> {
        let mut listener = socket::bind_listener(listen_addr).map_err(|source| TunnelError::Bind { addr: listen_addr, source })?;
        let mut tunnel = socket::connect(dest_addr).map_err(|source| TunnelError::Connect { addr: dest_addr, source })?;

        let poll = Poll::new().map_err(TunnelError::Io)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE).map_err(TunnelError::Io)?;
        poll.registry().register(&mut tunnel, TUNNEL, Interest::READABLE | Interest::WRITABLE).map_err(TunnelError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).map_err(TunnelError::Io)?);

        let mut events = Events::with_capacity(256);
        Self::wait_for_connect(&poll, &mut events, &tunnel)?;

        info!(%listen_addr, %dest_addr, "tunnel sender listening");

        let server = Self {
            poll,
            events,
            listener,
            tunnel,
            registry: ClientRegistry::new(),
            framer: Framer::new(FRAMER_CAPACITY),
            add_queue: VecDeque::new(),
            ready_to_finalize: Vec::new(),
            last_served_index: None,
            send_count: 0,
            tunnel_writable_armed: true,
            shutdown,
        };
        Ok((server, waker))
    }

    fn wait_for_connect(poll: &Poll, events: &mut Events, tunnel: &TcpStream) -> Result<(), TunnelError> {
        loop {
            poll.poll(events, Some(CONNECT_WAIT)).map_err(TunnelError::Io)?;
            if events.is_empty() {
                return Err(TunnelError::ConnectTimeout);
            }
            if events.iter().any(|e| e.token() == TUNNEL && e.is_writable()) {
                break;
            }
        }
        if let Some(err) = tunnel.take_error().map_err(TunnelError::Io)? {
            return Err(TunnelError::Connect { addr: tunnel.peer_addr().map_err(TunnelError::Io)?, source: err });
        }
        Ok(())
    }

    /// Runs the event loop until the shutdown flag is observed, then tears
    /// down every open socket before returning.
    pub fn run(&mut self) -> Result<(), TunnelError> {
        let result = self.run_inner();
        self.teardown();
        result
    }

    fn run_inner(&mut self) -> Result<(), TunnelError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TunnelError::Poll(e)),
            }

            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let mut accept_fired = false;
            let mut tunnel_readable = false;
            let mut tunnel_writable = false;
            let mut tunnel_error = false;
            let mut client_ready = [0u8; crate::registry::MAX_CLIENTS];

            for event in self.events.iter() {
                match event.token() {
                    LISTENER => accept_fired = true,
                    TUNNEL => {
                        tunnel_readable |= event.is_readable();
                        tunnel_writable |= event.is_writable();
                        tunnel_error |= event.is_error();
                    }
                    WAKE => {}
                    token => {
                        let id = client_id_from_token(token);
                        let mut flags = 0u8;
                        if event.is_readable() {
                            flags |= EV_READABLE;
                        }
                        if event.is_error() || event.is_read_closed() {
                            flags |= EV_ERROR;
                        }
                        client_ready[id as usize] |= flags;
                    }
                }
            }

            if tunnel_error {
                return Err(TunnelError::TunnelClosed);
            }

            if accept_fired {
                self.accept_all();
            }

            self.client_io_pass(&client_ready);

            self.fill_framer();

            if tunnel_writable {
                self.drain_framer()?;
            }
            if tunnel_readable && self.check_tunnel_alive()? {
                return Err(TunnelError::TunnelClosed);
            }

            self.update_tunnel_interest().map_err(TunnelError::Io)?;
            self.reap_removed();
        }
    }

    /// Drains every connection the listener has queued, not just one. Under
    /// edge-triggered `mio::Poll`, the `LISTENER` readiness event only fires
    /// on a fresh edge; if the backlog holds more than one completed
    /// handshake at that edge, stopping after the first `accept()` leaves
    /// the rest unaccepted with no further event ever arriving for them.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    if self.registry.is_full() {
                        warn!(%peer_addr, "registry full, refusing client");
                        continue;
                    }
                    match self.registry.add(self.poll.registry(), stream, CLIENT_BUFFER_SIZE) {
                        Some(id) => {
                            self.add_queue.push_back(id);
                            info!(id, %peer_addr, "client connected");
                        }
                        None => warn!(%peer_addr, "failed to register accepted client"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn client_io_pass(&mut self, client_ready: &[u8; crate::registry::MAX_CLIENTS]) {
        for idx in 0..self.registry.len() {
            let id = self.registry.id_at(idx);
            let flags = client_ready[id as usize];
            if flags == 0 {
                continue;
            }
            if flags & EV_ERROR != 0 {
                debug!(id, "client socket error or hangup");
                self.registry.disconnect(self.poll.registry(), id);
                continue;
            }
            if flags & EV_READABLE != 0 {
                let slot = self.registry.slot_mut(id).expect("id_at returns a live id");
                if slot.inbound.is_full() {
                    continue;
                }
                match slot.inbound.recv(&mut slot.stream) {
                    Ok(RecvOutcome::Disconnected) => {
                        debug!(id, "client disconnected");
                        self.registry.disconnect(self.poll.registry(), id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(id, error = %e, "client recv error");
                        self.registry.disconnect(self.poll.registry(), id);
                    }
                }
            }
        }
    }

    fn fill_framer(&mut self) {
        // Control: REMOVE for any disconnected client whose inbound buffer
        // has fully drained.
        for idx in 0..self.registry.len() {
            let id = self.registry.id_at(idx);
            let slot = self.registry.slot(id).expect("id_at returns a live id");
            if slot.state == ClientState::MarkedRemoved && slot.inbound.is_empty() {
                if !self.framer.emit_control(ControlOp::Remove, id) {
                    return;
                }
                self.pending_remove_push(id);
            }
        }

        // Control: ADD for every newly accepted client.
        while let Some(&id) = self.add_queue.front() {
            if !self.framer.emit_control(ControlOp::Add, id) {
                return;
            }
            self.add_queue.pop_front();
            if let Some(slot) = self.registry.slot_mut(id) {
                slot.state = ClientState::Live;
            }
        }

        // Round-robin data.
        loop {
            if self.send_count == 0 {
                match self.next_client_index() {
                    Some(idx) => self.last_served_index = Some(idx),
                    None => break,
                }
            }
            let Some(idx) = self.last_served_index else { break };
            let id = self.registry.id_at(idx);
            let slot = self.registry.slot_mut(id).expect("id_at returns a live id");

            slot.inbound.make_contiguous();
            if self.send_count == 0 {
                self.send_count = slot.inbound.len();
            }
            if self.send_count == 0 {
                break;
            }

            let available = slot.inbound.len().min(self.send_count);
            let data = &slot.inbound.readable_slice()[..available];
            let n = self.framer.encapsulate(data, id);
            slot.inbound.skip(n);
            self.send_count -= n;
            // Anything less than a full turn means the framer ring is the
            // limiting factor; stop rather than retry the same client
            // against a ring we already know can't take more right now.
            if n < available {
                break;
            }
        }
    }

    fn pending_remove_push(&mut self, id: u8) {
        self.ready_to_finalize.push(id);
    }

    fn next_client_index(&self) -> Option<usize> {
        let n = self.registry.len();
        if n == 0 {
            return None;
        }
        let start = self.last_served_index.map_or(0, |p| (p + 1) % n);
        (0..n).map(|k| (start + k) % n).find(|&i| {
            let id = self.registry.id_at(i);
            !self.registry.slot(id).expect("id_at returns a live id").inbound.is_empty()
        })
    }

    fn drain_framer(&mut self) -> Result<(), TunnelError> {
        use crate::cyclic_buffer::SendOutcome;
        match self.framer.send(&mut self.tunnel) {
            Ok(SendOutcome::Disconnected) => Err(TunnelError::TunnelClosed),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(TunnelError::Io(e)),
        }
    }

    /// Reads and discards anything the tunnel peer sends back (this side
    /// never decapsulates — see the module-level docs); returns `true` if
    /// the read indicates the peer has gone away.
    fn check_tunnel_alive(&mut self) -> Result<bool, TunnelError> {
        let mut scratch = [0u8; 4096];
        match self.tunnel.read(&mut scratch) {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(TunnelError::Io(e)),
        }
    }

    fn update_tunnel_interest(&mut self) -> io::Result<()> {
        let want_writable = !self.framer.is_empty();
        if want_writable != self.tunnel_writable_armed {
            let interest = if want_writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            self.poll.registry().reregister(&mut self.tunnel, TUNNEL, interest)?;
            self.tunnel_writable_armed = want_writable;
        }
        Ok(())
    }

    fn reap_removed(&mut self) {
        for id in self.ready_to_finalize.drain(..) {
            self.registry.remove(self.poll.registry(), id);
        }
    }

    fn teardown(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.framer.finish();
        let _ = self.drain_framer();
        let _ = self.poll.registry().deregister(&mut self.tunnel);
        let _ = self.tunnel.shutdown(std::net::Shutdown::Both);
        while self.registry.len() > 0 {
            let id = self.registry.id_at(self.registry.len() - 1);
            self.registry.remove(self.poll.registry(), id);
        }
        info!("tunnel sender shut down");
    }
}
