use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::cyclic_buffer::CyclicBuffer;

/// One past the highest client ID; IDs occupy `0..MAX_CLIENTS`, leaving 255
/// free as the reserved CONTROL tag.
pub const MAX_CLIENTS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, registered, waiting for its ADD control frame to be sent.
    PendingAdd,
    /// ADD has been sent; the client is actively read from.
    Live,
    /// Locally disconnected; waiting for its inbound buffer to drain so the
    /// REMOVE control frame can be sent before the slot is reclaimed.
    MarkedRemoved,
}

pub struct ClientSlot {
    pub id: u8,
    pub stream: TcpStream,
    pub inbound: CyclicBuffer,
    pub state: ClientState,
}

pub fn client_token(id: u8) -> Token {
    Token(2 + id as usize)
}

pub fn client_id_from_token(token: Token) -> u8 {
    (token.0 - 2) as u8
}

/// Stable-ID to dense-index bimap. IDs survive removal of other clients;
/// the dense array compacts via swap-to-last so iteration stays O(client
/// count) and never touches a freed slot.
pub struct ClientRegistry {
    id_to_index: [Option<u8>; MAX_CLIENTS],
    index_to_id: [Option<u8>; MAX_CLIENTS],
    slots: Vec<ClientSlot>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self { id_to_index: [None; MAX_CLIENTS], index_to_id: [None; MAX_CLIENTS], slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == MAX_CLIENTS
    }

    fn next_id(&self) -> Option<u8> {
        (0..MAX_CLIENTS as u8).find(|&id| self.id_to_index[id as usize].is_none())
    }

    /// Registers a freshly accepted socket, assigning it the lowest free ID.
    /// Returns `None` (leaving the registry unchanged) if it is full or the
    /// socket could not be registered with the poller.
    pub fn add(&mut self, registry: &Registry, mut stream: TcpStream, buf_size: usize) -> Option<u8> {
        if self.is_full() {
            return None;
        }
        let id = self.next_id()?;
        registry.register(&mut stream, client_token(id), Interest::READABLE).ok()?;

        let index = self.slots.len();
        self.slots.push(ClientSlot {
            id,
            stream,
            inbound: CyclicBuffer::new(buf_size),
            state: ClientState::PendingAdd,
        });
        self.id_to_index[id as usize] = Some(index as u8);
        self.index_to_id[index] = Some(id);
        Some(id)
    }

    /// Closes `id`'s socket and deregisters it from the poller but keeps
    /// its slot and buffer around so the framer can still drain whatever
    /// inbound bytes it had already read. A no-op if `id` is unknown or
    /// already disconnected.
    pub fn disconnect(&mut self, registry: &Registry, id: u8) {
        let Some(index) = self.id_to_index[id as usize] else { return };
        let slot = &mut self.slots[index as usize];
        if slot.state == ClientState::MarkedRemoved {
            return;
        }
        let _ = registry.deregister(&mut slot.stream);
        let _ = slot.stream.shutdown(std::net::Shutdown::Both);
        slot.state = ClientState::MarkedRemoved;
    }

    /// Finalises removal: the socket must already be disconnected (or this
    /// will deregister/shutdown it now) and the slot is reclaimed via
    /// swap-to-last. A no-op if `id` is unknown.
    pub fn remove(&mut self, registry: &Registry, id: u8) {
        let Some(index) = self.id_to_index[id as usize] else { return };
        let index = index as usize;

        crate::safe_assert!(self.slots[index].id == id, "registry maps id {id} to index {index} holding id {}", self.slots[index].id);
        let mut removed = self.slots.swap_remove(index);
        let _ = registry.deregister(&mut removed.stream);
        let _ = removed.stream.shutdown(std::net::Shutdown::Both);

        self.id_to_index[id as usize] = None;
        let new_len = self.slots.len();
        if index < new_len {
            let moved_id = self.slots[index].id;
            self.index_to_id[index] = Some(moved_id);
            self.id_to_index[moved_id as usize] = Some(index as u8);
        }
        self.index_to_id[new_len] = None;
    }

    pub fn slot(&self, id: u8) -> Option<&ClientSlot> {
        let index = self.id_to_index[id as usize]?;
        Some(&self.slots[index as usize])
    }

    pub fn slot_mut(&mut self, id: u8) -> Option<&mut ClientSlot> {
        let index = self.id_to_index[id as usize]?;
        Some(&mut self.slots[index as usize])
    }

    /// The ID currently occupying dense slot `index`.
    pub fn id_at(&self, index: usize) -> u8 {
        self.index_to_id[index].expect("index within len() is always occupied")
    }

    pub fn dense_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().map(|s| s.id)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpListener as StdTcpListener;

    fn accept_pair(poll: &Poll) -> TcpStream {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let _ = poll;
        TcpStream::from_std(server_side)
    }

    #[test]
    fn add_assigns_lowest_free_id_and_is_bijective() {
        let poll = Poll::new().unwrap();
        let mut reg = ClientRegistry::new();

        let a = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        let b = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.id_at(0), 0);
        assert_eq!(reg.id_at(1), 1);
    }

    #[test]
    fn remove_swaps_last_into_vacated_slot() {
        let poll = Poll::new().unwrap();
        let mut reg = ClientRegistry::new();
        let a = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        let b = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        let c = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();

        reg.remove(poll.registry(), a);

        assert_eq!(reg.len(), 2);
        assert!(reg.slot(a).is_none());
        // c was the last slot, now occupies a's old dense index 0.
        assert_eq!(reg.id_at(0), c);
        assert_eq!(reg.id_at(1), b);
    }

    #[test]
    fn remove_is_idempotent_on_unknown_id() {
        let poll = Poll::new().unwrap();
        let mut reg = ClientRegistry::new();
        reg.remove(poll.registry(), 42);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn add_refuses_past_capacity() {
        let poll = Poll::new().unwrap();
        let mut reg = ClientRegistry::new();
        for _ in 0..MAX_CLIENTS {
            reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        }
        assert!(reg.is_full());
        assert!(reg.add(poll.registry(), accept_pair(&poll), 64).is_none());
        assert_eq!(reg.len(), MAX_CLIENTS);
    }

    #[test]
    fn id_released_on_remove_is_reused() {
        let poll = Poll::new().unwrap();
        let mut reg = ClientRegistry::new();
        let a = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        reg.remove(poll.registry(), a);
        let reused = reg.add(poll.registry(), accept_pair(&poll), 64).unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn events_capacity_smoke() {
        // Not exercising poll itself here, just confirms Events constructs.
        let _events = Events::with_capacity(8);
    }
}
