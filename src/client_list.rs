use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::client::Client;
use crate::identity::Identity;

pub type SharedClient = Arc<Mutex<Client>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientListEvent {
    Connected(Identity),
    Disconnected(Identity),
}

impl ClientListEvent {
    pub fn identity(&self) -> Identity {
        match self {
            Self::Connected(identity) | Self::Disconnected(identity) => *identity,
        }
    }
}

#[derive(Default)]
struct Inner {
    clients: HashMap<Identity, SharedClient>,
    events: VecDeque<ClientListEvent>,
    events_enabled: bool,
}

/// Registry of connected peers.
///
/// The list has its own re-entrant lock: every method may be called while the same
/// thread holds a [`ClientListGuard`], which is the only way to iterate. Lock order is
/// list first, then client.
///
/// When events are enabled, every add and remove is recorded until the caller drains
/// the log with [`ClientList::take_events`] or [`ClientList::clear_events`].
pub struct ClientList {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl Default for ClientList {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientList {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                events_enabled: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.events_enabled = enabled;
        if !enabled {
            inner.events.clear();
        }
    }

    pub fn add(&self, client: Client) -> SharedClient {
        let identity = client.identity();
        let shared = Arc::new(Mutex::new(client));
        self.add_shared(identity, shared.clone());
        shared
    }

    pub fn add_shared(&self, identity: Identity, client: SharedClient) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.clients.insert(identity, client).is_some() {
            log::debug!("client {} replaced in list", identity);
        } else if inner.events_enabled {
            inner.events.push_back(ClientListEvent::Connected(identity));
        }
    }

    pub fn remove(&self, identity: &Identity) -> Option<SharedClient> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let removed = inner.clients.remove(identity);
        if removed.is_some() && inner.events_enabled {
            inner.events.push_back(ClientListEvent::Disconnected(*identity));
        }
        removed
    }

    pub fn clear(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let identities = inner.clients.drain().map(|(id, _)| id).collect::<Vec<_>>();
        if inner.events_enabled {
            inner
                .events
                .extend(identities.into_iter().map(ClientListEvent::Disconnected));
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<SharedClient> {
        self.inner.lock().borrow().clients.get(identity).cloned()
    }
    pub fn contains(&self, identity: &Identity) -> bool {
        self.inner.lock().borrow().clients.contains_key(identity)
    }
    pub fn len(&self) -> usize {
        self.inner.lock().borrow().clients.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_events(&self) -> Vec<ClientListEvent> {
        self.inner.lock().borrow_mut().events.drain(..).collect()
    }
    pub fn clear_events(&self) {
        self.inner.lock().borrow_mut().events.clear();
    }

    /// Locks the list for iteration.
    pub fn lock(&self) -> ClientListGuard<'_> {
        ClientListGuard {
            guard: self.inner.lock(),
        }
    }
}

/// Scoped lock over a [`ClientList`]. The list can't change while it is alive.
pub struct ClientListGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<Inner>>,
}

impl ClientListGuard<'_> {
    pub fn len(&self) -> usize {
        self.guard.borrow().clients.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn contains(&self, identity: &Identity) -> bool {
        self.guard.borrow().clients.contains_key(identity)
    }
    pub fn get(&self, identity: &Identity) -> Option<SharedClient> {
        self.guard.borrow().clients.get(identity).cloned()
    }
    pub fn identities(&self) -> Vec<Identity> {
        self.guard.borrow().clients.keys().copied().collect()
    }
    pub fn clients(&self) -> Vec<(Identity, SharedClient)> {
        self.guard
            .borrow()
            .clients
            .iter()
            .map(|(identity, client)| (*identity, client.clone()))
            .collect()
    }
    /// Pending events, left in place for the other consumers.
    pub fn events(&self) -> Vec<ClientListEvent> {
        self.guard.borrow().events.iter().copied().collect()
    }
    pub fn for_each(&self, mut f: impl FnMut(Identity, &SharedClient)) {
        for (identity, client) in self.clients() {
            f(identity, &client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use std::net::Ipv4Addr;

    fn client(port: u16) -> Client {
        Client::new(
            Identity::new(Ipv4Addr::LOCALHOST, port),
            &NetConfig::default(),
            0.0,
        )
    }

    #[test]
    fn events_are_logged_until_drained() {
        let list = ClientList::new();
        list.add(client(1));
        list.add(client(2));
        let one = Identity::new(Ipv4Addr::LOCALHOST, 1);
        assert!(list.remove(&one).is_some());
        assert!(list.remove(&one).is_none());

        let events = list.take_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], ClientListEvent::Disconnected(one));
        assert!(list.take_events().is_empty());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn disabled_events() {
        let list = ClientList::new();
        list.set_events_enabled(false);
        list.add(client(1));
        assert!(list.take_events().is_empty());
    }

    #[test]
    fn guard_is_reentrant() {
        let list = ClientList::new();
        list.add(client(1));
        let guard = list.lock();
        // same thread may keep using the list while iterating
        guard.for_each(|identity, _| {
            list.add(client(identity.port + 1));
        });
        assert_eq!(guard.len(), 2);
        assert_eq!(guard.events().len(), 2);
        drop(guard);
        assert_eq!(list.len(), 2);
    }
}
