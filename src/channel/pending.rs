//! Connects parked until a channel with the requested name is created, and
//! create/connect requests whose endpoint is not stored yet.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};

use crate::identity::ProviderIdentity;

#[derive(Default)]
struct Waiters {
    next_id: u64,
    by_name: HashMap<String, Vec<(u64, oneshot::Sender<ProviderIdentity>)>>,
}

#[derive(Default)]
pub(crate) struct PendingConnects {
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingConnects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for `channel_name`. The waiter leaves the table when
    /// it is resolved or dropped.
    pub fn register(&self, channel_name: &str) -> PendingConnect {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = self.waiters.lock();
            waiters.next_id += 1;
            let id = waiters.next_id;
            waiters
                .by_name
                .entry(channel_name.to_string())
                .or_default()
                .push((id, tx));
            id
        };
        PendingConnect {
            id,
            channel_name: channel_name.to_string(),
            rx,
            table: Arc::downgrade(&self.waiters),
        }
    }

    /// Wake every waiter for the created channel's name. Returns how many
    /// were woken.
    pub fn resolve(&self, identity: &ProviderIdentity) -> usize {
        let waiters = self.waiters.lock().by_name.remove(&identity.channel_name);
        waiters
            .into_iter()
            .flatten()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(_, tx)| tx.send(identity.clone()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    #[cfg(test)]
    pub fn waiting(&self, channel_name: &str) -> usize {
        self.waiters
            .lock()
            .by_name
            .get(channel_name)
            .map_or(0, Vec::len)
    }
}

pub(crate) struct PendingConnect {
    id: u64,
    channel_name: String,
    rx: oneshot::Receiver<ProviderIdentity>,
    table: Weak<Mutex<Waiters>>,
}

impl PendingConnect {
    /// Wait for a matching channel. `None` if the table went away first.
    pub async fn wait(mut self) -> Option<ProviderIdentity> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut waiters = table.lock();
        if let Some(list) = waiters.by_name.get_mut(&self.channel_name) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                waiters.by_name.remove(&self.channel_name);
            }
        }
    }
}

#[derive(Default)]
struct Setups {
    next_id: u64,
    by_name: HashMap<String, Vec<(u64, watch::Receiver<()>)>>,
}

/// Create and connect requests in flight, keyed by channel name.
///
/// The runtime may push traffic for a channel as soon as it has replied,
/// before the caller has stored the new endpoint. Such pushes wait here.
#[derive(Default)]
pub(crate) struct PendingSetups {
    setups: Arc<Mutex<Setups>>,
}

impl PendingSetups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a request for `channel_name` in flight until the guard drops.
    pub fn begin(&self, channel_name: &str) -> PendingSetup {
        let (done, rx) = watch::channel(());
        let id = {
            let mut setups = self.setups.lock();
            setups.next_id += 1;
            let id = setups.next_id;
            setups
                .by_name
                .entry(channel_name.to_string())
                .or_default()
                .push((id, rx));
            id
        };
        PendingSetup {
            id,
            channel_name: channel_name.to_string(),
            table: Arc::downgrade(&self.setups),
            _done: done,
        }
    }

    /// Wait for every request in flight for `channel_name`. Returns false
    /// when there was nothing to wait for.
    pub async fn settled(&self, channel_name: &str) -> bool {
        let receivers: Vec<watch::Receiver<()>> = self
            .setups
            .lock()
            .by_name
            .get(channel_name)
            .map(|list| list.iter().map(|(_, rx)| rx.clone()).collect())
            .unwrap_or_default();
        if receivers.is_empty() {
            return false;
        }
        for mut rx in receivers {
            // the sender never sends; changed() fails once the guard is gone
            while rx.changed().await.is_ok() {}
        }
        true
    }

    #[cfg(test)]
    pub fn in_flight(&self, channel_name: &str) -> usize {
        self.setups
            .lock()
            .by_name
            .get(channel_name)
            .map_or(0, Vec::len)
    }
}

pub(crate) struct PendingSetup {
    id: u64,
    channel_name: String,
    table: Weak<Mutex<Setups>>,
    _done: watch::Sender<()>,
}

impl Drop for PendingSetup {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut setups = table.lock();
        if let Some(list) = setups.by_name.get_mut(&self.channel_name) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                setups.by_name.remove(&self.channel_name);
            }
        }
    }
}
