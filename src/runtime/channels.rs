//! Runtime-side bookkeeping of which connection provides or joined which
//! channel.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::identity::{Identity, ProviderIdentity};

pub(crate) type ConnectionId = u64;

#[derive(Debug, Clone)]
pub(crate) struct ChannelRecord {
    pub identity: ProviderIdentity,
    pub provider: ConnectionId,
    pub clients: Vec<(ConnectionId, Identity)>,
}

impl ChannelRecord {
    pub fn client_connection(&self, client: &Identity) -> Option<ConnectionId> {
        self.clients
            .iter()
            .find(|(_, identity)| identity == client)
            .map(|(conn, _)| *conn)
    }

    pub fn has_client(&self, conn: ConnectionId) -> bool {
        self.clients.iter().any(|(c, _)| *c == conn)
    }
}

/// A client membership that ended.
#[derive(Debug, Clone)]
pub(crate) struct Departure {
    pub channel: ProviderIdentity,
    pub provider: ConnectionId,
    pub client: Identity,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    by_name: BTreeMap<String, ChannelRecord>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel under a fresh id. One provider per name.
    pub fn create(
        &mut self,
        channel_name: &str,
        provider: ConnectionId,
        owner: &Identity,
    ) -> Result<ProviderIdentity, RuntimeError> {
        if channel_name.is_empty() {
            return Err(RuntimeError::MissingChannelName);
        }
        if self.by_name.contains_key(channel_name) {
            return Err(RuntimeError::ChannelExists(channel_name.to_string()));
        }
        let identity = ProviderIdentity {
            channel_id: Uuid::new_v4().to_string(),
            channel_name: channel_name.to_string(),
            uuid: owner.uuid.clone(),
            name: owner.name.clone(),
        };
        self.by_name.insert(
            channel_name.to_string(),
            ChannelRecord {
                identity: identity.clone(),
                provider,
                clients: Vec::new(),
            },
        );
        Ok(identity)
    }

    pub fn all(&self) -> Vec<ProviderIdentity> {
        self.by_name.values().map(|r| r.identity.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn by_name(&self, channel_name: &str) -> Option<&ChannelRecord> {
        self.by_name.get(channel_name)
    }

    pub fn by_id(&self, channel_id: &str) -> Option<&ChannelRecord> {
        self.by_name
            .values()
            .find(|r| r.identity.channel_id == channel_id)
    }

    /// Record a client membership. Returns false if the channel is gone.
    pub fn add_client(&mut self, channel_id: &str, conn: ConnectionId, client: &Identity) -> bool {
        let Some(record) = self
            .by_name
            .values_mut()
            .find(|r| r.identity.channel_id == channel_id)
        else {
            return false;
        };
        if !record.has_client(conn) {
            record.clients.push((conn, client.clone()));
        }
        true
    }

    pub fn remove_client(&mut self, channel_name: &str, conn: ConnectionId) -> Option<Departure> {
        let record = self.by_name.get_mut(channel_name)?;
        let index = record.clients.iter().position(|(c, _)| *c == conn)?;
        let (_, client) = record.clients.remove(index);
        Some(Departure {
            channel: record.identity.clone(),
            provider: record.provider,
            client,
        })
    }

    /// Remove a channel on its provider's request.
    pub fn destroy(&mut self, channel_name: &str, requester: ConnectionId) -> Result<ChannelRecord, RuntimeError> {
        match self.by_name.get(channel_name) {
            None => Err(RuntimeError::ChannelDestroyed(channel_name.to_string())),
            Some(record) if record.provider != requester => {
                Err(RuntimeError::NotProvider(channel_name.to_string()))
            }
            Some(_) => self
                .by_name
                .remove(channel_name)
                .ok_or_else(|| RuntimeError::ChannelDestroyed(channel_name.to_string())),
        }
    }

    /// Forget everything `conn` took part in. Returns the channels it
    /// provided and the memberships it held elsewhere.
    pub fn drop_connection(&mut self, conn: ConnectionId) -> (Vec<ChannelRecord>, Vec<Departure>) {
        let provided: Vec<String> = self
            .by_name
            .iter()
            .filter(|(_, r)| r.provider == conn)
            .map(|(name, _)| name.clone())
            .collect();
        let destroyed = provided
            .iter()
            .filter_map(|name| self.by_name.remove(name))
            .collect();

        let mut departures = Vec::new();
        for record in self.by_name.values_mut() {
            let channel = &record.identity;
            let provider = record.provider;
            record.clients.retain(|(c, client)| {
                if *c == conn {
                    departures.push(Departure {
                        channel: channel.clone(),
                        provider,
                        client: client.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        (destroyed, departures)
    }
}
