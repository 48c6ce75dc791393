//! The client/criteria registry of one monitor.
//!
//! Two parallel maps share a key lifetime: a criteria key is present in the
//! client map iff it is present in the criteria map. Keeping both behind
//! this one structure (and its owner's single mutex) is what upholds that
//! invariant at every observation point.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::Criteria;

pub(crate) struct ClientRegistry {
    clients: HashMap<String, Vec<IpAddr>>,
    criteria: HashMap<String, Criteria>,
}

impl ClientRegistry {
    pub(crate) fn new() -> Self {
        ClientRegistry {
            clients: HashMap::new(),
            criteria: HashMap::new(),
        }
    }

    /// Whether criteria under this key were previously accepted and remain
    /// in force.
    pub(crate) fn has_key(&self, key: &str) -> bool {
        self.criteria.contains_key(key)
    }

    /// Append a client to an accepted key. Idempotent on duplicates.
    pub(crate) fn add_client(&mut self, key: &str, client: IpAddr) {
        if let Some(clients) = self.clients.get_mut(key) {
            if !clients.contains(&client) {
                clients.push(client);
            }
        }
    }

    /// Accept a new criteria key with its first client.
    pub(crate) fn insert(&mut self, key: String, criteria: Criteria, client: IpAddr) {
        self.clients.insert(key.clone(), vec![client]);
        self.criteria.insert(key, criteria);
    }

    /// Remove one client. Returns false if the key is unknown or the client
    /// is not listed under it. Removing the last client retires the key
    /// from both maps.
    pub(crate) fn remove_client(&mut self, key: &str, client: IpAddr) -> bool {
        let Some(clients) = self.clients.get_mut(key) else {
            return false;
        };
        let Some(pos) = clients.iter().position(|c| *c == client) else {
            return false;
        };
        clients.remove(pos);
        if clients.is_empty() {
            self.clients.remove(key);
            self.criteria.remove(key);
        }
        true
    }

    /// Retire a key from both maps, returning the clients that were
    /// registered under it.
    pub(crate) fn remove_key(&mut self, key: &str) -> Vec<IpAddr> {
        self.criteria.remove(key);
        self.clients.remove(key).unwrap_or_default()
    }

    /// The accepted criteria, by key.
    pub(crate) fn criteria_entries(&self) -> impl Iterator<Item = (&String, &Criteria)> {
        self.criteria.iter()
    }

    /// Retire everything, returning each key's clients.
    pub(crate) fn drain(&mut self) -> Vec<(String, Vec<IpAddr>)> {
        self.criteria.clear();
        self.clients.drain().collect()
    }

    /// Registration listing for status reporting.
    pub(crate) fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        let mut entries: Vec<(String, Vec<String>)> = self
            .clients
            .iter()
            .map(|(key, ips)| (key.clone(), ips.iter().map(IpAddr::to_string).collect()))
            .collect();
        entries.sort();
        entries
    }

    #[cfg(test)]
    fn is_symmetric(&self) -> bool {
        self.clients.len() == self.criteria.len()
            && self.clients.keys().all(|k| self.criteria.contains_key(k))
    }
}
