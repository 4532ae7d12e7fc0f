//! In-memory transport connecting clients that share one document.
//!
//! Messages travel as encoded bytes through a FIFO queue and are delivered
//! one at a time, so every client handles remote updates strictly in
//! order. Broadcasts reach every connected client except the sender;
//! handshake replies go back to the sender only.

use std::collections::VecDeque;

use uuid::Uuid;
use weft_core::{CoreError, EditorUpdate};

use crate::client::{ClientConfig, ClientError, CollabClient, ConnectionState};
use crate::protocol::{PeerInfo, SyncMessage};

struct Envelope {
    from: usize,
    /// `None` broadcasts to every other connected client
    to: Option<usize>,
    bytes: Vec<u8>,
}

pub struct LocalHub {
    doc_id: Uuid,
    clients: Vec<CollabClient>,
    queue: VecDeque<Envelope>,
    delivered: u64,
}

impl LocalHub {
    pub fn new(doc_id: Uuid) -> Self {
        Self { doc_id, clients: Vec::new(), queue: VecDeque::new(), delivered: 0 }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Adds a disconnected client and returns its index.
    pub fn add_client(&mut self, name: &str, config: ClientConfig) -> Result<usize, ClientError> {
        let client = CollabClient::new(PeerInfo::new(name), self.doc_id, config)?;
        self.clients.push(client);
        Ok(self.clients.len() - 1)
    }

    pub fn client(&self, idx: usize) -> Option<&CollabClient> {
        self.clients.get(idx)
    }

    pub fn clients(&self) -> &[CollabClient] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Messages delivered since the hub was created.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn client_mut(&mut self, idx: usize) -> Result<&mut CollabClient, ClientError> {
        self.clients.get_mut(idx).ok_or(ClientError::UnknownClient(idx))
    }

    fn is_connected(&self, idx: usize) -> bool {
        self.clients
            .get(idx)
            .is_some_and(|c| c.connection_state() == ConnectionState::Connected)
    }

    fn connected_except(&self, idx: usize) -> Vec<usize> {
        (0..self.clients.len())
            .filter(|&other| other != idx && self.is_connected(other))
            .collect()
    }

    /// Runs a local edit batch on one client. Its delta is queued and goes
    /// out with the next [`pump`](Self::pump) if the client is connected.
    pub fn update<F, R>(&mut self, idx: usize, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&mut EditorUpdate<'_>) -> Result<R, CoreError>,
    {
        self.client_mut(idx)?.update(f)
    }

    pub fn set_awareness_data(&mut self, idx: usize, data: Vec<u8>) -> Result<(), ClientError> {
        self.client_mut(idx)?.set_awareness_data(data)
    }

    /// Connects a client and runs the reconnect handshake.
    ///
    /// The client first receives what each connected peer has that it
    /// lacks, and the cleanup this produces is delivered. Only then do the
    /// peers receive the client's own offline edits.
    pub fn connect(&mut self, idx: usize) -> Result<(), ClientError> {
        if self.is_connected(idx) {
            return Ok(());
        }
        self.client_mut(idx)?.connect()?;
        let others = self.connected_except(idx);
        log::info!("client {idx} connecting, {} peers online", others.len());

        for &other in &others {
            let introduce = self.clients[other].presence_messages()?;
            for msg in introduce {
                self.queue.push_back(Envelope { from: other, to: Some(idx), bytes: msg.encode()? });
            }
        }

        let step1 = self.clients[idx].sync_step1();
        for &other in &others {
            self.exchange(idx, other, &step1)?;
        }
        self.pump()?;

        for &other in &others {
            let step1 = self.clients[other].sync_step1();
            self.exchange(other, idx, &step1)?;
            self.pump()?;
        }
        Ok(())
    }

    // `requester` asks `responder` for its missing state; the reply is
    // applied to the requester right away.
    fn exchange(&mut self, requester: usize, responder: usize, step1: &SyncMessage) -> Result<(), ClientError> {
        let replies = self.deliver(responder, &step1.encode()?)?;
        for reply in replies {
            self.deliver(requester, &reply.encode()?)?;
        }
        Ok(())
    }

    pub fn disconnect(&mut self, idx: usize) -> Result<(), ClientError> {
        if !self.is_connected(idx) {
            return Ok(());
        }
        let left = self.client_mut(idx)?.disconnect();
        self.queue.push_back(Envelope { from: idx, to: None, bytes: left.encode()? });
        log::info!("client {idx} disconnected");
        self.pump().map(|_| ())
    }

    /// Delivers queued messages until nothing is left to send. Returns the
    /// number of deliveries.
    pub fn pump(&mut self) -> Result<usize, ClientError> {
        let mut count = 0;
        loop {
            self.collect_outgoing()?;
            let Some(envelope) = self.queue.pop_front() else {
                break;
            };
            let targets = match envelope.to {
                Some(to) => vec![to],
                None => self.connected_except(envelope.from),
            };
            for target in targets {
                if !self.is_connected(target) {
                    log::trace!("dropping message for offline client {target}");
                    continue;
                }
                let replies = self.deliver(target, &envelope.bytes)?;
                count += 1;
                for reply in replies {
                    self.queue.push_back(Envelope { from: target, to: Some(envelope.from), bytes: reply.encode()? });
                }
            }
        }
        if count > 0 {
            log::debug!("hub pumped {count} deliveries");
        }
        Ok(count)
    }

    fn deliver(&mut self, to: usize, bytes: &[u8]) -> Result<Vec<SyncMessage>, ClientError> {
        let msg = SyncMessage::decode(bytes)?;
        self.delivered += 1;
        self.client_mut(to)?.handle_message(&msg)
    }

    fn collect_outgoing(&mut self) -> Result<(), ClientError> {
        for idx in 0..self.clients.len() {
            if !self.is_connected(idx) {
                continue;
            }
            for msg in self.clients[idx].take_outgoing() {
                self.queue.push_back(Envelope { from: idx, to: None, bytes: msg.encode()? });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::NodeKey;

    fn hub_with(n: usize) -> LocalHub {
        let mut hub = LocalHub::new(Uuid::new_v4());
        for i in 0..n {
            let config = ClientConfig { bootstrap: i == 0, ..ClientConfig::default() };
            hub.add_client(&format!("peer-{i}"), config).unwrap();
        }
        hub
    }

    #[test]
    fn test_connect_shares_existing_content() {
        let mut hub = hub_with(2);
        hub.connect(0).unwrap();
        hub.connect(1).unwrap();
        assert_eq!(hub.client(1).unwrap().content_json(), hub.client(0).unwrap().content_json());
        assert_eq!(hub.client(1).unwrap().editor_state().root().child_count(), 1);
    }

    #[test]
    fn test_offline_client_receives_nothing() {
        let mut hub = hub_with(2);
        hub.connect(0).unwrap();
        hub.update(0, |u| {
            let p = u.create_element("heading")?;
            u.append(NodeKey::ROOT, p)
        })
        .unwrap();
        hub.pump().unwrap();
        assert!(hub.client(1).unwrap().editor_state().root().child_count() == 0);
    }

    #[test]
    fn test_presence_follows_connections() {
        let mut hub = hub_with(2);
        hub.connect(0).unwrap();
        hub.connect(1).unwrap();
        let id0 = hub.client(0).unwrap().peer_id();
        let id1 = hub.client(1).unwrap().peer_id();
        assert!(hub.client(0).unwrap().presence().peer(&id1).is_some());
        assert!(hub.client(1).unwrap().presence().peer(&id0).is_some());

        hub.disconnect(1).unwrap();
        assert!(hub.client(0).unwrap().presence().peer(&id1).is_none());
    }

    #[test]
    fn test_unknown_client() {
        let mut hub = hub_with(1);
        assert!(matches!(hub.connect(3), Err(ClientError::UnknownClient(3))));
    }
}
