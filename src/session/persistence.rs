//! Durable storage for outgoing QoS 1 and QoS 2 flows.
//!
//! Flows are kept in a `sled` tree keyed by packet identifier so a client
//! restarted with `clean_session = false` can resume the exchanges the
//! broker still expects to complete.

use std::path::Path;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::codec::{Publish, QoS};
use crate::utils::error::Result;

const OUTGOING_TREE: &str = "outgoing";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredFlow {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// PUBREC was received and PUBREL sent; only PUBCOMP is outstanding.
    pub released: bool,
    /// Submission order within the session.
    pub seq: u64,
    pub stored_at: i64,
}

impl StoredFlow {
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: Some(self.packet_id),
            payload: Bytes::from(self.payload.clone()),
        }
    }
}

#[derive(Clone)]
pub struct FlowStore {
    db: Db,
    outgoing: Tree,
}

impl FlowStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let outgoing = db.open_tree(OUTGOING_TREE)?;
        Ok(Self { db, outgoing })
    }

    /// Record an unacknowledged PUBLISH. Publishes without a packet
    /// identifier (QoS 0) are not stored.
    pub fn store_publish(&self, publish: &Publish, seq: u64) -> Result<()> {
        let Some(packet_id) = publish.packet_id else {
            return Ok(());
        };
        let flow = StoredFlow {
            packet_id,
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
            released: false,
            seq,
            stored_at: Utc::now().timestamp_millis(),
        };
        self.put(&flow)
    }

    /// Mark a QoS 2 flow as released. Unknown identifiers are ignored.
    pub fn store_pubrel(&self, packet_id: u16) -> Result<()> {
        if let Some(mut flow) = self.get(packet_id)? {
            flow.released = true;
            self.put(&flow)?;
        }
        Ok(())
    }

    pub fn get(&self, packet_id: u16) -> Result<Option<StoredFlow>> {
        match self.outgoing.get(packet_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn discard(&self, packet_id: u16) -> Result<()> {
        self.outgoing.remove(packet_id.to_be_bytes())?;
        Ok(())
    }

    /// Every stored flow, in submission order.
    pub fn load_all(&self) -> Result<Vec<StoredFlow>> {
        let mut flows = Vec::new();
        for entry in self.outgoing.iter() {
            let (_, value) = entry?;
            flows.push(serde_json::from_slice::<StoredFlow>(&value)?);
        }
        flows.sort_by_key(|flow| (flow.seq, flow.packet_id));
        Ok(flows)
    }

    pub fn clear(&self) -> Result<()> {
        self.outgoing.clear()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, packet_id: u16, value: &[u8]) -> Result<()> {
        self.outgoing.insert(packet_id.to_be_bytes(), value)?;
        Ok(())
    }

    fn put(&self, flow: &StoredFlow) -> Result<()> {
        let value = serde_json::to_vec(flow)?;
        self.outgoing.insert(flow.packet_id.to_be_bytes(), value)?;
        Ok(())
    }
}

impl std::fmt::Debug for FlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStore")
            .field("db", &"sled::Db")
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}
