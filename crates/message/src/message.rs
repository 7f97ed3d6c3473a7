use crate::queue_name::QueueNameComponents;
use crate::scheduling::Scheduling;
use crate::EnvelopeAddress;
use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spool::{get_data_spool, get_meta_spool, Spool, SpoolId};
use std::sync::Arc;
use timeq::TimerEntry;

bitflags::bitflags! {
    #[derive(Debug)]
    struct MessageFlags: u32 {
        /// true if Metadata needs to be saved
        const META_DIRTY = 1;
        /// true if Data needs to be saved
        const DATA_DIRTY = 2;
        /// true if the next save must be fully flushed to disk
        /// before it completes
        const FORCE_SYNC = 4;
    }
}

#[derive(Debug)]
struct MessageInner {
    metadata: Option<MetaData>,
    data: Arc<Box<[u8]>>,
    flags: MessageFlags,
    due: Option<DateTime<Utc>>,
    num_attempts: u16,
}

/// A message being routed through the queues.
/// This is a cheaply clonable handle: the body is reference counted
/// and shared by all clones, so moving a message between queues and
/// tasks never copies the payload.
#[derive(Clone, Debug)]
pub struct Message {
    id: SpoolId,
    inner: Arc<Mutex<MessageInner>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct MetaData {
    sender: EnvelopeAddress,
    recipient: EnvelopeAddress,
    meta: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schedule: Option<Scheduling>,
}

impl Message {
    /// Create a new message with the supplied data.
    /// The message meta and data are marked as dirty.
    pub fn new_dirty(
        sender: EnvelopeAddress,
        recipient: EnvelopeAddress,
        meta: serde_json::Value,
        data: Arc<Box<[u8]>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(meta.is_object(), "metadata must be a json object");
        let id = SpoolId::new();
        Ok(Self {
            id,
            inner: Arc::new(Mutex::new(MessageInner {
                metadata: Some(MetaData {
                    sender,
                    recipient,
                    meta,
                    schedule: None,
                }),
                data,
                flags: MessageFlags::META_DIRTY | MessageFlags::DATA_DIRTY,
                due: None,
                num_attempts: 0,
            })),
        })
    }

    /// Reconstitute a message from its spooled metadata blob.
    /// The data is loaded separately, on demand.
    pub fn new_from_spool(id: SpoolId, metadata: Vec<u8>) -> anyhow::Result<Self> {
        let metadata: MetaData = serde_json::from_slice(&metadata).context("parsing metadata")?;

        Ok(Self {
            id,
            inner: Arc::new(Mutex::new(MessageInner {
                metadata: Some(metadata),
                data: Arc::new(vec![].into_boxed_slice()),
                flags: MessageFlags::empty(),
                due: None,
                num_attempts: 0,
            })),
        })
    }

    pub fn id(&self) -> &SpoolId {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.id.created()
    }

    /// The age of the message at `now`
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        self.id.age(now)
    }

    pub fn get_due(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().due
    }

    /// Set the due time, or None for "due now".
    /// If the message carries a scheduling constraint, the due time
    /// is moved forward to the next permitted window.
    /// Returns the effective due time.
    pub fn set_due(&self, due: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock();
        let due = match inner.metadata.as_ref().and_then(|meta| meta.schedule) {
            Some(sched) => Some(sched.adjust_for_schedule(due.unwrap_or_else(Utc::now))),
            None => due,
        };
        inner.due = due;
        due
    }

    /// Delay the message by `duration` from now
    pub fn delay_by(&self, duration: TimeDelta) -> Option<DateTime<Utc>> {
        self.set_due(Some(Utc::now() + duration))
    }

    /// Delay by a random amount up to `limit` seconds; used to smear
    /// thundering herds of messages becoming due at the same instant
    pub fn delay_with_jitter(&self, limit: i64) -> Option<DateTime<Utc>> {
        let scale = rand::random::<f32>();
        let value = (scale * limit as f32) as i64;
        self.delay_by(TimeDelta::seconds(value))
    }

    pub fn get_num_attempts(&self) -> u16 {
        self.inner.lock().num_attempts
    }

    pub fn increment_num_attempts(&self) {
        let mut inner = self.inner.lock();
        inner.num_attempts = inner.num_attempts.saturating_add(1);
    }

    /// Set the attempt counter; used when reconstituting from spool,
    /// where the count is inferred from the age of the message since
    /// attempts are not persisted
    pub fn set_num_attempts(&self, num_attempts: u16) {
        self.inner.lock().num_attempts = num_attempts;
    }

    pub fn get_scheduling(&self) -> Option<Scheduling> {
        self.inner
            .lock()
            .metadata
            .as_ref()
            .and_then(|meta| meta.schedule)
    }

    pub fn set_scheduling(&self, scheduling: Option<Scheduling>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.metadata {
            None => anyhow::bail!("metadata must be loaded first"),
            Some(meta) => {
                meta.schedule = scheduling;
            }
        }
        inner.flags.set(MessageFlags::META_DIRTY, true);
        Ok(())
    }

    pub fn sender(&self) -> anyhow::Result<EnvelopeAddress> {
        match &self.inner.lock().metadata {
            Some(meta) => Ok(meta.sender.clone()),
            None => anyhow::bail!("metadata is not loaded"),
        }
    }

    pub fn recipient(&self) -> anyhow::Result<EnvelopeAddress> {
        match &self.inner.lock().metadata {
            Some(meta) => Ok(meta.recipient.clone()),
            None => anyhow::bail!("metadata is not loaded"),
        }
    }

    pub fn set_meta<S: AsRef<str>, V: Into<serde_json::Value>>(
        &self,
        key: S,
        value: V,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.metadata {
            None => anyhow::bail!("metadata must be loaded first"),
            Some(meta) => {
                match &mut meta.meta {
                    serde_json::Value::Object(map) => {
                        map.insert(key.as_ref().to_string(), value.into());
                    }
                    _ => anyhow::bail!("metadata is somehow not a json object"),
                }

                inner.flags.set(MessageFlags::META_DIRTY, true);
                Ok(())
            }
        }
    }

    pub fn get_meta<S: serde_json::value::Index>(
        &self,
        key: S,
    ) -> anyhow::Result<serde_json::Value> {
        match &self.inner.lock().metadata {
            None => anyhow::bail!("metadata must be loaded first"),
            Some(meta) => match meta.meta.get(key) {
                Some(value) => Ok(value.clone()),
                None => Ok(serde_json::Value::Null),
            },
        }
    }

    /// A copy of the full metadata map, for logging
    pub fn get_meta_obj(&self) -> std::collections::HashMap<String, serde_json::Value> {
        match &self.inner.lock().metadata {
            Some(meta) => match &meta.meta {
                serde_json::Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                _ => Default::default(),
            },
            None => Default::default(),
        }
    }

    /// Retrieve `key` as a String
    pub fn get_meta_string<S: serde_json::value::Index + std::fmt::Display + Copy>(
        &self,
        key: S,
    ) -> anyhow::Result<Option<String>> {
        match self.get_meta(key) {
            Ok(serde_json::Value::String(value)) => Ok(Some(value)),
            Ok(serde_json::Value::Null) => Ok(None),
            hmm => {
                anyhow::bail!("expected '{key}' to be a string value, got {hmm:?}");
            }
        }
    }

    /// The name of the scheduled queue this message belongs to:
    /// either the `queue` metadata override, or composed from the
    /// campaign/tenant/routing_domain metadata and the recipient
    /// domain
    pub fn get_queue_name(&self) -> anyhow::Result<String> {
        if let Some(name) = self.get_meta_string("queue")? {
            return Ok(name);
        }

        let campaign = self.get_meta_string("campaign")?;
        let tenant = self.get_meta_string("tenant")?;
        let routing_domain = self.get_meta_string("routing_domain")?;
        let domain = self.recipient()?.domain().to_ascii_lowercase();

        Ok(QueueNameComponents::format(
            campaign,
            tenant,
            domain,
            routing_domain,
        ))
    }

    /// Arrange for the next save to be a durable, fully-flushed write
    pub fn set_force_sync(&self, force: bool) {
        self.inner.lock().flags.set(MessageFlags::FORCE_SYNC, force);
    }

    pub fn needs_save(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .flags
            .intersects(MessageFlags::META_DIRTY | MessageFlags::DATA_DIRTY)
    }

    fn get_data_if_dirty(&self) -> Option<Arc<Box<[u8]>>> {
        let inner = self.inner.lock();
        if inner.flags.contains(MessageFlags::DATA_DIRTY) {
            Some(Arc::clone(&inner.data))
        } else {
            None
        }
    }

    fn get_meta_if_dirty(&self) -> Option<MetaData> {
        let inner = self.inner.lock();
        if inner.flags.contains(MessageFlags::META_DIRTY) {
            inner.metadata.clone()
        } else {
            None
        }
    }

    /// Save dirty state to the global data/meta spools
    pub async fn save(&self) -> anyhow::Result<()> {
        self.save_to(&**get_meta_spool(), &**get_data_spool()).await
    }

    pub async fn save_to(
        &self,
        meta_spool: &(dyn Spool + Send + Sync),
        data_spool: &(dyn Spool + Send + Sync),
    ) -> anyhow::Result<()> {
        let force_sync = self.inner.lock().flags.contains(MessageFlags::FORCE_SYNC);
        if let Some(data) = self.get_data_if_dirty() {
            anyhow::ensure!(!data.is_empty(), "message data must not be empty");
            data_spool.store(self.id, data, force_sync).await?;
            self.inner.lock().flags.remove(MessageFlags::DATA_DIRTY);
        }
        if let Some(meta) = self.get_meta_if_dirty() {
            let data = Arc::new(serde_json::to_vec(&meta)?.into_boxed_slice());
            meta_spool.store(self.id, data, force_sync).await?;
            self.inner.lock().flags.remove(MessageFlags::META_DIRTY);
        }
        self.inner.lock().flags.remove(MessageFlags::FORCE_SYNC);
        Ok(())
    }

    pub fn is_meta_loaded(&self) -> bool {
        self.inner.lock().metadata.is_some()
    }

    pub fn is_data_loaded(&self) -> bool {
        !self.inner.lock().data.is_empty()
    }

    pub async fn load_meta_if_needed(&self) -> anyhow::Result<()> {
        if self.is_meta_loaded() {
            return Ok(());
        }
        self.load_meta().await
    }

    pub async fn load_meta(&self) -> anyhow::Result<()> {
        let data = get_meta_spool().load(self.id).await?;
        let metadata: MetaData = serde_json::from_slice(&data)?;
        self.inner.lock().metadata.replace(metadata);
        Ok(())
    }

    pub async fn load_data_if_needed(&self) -> anyhow::Result<()> {
        if self.is_data_loaded() {
            return Ok(());
        }
        self.load_data().await
    }

    pub async fn load_data(&self) -> anyhow::Result<()> {
        let data = get_data_spool().load(self.id).await?;
        self.inner.lock().data = Arc::new(data.into_boxed_slice());
        Ok(())
    }

    pub fn assign_data(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.data = Arc::new(data.into_boxed_slice());
        inner.flags.set(MessageFlags::DATA_DIRTY, true);
    }

    pub fn get_data(&self) -> Arc<Box<[u8]>> {
        self.inner.lock().data.clone()
    }

    /// Release the memory held by a message that has been durably
    /// saved; it can be reloaded from spool on demand
    pub fn shrink(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(MessageFlags::DATA_DIRTY) {
            anyhow::bail!("Cannot shrink message: DATA_DIRTY");
        }
        if inner.flags.contains(MessageFlags::META_DIRTY) {
            anyhow::bail!("Cannot shrink message: META_DIRTY");
        }
        inner.metadata.take();
        inner.data = Arc::new(vec![].into_boxed_slice());
        Ok(())
    }

    pub fn shrink_data(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(MessageFlags::DATA_DIRTY) {
            anyhow::bail!("Cannot shrink message: DATA_DIRTY");
        }
        inner.data = Arc::new(vec![].into_boxed_slice());
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Message {}

impl std::hash::Hash for Message {
    fn hash<H: std::hash::Hasher>(&self, hasher: &mut H) {
        self.id.hash(hasher)
    }
}

impl TimerEntry for Message {
    type Id = SpoolId;

    fn id(&self) -> &SpoolId {
        &self.id
    }

    fn due(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().due
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_message() -> Message {
        Message::new_dirty(
            EnvelopeAddress::parse("sender@example.com").unwrap(),
            EnvelopeAddress::parse("recip@example.com").unwrap(),
            serde_json::json!({}),
            Arc::new(
                b"Subject: hello\r\n\r\nwoot"
                    .to_vec()
                    .into_boxed_slice(),
            ),
        )
        .unwrap()
    }

    #[test]
    fn queue_name_from_meta() {
        let msg = make_message();
        k9::assert_equal!(msg.get_queue_name().unwrap(), "example.com");

        msg.set_meta("tenant", "mytenant").unwrap();
        k9::assert_equal!(msg.get_queue_name().unwrap(), "mytenant@example.com");

        msg.set_meta("campaign", "sale").unwrap();
        k9::assert_equal!(msg.get_queue_name().unwrap(), "sale:mytenant@example.com");

        msg.set_meta("routing_domain", "relay.example.com").unwrap();
        k9::assert_equal!(
            msg.get_queue_name().unwrap(),
            "sale:mytenant@example.com!relay.example.com"
        );

        msg.set_meta("queue", "override").unwrap();
        k9::assert_equal!(msg.get_queue_name().unwrap(), "override");
    }

    #[test]
    fn due_and_attempts() {
        let msg = make_message();
        assert_eq!(msg.get_due(), None);

        let due = msg.delay_by(TimeDelta::seconds(60)).unwrap();
        assert_eq!(msg.get_due(), Some(due));

        assert_eq!(msg.get_num_attempts(), 0);
        msg.increment_num_attempts();
        msg.increment_num_attempts();
        assert_eq!(msg.get_num_attempts(), 2);
        msg.set_num_attempts(7);
        assert_eq!(msg.get_num_attempts(), 7);
    }

    #[test]
    fn metadata_round_trip() {
        let msg = make_message();
        msg.set_meta("tenant", "t1").unwrap();
        msg.set_meta("campaign", "c1").unwrap();

        let meta = msg.get_meta_if_dirty().expect("fresh message is dirty");
        let blob = serde_json::to_vec(&meta).unwrap();
        let restored = Message::new_from_spool(*msg.id(), blob).unwrap();

        assert_eq!(restored.sender().unwrap(), msg.sender().unwrap());
        assert_eq!(restored.recipient().unwrap(), msg.recipient().unwrap());
        assert_eq!(
            restored.get_meta_string("tenant").unwrap().as_deref(),
            Some("t1")
        );
        assert_eq!(restored.get_queue_name().unwrap(), "c1:t1@example.com");
        assert!(!restored.needs_save());
    }

    #[test]
    fn shrink_requires_save() {
        let msg = make_message();
        assert!(msg.needs_save());
        assert!(msg.shrink().is_err());
    }
}
