//! Persistent storage using sled
//!
//! One tree per keyed collection. Composite keys join segments with a
//! 0x00 separator so IRIs and suffixes can be prefix-scanned; ordered
//! listings rely on sled's monotonic id generator for insertion order.

use chrono::{DateTime, Utc};
use orb_core::hashlink;
use orb_core::operation::AnchoredOperation;
use orb_core::vocab::{Activity, AnchorEvent};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("core error: {0}")]
    Core(#[from] orb_core::Error),
    #[error("conflicting write: {0}")]
    Conflict(String),
}

/// Activity listing tags
pub const TAG_OUTBOX: &str = "outbox";
pub const TAG_PUBLIC_OUTBOX: &str = "public-outbox";
pub const TAG_INBOX: &str = "inbox";

const KEY_SEP: u8 = 0x00;

/// Reference set kinds: every set is a mapping from an owner IRI to an
/// ordered set of member IRIs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    Inbox,
    Follower,
    Following,
    Witness,
    Witnessing,
    Like,
    Liked,
    Share,
    AnchorCredential,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Inbox => "inbox",
            RefKind::Follower => "follower",
            RefKind::Following => "following",
            RefKind::Witness => "witness",
            RefKind::Witnessing => "witnessing",
            RefKind::Like => "like",
            RefKind::Liked => "liked",
            RefKind::Share => "share",
            RefKind::AnchorCredential => "anchor-credential",
        }
    }
}

/// Proof monitor entry status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    NotConfirmed,
    Confirmed,
    Expired,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::NotConfirmed => "not_confirmed",
            MonitorStatus::Confirmed => "confirmed",
            MonitorStatus::Expired => "expired",
        }
    }
}

/// A credential watched by the proof monitor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MonitorRecord {
    pub credential_id: String,
    /// Resource hash of the anchor linkset
    pub anchor: String,
    /// Resource hash of the credential bytes in CAS
    pub vc_hash: String,
    /// Base64 leaf hash submitted to the VCT log
    pub leaf_hash: String,
    pub expires_at: DateTime<Utc>,
    pub status: MonitorStatus,
}

/// VCT log registration status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Active,
    Inactive,
}

/// A monitored VCT log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogMonitorRecord {
    pub log_url: String,
    /// Latest observed signed tree head
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sth: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<String>,
    pub status: LogStatus,
}

/// A delivery abandoned after the retry budget
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UndeliverableRecord {
    pub activity_id: String,
    pub recipient: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

fn join_key(segments: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.extend_from_slice(segment);
    }
    key
}

/// Storage backend for orbd
pub struct Storage {
    db: Db,
    /// activity id -> canonical activity JSON
    activities: sled::Tree,
    /// tag \x00 seq -> activity id
    activity_tags: sled::Tree,
    /// kind \x00 owner \x00 seq -> member
    refs: sled::Tree,
    /// kind \x00 owner \x00 member -> seq
    ref_index: sled::Tree,
    /// resource hash -> content bytes
    cas: sled::Tree,
    /// suffix \x00 seq -> unpublished AnchoredOperation
    opqueue: sled::Tree,
    /// suffix \x00 txn \x00 index -> published AnchoredOperation
    operations: sled::Tree,
    /// linkset resource hash -> AnchorEvent
    anchors: sled::Tree,
    /// status \x00 credential id -> MonitorRecord
    monitor: sled::Tree,
    /// log url -> LogMonitorRecord
    logmonitor: sled::Tree,
    /// seq -> UndeliverableRecord
    undeliverable: sled::Tree,
    /// key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            activities: db.open_tree("activities")?,
            activity_tags: db.open_tree("activity_tags")?,
            refs: db.open_tree("refs")?,
            ref_index: db.open_tree("ref_index")?,
            cas: db.open_tree("cas")?,
            opqueue: db.open_tree("opqueue")?,
            operations: db.open_tree("operations")?,
            anchors: db.open_tree("anchors")?,
            monitor: db.open_tree("monitor")?,
            logmonitor: db.open_tree("logmonitor")?,
            undeliverable: db.open_tree("undeliverable")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    /// Monotonic sequence number shared by ordered listings
    pub fn generate_seq(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()?)
    }

    // =========================================================================
    // ACTIVITIES
    // =========================================================================

    /// Store an activity and add it to the given tag listings
    pub fn put_activity(&self, activity: &Activity, tags: &[&str]) -> Result<(), StorageError> {
        let value = serde_json::to_vec(activity)?;
        self.activities.insert(activity.id.as_bytes(), value)?;
        for tag in tags {
            let seq = self.generate_seq()?;
            let key = join_key(&[tag.as_bytes(), &seq.to_be_bytes()]);
            self.activity_tags.insert(key, activity.id.as_bytes())?;
        }
        Ok(())
    }

    pub fn get_activity(&self, id: &str) -> Result<Option<Activity>, StorageError> {
        match self.activities.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Paged, insertion-ordered listing for one tag
    pub fn activities_by_tag(
        &self,
        tag: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Activity>, StorageError> {
        let prefix = join_key(&[tag.as_bytes(), &[]]);
        let mut out = Vec::new();
        for result in self.activity_tags.scan_prefix(&prefix).skip(offset).take(limit) {
            let (_, id) = result?;
            if let Some(activity) = self.get_activity(std::str::from_utf8(&id).unwrap_or(""))? {
                out.push(activity);
            }
        }
        Ok(out)
    }

    pub fn count_by_tag(&self, tag: &str) -> Result<usize, StorageError> {
        let prefix = join_key(&[tag.as_bytes(), &[]]);
        let mut count = 0;
        for result in self.activity_tags.scan_prefix(&prefix) {
            result?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // REFERENCE SETS (owner IRI -> ordered member set)
    // =========================================================================

    /// Add a member; returns false if it was already present. The index
    /// insert is a compare-and-swap so concurrent adds settle on one
    /// winner.
    pub fn add_reference(
        &self,
        kind: RefKind,
        owner: &str,
        member: &str,
    ) -> Result<bool, StorageError> {
        let index_key = join_key(&[kind.as_str().as_bytes(), owner.as_bytes(), member.as_bytes()]);
        let seq = self.generate_seq()?;

        match self.ref_index.compare_and_swap(
            index_key,
            None as Option<&[u8]>,
            Some(&seq.to_be_bytes()[..]),
        )? {
            Ok(()) => {}
            Err(_) => return Ok(false),
        }

        let ordered_key = join_key(&[
            kind.as_str().as_bytes(),
            owner.as_bytes(),
            &seq.to_be_bytes(),
        ]);
        self.refs.insert(ordered_key, member.as_bytes())?;
        Ok(true)
    }

    /// Remove a member; returns false if it was not present
    pub fn remove_reference(
        &self,
        kind: RefKind,
        owner: &str,
        member: &str,
    ) -> Result<bool, StorageError> {
        let index_key = join_key(&[kind.as_str().as_bytes(), owner.as_bytes(), member.as_bytes()]);
        let Some(seq_bytes) = self.ref_index.remove(index_key)? else {
            return Ok(false);
        };
        let ordered_key = join_key(&[
            kind.as_str().as_bytes(),
            owner.as_bytes(),
            seq_bytes.as_ref(),
        ]);
        self.refs.remove(ordered_key)?;
        Ok(true)
    }

    pub fn has_reference(
        &self,
        kind: RefKind,
        owner: &str,
        member: &str,
    ) -> Result<bool, StorageError> {
        let index_key = join_key(&[kind.as_str().as_bytes(), owner.as_bytes(), member.as_bytes()]);
        Ok(self.ref_index.contains_key(index_key)?)
    }

    /// All members in insertion order
    pub fn references(&self, kind: RefKind, owner: &str) -> Result<Vec<String>, StorageError> {
        self.references_page(kind, owner, 0, usize::MAX)
    }

    /// Paged members in insertion order
    pub fn references_page(
        &self,
        kind: RefKind,
        owner: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = join_key(&[kind.as_str().as_bytes(), owner.as_bytes(), &[]]);
        let mut out = Vec::new();
        for result in self.refs.scan_prefix(&prefix).skip(offset).take(limit) {
            let (_, member) = result?;
            out.push(String::from_utf8_lossy(&member).into_owned());
        }
        Ok(out)
    }

    pub fn reference_count(&self, kind: RefKind, owner: &str) -> Result<usize, StorageError> {
        let prefix = join_key(&[kind.as_str().as_bytes(), owner.as_bytes(), &[]]);
        let mut count = 0;
        for result in self.refs.scan_prefix(&prefix) {
            result?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // CAS (content bytes keyed by resource hash)
    // =========================================================================

    /// Write bytes, returning their hashlink. Idempotent: identical
    /// bytes land on the same key.
    pub fn cas_put(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let resource_hash = hashlink::resource_hash(bytes);
        self.cas.insert(resource_hash.as_bytes(), bytes)?;
        Ok(format!("hl:{resource_hash}"))
    }

    pub fn cas_get(&self, resource_hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.cas.get(resource_hash.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn cas_has(&self, resource_hash: &str) -> Result<bool, StorageError> {
        Ok(self.cas.contains_key(resource_hash.as_bytes())?)
    }

    // =========================================================================
    // UNPUBLISHED OPERATIONS (opqueue)
    // =========================================================================

    /// Queue an operation awaiting anchoring. The key slot is claimed
    /// with a compare-and-swap so two ingests for the same (suffix, seq)
    /// surface as a conflict.
    pub fn queue_unpublished(
        &self,
        suffix: &str,
        op: &AnchoredOperation,
    ) -> Result<(), StorageError> {
        let key = join_key(&[suffix.as_bytes(), &op.op_index.to_be_bytes()]);
        let value = serde_json::to_vec(op)?;
        match self
            .opqueue
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(StorageError::Conflict(format!(
                "operation {}/{} already queued",
                suffix, op.op_index
            ))),
        }
    }

    /// Unpublished operations for one suffix, in ingest order
    pub fn unpublished_for(&self, suffix: &str) -> Result<Vec<AnchoredOperation>, StorageError> {
        let prefix = join_key(&[suffix.as_bytes(), &[]]);
        let mut out = Vec::new();
        for result in self.opqueue.scan_prefix(&prefix) {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn remove_unpublished(&self, suffix: &str, op_index: u64) -> Result<(), StorageError> {
        let key = join_key(&[suffix.as_bytes(), &op_index.to_be_bytes()]);
        self.opqueue.remove(key)?;
        Ok(())
    }

    /// Every queued operation, for pipeline recovery after restart
    pub fn all_unpublished(&self) -> Result<Vec<AnchoredOperation>, StorageError> {
        let mut out = Vec::new();
        for result in self.opqueue.iter() {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        out.sort_by_key(|op: &AnchoredOperation| op.op_index);
        Ok(out)
    }

    // =========================================================================
    // PUBLISHED OPERATIONS
    // =========================================================================

    /// Record a published operation under its anchor coordinates
    pub fn put_published(&self, op: &AnchoredOperation) -> Result<(), StorageError> {
        let txn = op.txn_number.ok_or_else(|| {
            StorageError::Core(orb_core::Error::MissingField("txnNumber".to_string()))
        })?;
        let suffix = op.operation.suffix().map_err(StorageError::Core)?;
        let mut coord = Vec::with_capacity(16);
        coord.extend_from_slice(&txn.to_be_bytes());
        coord.extend_from_slice(&op.op_index.to_be_bytes());
        let key = join_key(&[suffix.as_bytes(), &coord]);
        self.operations.insert(key, serde_json::to_vec(op)?)?;
        Ok(())
    }

    /// Published operations for one suffix, ordered by (txn, index)
    pub fn published_for(&self, suffix: &str) -> Result<Vec<AnchoredOperation>, StorageError> {
        let prefix = join_key(&[suffix.as_bytes(), &[]]);
        let mut out = Vec::new();
        for result in self.operations.scan_prefix(&prefix) {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    /// Anchor hashlink of the latest published operation for a suffix
    pub fn latest_anchor(&self, suffix: &str) -> Result<Option<String>, StorageError> {
        let prefix = join_key(&[suffix.as_bytes(), &[]]);
        let mut last: Option<AnchoredOperation> = None;
        for result in self.operations.scan_prefix(&prefix) {
            let (_, bytes) = result?;
            last = Some(serde_json::from_slice(&bytes)?);
        }
        Ok(last.and_then(|op| op.anchor))
    }

    /// Next anchor transaction number
    pub fn next_txn_number(&self) -> Result<u64, StorageError> {
        let bytes = self
            .metadata
            .update_and_fetch("txn_counter", |old| {
                let next = old
                    .map(|b| u64::from_be_bytes(b.try_into().unwrap_or([0; 8])) + 1)
                    .unwrap_or(0);
                Some(next.to_be_bytes().to_vec())
            })?
            .expect("counter is always written");
        Ok(u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8])))
    }

    // =========================================================================
    // ANCHOR EVENTS
    // =========================================================================

    pub fn put_anchor_event(
        &self,
        linkset_hash: &str,
        event: &AnchorEvent,
    ) -> Result<(), StorageError> {
        self.anchors
            .insert(linkset_hash.as_bytes(), serde_json::to_vec(event)?)?;
        Ok(())
    }

    pub fn get_anchor_event(
        &self,
        linkset_hash: &str,
    ) -> Result<Option<AnchorEvent>, StorageError> {
        match self.anchors.get(linkset_hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_anchor(&self, linkset_hash: &str) -> Result<bool, StorageError> {
        Ok(self.anchors.contains_key(linkset_hash.as_bytes())?)
    }

    // =========================================================================
    // PROOF MONITOR QUEUE
    // =========================================================================

    pub fn put_monitor(&self, record: &MonitorRecord) -> Result<(), StorageError> {
        let key = join_key(&[
            record.status.as_str().as_bytes(),
            record.credential_id.as_bytes(),
        ]);
        self.monitor.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Move a record to a new status
    pub fn set_monitor_status(
        &self,
        record: &MonitorRecord,
        status: MonitorStatus,
    ) -> Result<MonitorRecord, StorageError> {
        let old_key = join_key(&[
            record.status.as_str().as_bytes(),
            record.credential_id.as_bytes(),
        ]);
        self.monitor.remove(old_key)?;
        let mut updated = record.clone();
        updated.status = status;
        self.put_monitor(&updated)?;
        Ok(updated)
    }

    pub fn remove_monitor(&self, record: &MonitorRecord) -> Result<(), StorageError> {
        let key = join_key(&[
            record.status.as_str().as_bytes(),
            record.credential_id.as_bytes(),
        ]);
        self.monitor.remove(key)?;
        Ok(())
    }

    pub fn monitors_with_status(
        &self,
        status: MonitorStatus,
    ) -> Result<Vec<MonitorRecord>, StorageError> {
        let prefix = join_key(&[status.as_str().as_bytes(), &[]]);
        let mut out = Vec::new();
        for result in self.monitor.scan_prefix(&prefix) {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    // =========================================================================
    // LOG MONITOR
    // =========================================================================

    pub fn put_log_monitor(&self, record: &LogMonitorRecord) -> Result<(), StorageError> {
        self.logmonitor
            .insert(record.log_url.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn get_log_monitor(&self, url: &str) -> Result<Option<LogMonitorRecord>, StorageError> {
        match self.logmonitor.get(url.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn log_monitors(&self) -> Result<Vec<LogMonitorRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.logmonitor.iter() {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    /// The active VCT log URL, if configured
    pub fn active_log(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .metadata
            .get("active_log")?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_active_log(&self, url: &str) -> Result<(), StorageError> {
        self.metadata.insert("active_log", url.as_bytes())?;
        self.put_log_monitor(&LogMonitorRecord {
            log_url: url.to_string(),
            sth: None,
            pub_key: None,
            status: LogStatus::Active,
        })
    }

    // =========================================================================
    // UNDELIVERABLE LOG
    // =========================================================================

    pub fn record_undeliverable(&self, record: &UndeliverableRecord) -> Result<(), StorageError> {
        let seq = self.generate_seq()?;
        self.undeliverable
            .insert(seq.to_be_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn undeliverable_records(&self) -> Result<Vec<UndeliverableRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.undeliverable.iter() {
            let (_, bytes) = result?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    // =========================================================================
    // METADATA
    // =========================================================================

    pub fn witness_policy(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .metadata
            .get("witness_policy")?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_witness_policy(&self, policy: &str) -> Result<(), StorageError> {
        self.metadata.insert("witness_policy", policy.as_bytes())?;
        Ok(())
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::vocab::{ActivityType, Activity};
    use tempfile::tempdir;

    fn open_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (Storage::open(dir.path()).unwrap(), dir)
    }

    fn activity(id: &str) -> Activity {
        Activity::new(ActivityType::Follow, "https://node-a.example/services/orb")
            .with_id(id.to_string())
    }

    #[test]
    fn test_activity_tags_and_paging() {
        let (storage, _dir) = open_storage();
        for i in 0..5 {
            let a = activity(&format!("https://node-a.example/activities/{i}"));
            storage.put_activity(&a, &[TAG_OUTBOX]).unwrap();
        }

        assert_eq!(storage.count_by_tag(TAG_OUTBOX).unwrap(), 5);
        let page = storage.activities_by_tag(TAG_OUTBOX, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "https://node-a.example/activities/2");
    }

    #[test]
    fn test_reference_set_dedup_and_order() {
        let (storage, _dir) = open_storage();
        let owner = "https://node-a.example/services/orb";

        assert!(storage.add_reference(RefKind::Follower, owner, "https://b.example").unwrap());
        assert!(storage.add_reference(RefKind::Follower, owner, "https://c.example").unwrap());
        assert!(!storage.add_reference(RefKind::Follower, owner, "https://b.example").unwrap());

        assert_eq!(
            storage.references(RefKind::Follower, owner).unwrap(),
            vec!["https://b.example".to_string(), "https://c.example".to_string()]
        );

        assert!(storage.remove_reference(RefKind::Follower, owner, "https://b.example").unwrap());
        assert!(!storage.has_reference(RefKind::Follower, owner, "https://b.example").unwrap());
        assert_eq!(storage.reference_count(RefKind::Follower, owner).unwrap(), 1);
    }

    #[test]
    fn test_cas_put_is_idempotent() {
        let (storage, _dir) = open_storage();
        let hl1 = storage.cas_put(b"content").unwrap();
        let hl2 = storage.cas_put(b"content").unwrap();
        assert_eq!(hl1, hl2);

        let hash = hashlink::get_resource_hash(&hl1).unwrap();
        assert_eq!(storage.cas_get(&hash).unwrap().unwrap(), b"content");
        assert!(storage.cas_get("uEiMissing").unwrap().is_none());
    }

    #[test]
    fn test_opqueue_conflict_on_same_slot() {
        let (storage, _dir) = open_storage();
        let factory_op = orb_core::operation::Operation {
            operation_type: orb_core::operation::OperationType::Deactivate,
            did_suffix: Some("EiAAA".to_string()),
            suffix_data: None,
            delta: None,
            signed_data: Some("a.b.c".to_string()),
        };
        let op = AnchoredOperation::unpublished(factory_op, 7);

        storage.queue_unpublished("EiAAA", &op).unwrap();
        let err = storage.queue_unpublished("EiAAA", &op).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        assert_eq!(storage.unpublished_for("EiAAA").unwrap().len(), 1);
        storage.remove_unpublished("EiAAA", 7).unwrap();
        assert!(storage.unpublished_for("EiAAA").unwrap().is_empty());
    }

    #[test]
    fn test_published_ordering() {
        let (storage, _dir) = open_storage();
        let base = orb_core::operation::Operation {
            operation_type: orb_core::operation::OperationType::Deactivate,
            did_suffix: Some("EiAAA".to_string()),
            suffix_data: None,
            delta: None,
            signed_data: Some("a.b.c".to_string()),
        };

        // inserted out of order; must come back ordered by (txn, index)
        for (txn, idx) in [(2u64, 0u64), (0, 1), (0, 0), (1, 5)] {
            let op = AnchoredOperation {
                operation: base.clone(),
                txn_number: Some(txn),
                op_index: idx,
                anchor: Some(format!("hl:anchor-{txn}-{idx}")),
            };
            storage.put_published(&op).unwrap();
        }

        let ops = storage.published_for("EiAAA").unwrap();
        let coords: Vec<(u64, u64)> = ops
            .iter()
            .map(|o| (o.txn_number.unwrap(), o.op_index))
            .collect();
        assert_eq!(coords, vec![(0, 0), (0, 1), (1, 5), (2, 0)]);
        assert_eq!(
            storage.latest_anchor("EiAAA").unwrap().unwrap(),
            "hl:anchor-2-0"
        );
    }

    #[test]
    fn test_monitor_status_transitions() {
        let (storage, _dir) = open_storage();
        let record = MonitorRecord {
            credential_id: "https://node-a.example/vc/1".to_string(),
            anchor: "uEiAnchor".to_string(),
            vc_hash: "uEiVc".to_string(),
            leaf_hash: "bGVhZg==".to_string(),
            expires_at: Utc::now(),
            status: MonitorStatus::NotConfirmed,
        };
        storage.put_monitor(&record).unwrap();
        assert_eq!(
            storage.monitors_with_status(MonitorStatus::NotConfirmed).unwrap().len(),
            1
        );

        let confirmed = storage
            .set_monitor_status(&record, MonitorStatus::Confirmed)
            .unwrap();
        assert!(storage.monitors_with_status(MonitorStatus::NotConfirmed).unwrap().is_empty());
        assert_eq!(
            storage.monitors_with_status(MonitorStatus::Confirmed).unwrap(),
            vec![confirmed]
        );
    }

    #[test]
    fn test_txn_counter_monotonic() {
        let (storage, _dir) = open_storage();
        let a = storage.next_txn_number().unwrap();
        let b = storage.next_txn_number().unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_active_log_roundtrip() {
        let (storage, _dir) = open_storage();
        assert!(storage.active_log().unwrap().is_none());

        storage.set_active_log("https://vct.example/log").unwrap();
        assert_eq!(
            storage.active_log().unwrap().unwrap(),
            "https://vct.example/log"
        );
        let record = storage
            .get_log_monitor("https://vct.example/log")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, LogStatus::Active);
    }
}
