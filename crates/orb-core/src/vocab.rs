//! ActivityPub vocabulary for anchor events
//!
//! Strongly typed variants over a closed sum. Serialization is JSON-LD
//! shaped but parsing is driven by the `type` discriminator; unknown
//! types are refused. Documents are compared after canonicalization.

use crate::canonical::canonical_eq;
use crate::error::{Error, Result};
use crate::hashlink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ActivityStreams JSON-LD context
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
/// Activity anchors extension context
pub const ANCHOR_CONTEXT: &str = "https://w3id.org/activityanchors/v1";
/// The public-addressing pseudo-recipient
pub const PUBLIC_IRI: &str = "https://www.w3.org/ns/activitystreams#Public";
/// Target IRI marking an Invite as a witness invitation
pub const ANCHOR_WITNESS_TARGET: &str = "https://w3id.org/activityanchors#AnchorWitness";

/// Closed set of activity variants
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Create,
    Announce,
    Follow,
    Accept,
    Reject,
    Invite,
    Offer,
    Like,
    Undo,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityType::Create => "Create",
            ActivityType::Announce => "Announce",
            ActivityType::Follow => "Follow",
            ActivityType::Accept => "Accept",
            ActivityType::Reject => "Reject",
            ActivityType::Invite => "Invite",
            ActivityType::Offer => "Offer",
            ActivityType::Like => "Like",
            ActivityType::Undo => "Undo",
        };
        f.write_str(s)
    }
}

/// IRI property that preserves single-vs-array JSON shape across
/// round-trips
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UrlProperty {
    Single(String),
    Multiple(Vec<String>),
}

impl UrlProperty {
    pub fn single(iri: impl Into<String>) -> Self {
        UrlProperty::Single(iri.into())
    }

    pub fn multiple(iris: Vec<String>) -> Self {
        UrlProperty::Multiple(iris)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            UrlProperty::Single(s) => std::slice::from_ref(s).iter().map(String::as_str),
            UrlProperty::Multiple(v) => v.as_slice().iter().map(String::as_str),
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.iter().next()
    }

    pub fn contains(&self, iri: &str) -> bool {
        self.iter().any(|s| s == iri)
    }
}

impl From<String> for UrlProperty {
    fn from(s: String) -> Self {
        UrlProperty::Single(s)
    }
}

impl From<&str> for UrlProperty {
    fn from(s: &str) -> Self {
        UrlProperty::Single(s.to_string())
    }
}

/// Object position of an activity: embedded anchor event, wrapped
/// activity, bare IRI, or an opaque document (e.g. a credential)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ObjectValue {
    AnchorEvent(Box<AnchorEvent>),
    Activity(Box<Activity>),
    Iri(String),
    Document(serde_json::Value),
}

impl ObjectValue {
    /// IRI of the object: the bare IRI, or the id of an embedded value
    pub fn iri(&self) -> Option<&str> {
        match self {
            ObjectValue::Iri(s) => Some(s),
            ObjectValue::Activity(a) => Some(&a.id),
            ObjectValue::AnchorEvent(e) => e.index.as_deref(),
            ObjectValue::Document(d) => d.get("id").and_then(|v| v.as_str()),
        }
    }

    pub fn as_anchor_event(&self) -> Option<&AnchorEvent> {
        match self {
            ObjectValue::AnchorEvent(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            ObjectValue::Activity(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            ObjectValue::Document(d) => Some(d),
            _ => None,
        }
    }
}

/// An ActivityPub activity
///
/// The `id` must be a stable URL owned by the emitter; it is the inbox
/// deduplication key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "@context")]
    pub context: UrlProperty,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<UrlProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    /// Result carried back on Accept (e.g. an embedded witness proof)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ObjectValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

impl Activity {
    /// New activity with the default context pair and no ID (the outbox
    /// assigns one on post)
    pub fn new(activity_type: ActivityType, actor: impl Into<String>) -> Self {
        Self {
            context: UrlProperty::Multiple(vec![
                ACTIVITY_STREAMS_CONTEXT.to_string(),
                ANCHOR_CONTEXT.to_string(),
            ]),
            id: String::new(),
            activity_type,
            actor: actor.into(),
            object: None,
            target: None,
            to: Vec::new(),
            result: None,
            published: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_object(mut self, object: ObjectValue) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_target(mut self, target: impl Into<UrlProperty>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_to(mut self, to: Vec<String>) -> Self {
        self.to = to;
        self
    }

    pub fn with_result(mut self, result: ObjectValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }

    /// IRI of the object position, if any
    pub fn object_iri(&self) -> Option<&str> {
        self.object.as_ref().and_then(ObjectValue::iri)
    }

    /// Whether the Invite targets the anchor-witness role
    pub fn is_witness_invite(&self) -> bool {
        self.activity_type == ActivityType::Invite
            && self
                .target
                .as_ref()
                .map(|t| t.contains(ANCHOR_WITNESS_TARGET))
                .unwrap_or(false)
    }

    /// Parse from JSON bytes, refusing unknown `type` tags
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let activity: Activity = serde_json::from_slice(bytes)?;
        if activity.actor.is_empty() {
            return Err(Error::MissingField("actor".to_string()));
        }
        Ok(activity)
    }

    /// Equality after canonicalization
    pub fn canonical_eq(&self, other: &Activity) -> bool {
        canonical_eq(self, other)
    }
}

/// The `type` discriminator of an anchor event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnchorEventTag {
    AnchorEvent,
}

/// The `type` discriminator of an anchor object attachment
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnchorObjectTag {
    AnchorObject,
}

/// An attachment of an anchor event: a content-addressed document,
/// optionally embedded
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnchorObject {
    #[serde(rename = "type")]
    pub tag: AnchorObjectTag,
    /// Hashlink of the content
    pub url: String,
    /// Embedded content; must re-hash to `url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_object: Option<serde_json::Value>,
    /// Profile IRI of the generator that produced the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

/// The ActivityPub carrier of one anchor linkset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnchorEvent {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<UrlProperty>,
    #[serde(rename = "type")]
    pub tag: AnchorEventTag,
    /// Hashlink of the anchor linkset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// IRI of the originating service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<String>,
    /// Ancestor anchor hashlinks, denormalized for fast fetch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<AnchorObject>,
}

impl AnchorEvent {
    pub fn new(index: impl Into<String>, attributed_to: impl Into<String>) -> Self {
        Self {
            context: Some(UrlProperty::multiple(vec![
                ACTIVITY_STREAMS_CONTEXT.to_string(),
                ANCHOR_CONTEXT.to_string(),
            ])),
            tag: AnchorEventTag::AnchorEvent,
            index: Some(index.into()),
            attributed_to: Some(attributed_to.into()),
            parent: Vec::new(),
            published: None,
            attachment: Vec::new(),
        }
    }

    /// Validate that every embedded content object re-hashes to its
    /// attachment URL
    pub fn validate(&self) -> Result<()> {
        if self.index.is_none() {
            return Err(Error::MissingField("index".to_string()));
        }
        for att in &self.attachment {
            if let Some(content) = &att.content_object {
                let bytes = crate::canonical::canonical_bytes(content)?;
                hashlink::verify(&bytes, &att.url)?;
            }
        }
        Ok(())
    }

    /// Attachment whose URL matches the given hashlink (metadata ignored)
    pub fn attachment_for(&self, url: &str) -> Option<&AnchorObject> {
        let wanted = hashlink::get_resource_hash(url).ok()?;
        self.attachment
            .iter()
            .find(|a| hashlink::get_resource_hash(&a.url).ok().as_deref() == Some(&wanted))
    }

    /// The attachment carrying the linkset itself (URL matches `index`)
    pub fn linkset_attachment(&self) -> Option<&AnchorObject> {
        self.index.as_deref().and_then(|idx| self.attachment_for(idx))
    }
}
