//! Protocol object and message types.
//!
//! ## Wire summary
//! - Objects are carried as a canonical CBOR envelope
//!   `{v: value, c: [channel attestation], a?: [allowed attestation], n: nonce}`
//!   whose bytes are content-addressed with a sha2-256 multihash; the object
//!   URL binds the author's actor id to that address.
//! - Values are canonicalized as sorted-key maps before encoding, so equal
//!   values always produce equal bytes.
//! - Channel attestations align with wire tags positionally: `c[i]` must
//!   verify against `tags[i]`. Implementations must preserve this alignment
//!   through every intermediate representation.
//! - Announcements are `{t: tags, o: object, m: metadata}` messages; the
//!   metadata map is itself CBOR, with the `s`/`n` keys marking the owner's
//!   self-copy and `a`/`i` marking a per-recipient delivery.

use ciborium::Value;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::crypto::{
    attest_allowed_with_rng, attest_channel, validate_allowed, validate_channel,
};
use crate::error::GraffitiError;

/// Envelope bytes above this size are refused at encode time.
pub const MAX_OBJECT_SIZE_BYTES: usize = 32 * 1024;

/// Combined channels + recipients above this count are refused at encode
/// time, before any bucket write. The envelope size cap implies the same
/// order of magnitude; this makes the limit explicit.
pub const MAX_FANOUT: usize = 1000;

/// URL scheme for object URLs.
pub const URL_SCHEME: &str = "graffiti";

const MULTIHASH_SHA2_256: u8 = 0x12;
const MULTIHASH_SHA2_256_LEN: u8 = 0x20;

/// Length of a content address: two-byte multihash prefix plus digest.
pub const CONTENT_ADDRESS_LEN: usize = 34;

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

pub(crate) fn cbor_text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub(crate) fn cbor_bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

pub(crate) fn cbor_uint(n: u64) -> Value {
    Value::Integer(n.into())
}

/// Encode a CBOR value to bytes.
pub(crate) fn cbor_to_vec(value: &Value) -> Result<Vec<u8>, GraffitiError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| GraffitiError::ProtocolViolation(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Decode bytes into a CBOR value.
pub(crate) fn cbor_from_slice(bytes: &[u8]) -> Result<Value, GraffitiError> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| GraffitiError::ProtocolViolation(format!("cbor decode: {e}")))
}

/// Convert a JSON value to its canonical CBOR form (sorted-key maps).
pub(crate) fn json_to_cbor(value: &serde_json::Value) -> Result<Value, GraffitiError> {
    Value::serialized(value)
        .map_err(|e| GraffitiError::ProtocolViolation(format!("value to cbor: {e}")))
}

/// Convert a CBOR value back to JSON. Fails on CBOR-only constructs such as
/// byte strings; object values are JSON-like by construction.
pub(crate) fn cbor_to_json(value: &Value) -> Result<serde_json::Value, GraffitiError> {
    value
        .deserialized()
        .map_err(|e| GraffitiError::ProtocolViolation(format!("cbor to value: {e}")))
}

fn expect_map(value: &Value, what: &str) -> Result<Vec<(Value, Value)>, GraffitiError> {
    match value {
        Value::Map(entries) => Ok(entries.clone()),
        _ => Err(GraffitiError::ProtocolViolation(format!("{what}: not a map"))),
    }
}

fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(text) if text == key => Some(v),
        _ => None,
    })
}

fn expect_text(value: &Value, what: &str) -> Result<String, GraffitiError> {
    match value {
        Value::Text(text) => Ok(text.clone()),
        _ => Err(GraffitiError::ProtocolViolation(format!("{what}: not text"))),
    }
}

fn expect_bytes(value: &Value, what: &str) -> Result<Vec<u8>, GraffitiError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        _ => Err(GraffitiError::ProtocolViolation(format!(
            "{what}: not a byte string"
        ))),
    }
}

fn expect_uint(value: &Value, what: &str) -> Result<u64, GraffitiError> {
    match value {
        Value::Integer(n) => u64::try_from(*n)
            .map_err(|_| GraffitiError::ProtocolViolation(format!("{what}: negative integer"))),
        _ => Err(GraffitiError::ProtocolViolation(format!(
            "{what}: not an integer"
        ))),
    }
}

fn expect_array(value: &Value, what: &str) -> Result<Vec<Value>, GraffitiError> {
    match value {
        Value::Array(entries) => Ok(entries.clone()),
        _ => Err(GraffitiError::ProtocolViolation(format!(
            "{what}: not an array"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Content addresses
// ---------------------------------------------------------------------------

/// Supported content-address hash methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Sha2_256,
}

/// A multihash-prefixed content address: `0x12 0x20 || sha256(bytes)`.
///
/// Idempotent (same input, same address) and unique (different inputs
/// collide only with negligible probability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentAddress([u8; CONTENT_ADDRESS_LEN]);

impl ContentAddress {
    /// Hash `bytes` under the given method.
    pub fn digest(method: HashMethod, bytes: &[u8]) -> Self {
        match method {
            HashMethod::Sha2_256 => {
                let mut address = [0u8; CONTENT_ADDRESS_LEN];
                address[0] = MULTIHASH_SHA2_256;
                address[1] = MULTIHASH_SHA2_256_LEN;
                address[2..].copy_from_slice(&Sha256::digest(bytes));
                ContentAddress(address)
            }
        }
    }

    /// Parse an address, validating the multihash prefix and length.
    pub fn parse(bytes: &[u8]) -> Result<Self, GraffitiError> {
        if bytes.len() != CONTENT_ADDRESS_LEN {
            return Err(GraffitiError::ProtocolViolation(format!(
                "content address must be {CONTENT_ADDRESS_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != MULTIHASH_SHA2_256 || bytes[1] != MULTIHASH_SHA2_256_LEN {
            return Err(GraffitiError::ProtocolViolation(format!(
                "unsupported multihash prefix {:#04x} {:#04x}",
                bytes[0], bytes[1]
            )));
        }
        let mut address = [0u8; CONTENT_ADDRESS_LEN];
        address.copy_from_slice(bytes);
        Ok(ContentAddress(address))
    }

    /// Recover the hash method from the address prefix.
    pub fn method(&self) -> HashMethod {
        HashMethod::Sha2_256
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_ADDRESS_LEN] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Object URLs
// ---------------------------------------------------------------------------

/// Build an object URL: `graffiti:{enc(actor)}:{enc(encoded address)}`.
pub fn encode_object_url(actor: &str, address: &ContentAddress) -> String {
    format!(
        "{}:{}:{}",
        URL_SCHEME,
        codec::escape_component(actor),
        codec::escape_component(&codec::encode_bytes(address.as_bytes()))
    )
}

/// Decode an object URL into its actor and content address. Any deviation
/// from the grammar is a decode failure.
pub fn decode_object_url(url: &str) -> Result<(String, ContentAddress), GraffitiError> {
    let rest = url.strip_prefix(URL_SCHEME).and_then(|r| r.strip_prefix(':'))
        .ok_or_else(|| GraffitiError::ProtocolViolation(format!("not a {URL_SCHEME} url: {url}")))?;
    let mut parts = rest.split(':');
    let (actor_part, address_part) = match (parts.next(), parts.next(), parts.next()) {
        (Some(actor), Some(address), None) if !actor.is_empty() && !address.is_empty() => {
            (actor, address)
        }
        _ => {
            return Err(GraffitiError::ProtocolViolation(format!(
                "malformed object url: {url}"
            )))
        }
    };
    let actor = codec::unescape_component(actor_part)?;
    let encoded_address = codec::unescape_component(address_part)?;
    let address_bytes = codec::decode_bytes(&encoded_address)?;
    let address = ContentAddress::parse(&address_bytes)?;
    Ok((actor, address))
}

/// The tag under which an announcement is filed for per-URL lookup.
pub fn url_tag(url: &str) -> Vec<u8> {
    url.as_bytes().to_vec()
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// A post as supplied by the caller, before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialObject {
    /// JSON-like object value.
    pub value: serde_json::Value,
    /// Channels the object is announced under. Secret capabilities; only
    /// their derived public ids leave the client.
    pub channels: Vec<String>,
    /// `None` means public; an array (including empty) means private.
    pub allowed: Option<Vec<String>>,
}

/// The public-facing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub url: String,
    pub actor: String,
    pub value: serde_json::Value,
    pub channels: Vec<String>,
    pub allowed: Option<Vec<String>>,
}

impl Object {
    /// Copy for delivery to one allowed recipient: all channels masked out,
    /// `allowed` reduced to that recipient alone.
    pub fn masked_for_recipient(&self, recipient: &str) -> Object {
        Object {
            url: self.url.clone(),
            actor: self.actor.clone(),
            value: self.value.clone(),
            channels: Vec::new(),
            allowed: Some(vec![recipient.to_string()]),
        }
    }

    /// Copy for delivery to a shared inbox: all channels masked out, public
    /// form.
    pub fn masked_public(&self) -> Object {
        Object {
            url: self.url.clone(),
            actor: self.actor.clone(),
            value: self.value.clone(),
            channels: Vec::new(),
            allowed: None,
        }
    }
}

/// Result of encoding a [`PartialObject`].
#[derive(Debug, Clone)]
pub struct EncodedObject {
    pub object: Object,
    /// Channel public ids, one per channel, in channel order.
    pub tags: Vec<Vec<u8>>,
    /// Canonical envelope bytes; these are what the URL addresses.
    pub bytes: Vec<u8>,
    /// Per-recipient tickets when the object is private, in `allowed` order.
    pub allowed_tickets: Option<Vec<Vec<u8>>>,
}

/// Encode a post: derive channel attestations and tags, mint recipient
/// tickets, build the canonical envelope, and compute the object URL.
pub fn encode_object(partial: &PartialObject, actor: &str) -> Result<EncodedObject, GraffitiError> {
    encode_object_with_rng(partial, actor, &mut OsRng)
}

/// [`encode_object`] with a caller-supplied RNG.
pub fn encode_object_with_rng(
    partial: &PartialObject,
    actor: &str,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<EncodedObject, GraffitiError> {
    let recipients = partial.allowed.as_ref().map(|a| a.len()).unwrap_or(0);
    if partial.channels.len() + recipients > MAX_FANOUT {
        return Err(GraffitiError::TooLarge(format!(
            "{} channels + recipients exceed the fan-out limit of {MAX_FANOUT}",
            partial.channels.len() + recipients
        )));
    }

    let mut tags = Vec::with_capacity(partial.channels.len());
    let mut channel_attestations = Vec::with_capacity(partial.channels.len());
    for channel in &partial.channels {
        let (attestation, public_id) = attest_channel(actor, channel);
        tags.push(public_id.to_vec());
        channel_attestations.push(attestation.to_vec());
    }

    let mut allowed_attestations: Option<Vec<Vec<u8>>> = None;
    let mut allowed_tickets: Option<Vec<Vec<u8>>> = None;
    if let Some(recipients) = &partial.allowed {
        let mut attestations = Vec::with_capacity(recipients.len());
        let mut tickets = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let (attestation, ticket) = attest_allowed_with_rng(recipient, rng);
            attestations.push(attestation.to_vec());
            tickets.push(ticket.to_vec());
        }
        allowed_attestations = Some(attestations);
        allowed_tickets = Some(tickets);
    }

    let mut nonce = [0u8; 32];
    rng.fill_bytes(&mut nonce);

    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(4);
    entries.push((cbor_text("v"), json_to_cbor(&partial.value)?));
    entries.push((
        cbor_text("c"),
        Value::Array(channel_attestations.iter().map(|a| cbor_bytes(a)).collect()),
    ));
    if let Some(attestations) = &allowed_attestations {
        entries.push((
            cbor_text("a"),
            Value::Array(attestations.iter().map(|a| cbor_bytes(a)).collect()),
        ));
    }
    entries.push((cbor_text("n"), cbor_bytes(&nonce)));

    let bytes = cbor_to_vec(&Value::Map(entries))?;
    if bytes.len() > MAX_OBJECT_SIZE_BYTES {
        return Err(GraffitiError::TooLarge(format!(
            "envelope is {} bytes, limit is {MAX_OBJECT_SIZE_BYTES}",
            bytes.len()
        )));
    }

    let address = ContentAddress::digest(HashMethod::Sha2_256, &bytes);
    let url = encode_object_url(actor, &address);

    Ok(EncodedObject {
        object: Object {
            url,
            actor: actor.to_string(),
            value: partial.value.clone(),
            channels: partial.channels.clone(),
            allowed: partial.allowed.clone(),
        },
        tags,
        bytes,
        allowed_tickets,
    })
}

/// What the validator knows about a private envelope.
#[derive(Debug, Clone)]
pub enum PrivateInfo<'a> {
    /// Validating our own self-copy: we hold every ticket and the full
    /// recipient list.
    Owner {
        recipients: &'a [String],
        tickets: &'a [Vec<u8>],
    },
    /// Validating a delivery addressed to us: one ticket, and our index in
    /// the original allowed list.
    Recipient {
        recipient: &'a str,
        ticket: &'a [u8],
        index: usize,
    },
}

/// Validate envelope bytes against an object URL, an expected value, and
/// the tags the announcement carried.
///
/// Checks, in order: the bytes hash to the URL's content address; the
/// envelope decodes; the embedded value equals `expected_value` byte-for-
/// byte in canonical form; `c[i]` verifies against `received_tags[i]` for
/// the URL's actor; and the `a` list agrees with `private_info` (absent for
/// public envelopes, fully checked for the owner, spot-checked at the
/// recipient's index for deliveries).
pub fn validate_object(
    url: &str,
    expected_value: &serde_json::Value,
    received_tags: &[Vec<u8>],
    object_bytes: &[u8],
    private_info: Option<PrivateInfo<'_>>,
) -> Result<(), GraffitiError> {
    let (actor, address) = decode_object_url(url)?;
    let computed = ContentAddress::digest(address.method(), object_bytes);
    if computed != address {
        return Err(GraffitiError::ProtocolViolation(
            "object bytes hash to a different content address".into(),
        ));
    }

    let envelope = cbor_from_slice(object_bytes)?;
    let entries = expect_map(&envelope, "envelope")?;

    let value = map_get(&entries, "v")
        .ok_or_else(|| GraffitiError::ProtocolViolation("envelope missing value".into()))?;
    let received = cbor_to_vec(value)?;
    let expected = cbor_to_vec(&json_to_cbor(expected_value)?)?;
    if received != expected {
        return Err(GraffitiError::ProtocolViolation(
            "envelope value differs from announced value".into(),
        ));
    }

    let nonce = map_get(&entries, "n")
        .ok_or_else(|| GraffitiError::ProtocolViolation("envelope missing nonce".into()))?;
    if expect_bytes(nonce, "envelope nonce")?.len() != 32 {
        return Err(GraffitiError::ProtocolViolation(
            "envelope nonce must be 32 bytes".into(),
        ));
    }

    let channel_attestations = expect_array(
        map_get(&entries, "c")
            .ok_or_else(|| GraffitiError::ProtocolViolation("envelope missing attestations".into()))?,
        "channel attestations",
    )?;
    // Attestations align positionally with the leading channel tags. A
    // message may carry one trailing per-URL lookup tag beyond them, which
    // needs no attestation but must name this very object; anything else
    // is an unattested channel claim.
    if channel_attestations.len() > received_tags.len() {
        return Err(GraffitiError::ProtocolViolation(format!(
            "{} channel attestations for {} tags",
            channel_attestations.len(),
            received_tags.len()
        )));
    }
    for (index, attestation) in channel_attestations.iter().enumerate() {
        let attestation = expect_bytes(attestation, "channel attestation")?;
        validate_channel(&attestation, &actor, &received_tags[index])?;
    }
    for extra in &received_tags[channel_attestations.len()..] {
        if extra != url.as_bytes() {
            return Err(GraffitiError::ProtocolViolation(
                "tag beyond the attested channels is not the object url".into(),
            ));
        }
    }

    let allowed_attestations = match map_get(&entries, "a") {
        Some(value) => Some(expect_array(value, "allowed attestations")?),
        None => None,
    };

    match (private_info, allowed_attestations) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(GraffitiError::ProtocolViolation(
            "public envelope carries allowed attestations".into(),
        )),
        (Some(_), None) => Err(GraffitiError::ProtocolViolation(
            "private envelope missing allowed attestations".into(),
        )),
        (Some(PrivateInfo::Owner { recipients, tickets }), Some(attestations)) => {
            if attestations.len() != tickets.len() || recipients.len() != tickets.len() {
                return Err(GraffitiError::ProtocolViolation(format!(
                    "{} allowed attestations for {} tickets",
                    attestations.len(),
                    tickets.len()
                )));
            }
            for (index, recipient) in recipients.iter().enumerate() {
                let attestation = expect_bytes(&attestations[index], "allowed attestation")?;
                validate_allowed(&attestation, recipient, &tickets[index])?;
            }
            Ok(())
        }
        (
            Some(PrivateInfo::Recipient {
                recipient,
                ticket,
                index,
            }),
            Some(attestations),
        ) => {
            let attestation = attestations.get(index).ok_or_else(|| {
                GraffitiError::ProtocolViolation(format!(
                    "allowed index {index} out of range ({} attestations)",
                    attestations.len()
                ))
            })?;
            let attestation = expect_bytes(attestation, "allowed attestation")?;
            validate_allowed(&attestation, recipient, ticket)?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Server-assigned message labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Unlabeled,
    Valid,
    Trash,
    Invalid,
}

impl Label {
    pub fn as_u64(self) -> u64 {
        match self {
            Label::Unlabeled => 0,
            Label::Valid => 1,
            Label::Trash => 2,
            Label::Invalid => 3,
        }
    }

    pub fn from_u64(value: u64) -> Result<Self, GraffitiError> {
        match value {
            0 => Ok(Label::Unlabeled),
            1 => Ok(Label::Valid),
            2 => Ok(Label::Trash),
            3 => Ok(Label::Invalid),
            other => Err(GraffitiError::ProtocolViolation(format!(
                "unknown label: {other}"
            ))),
        }
    }
}

/// Where a prior announcement landed; stored in the owner's self-copy so a
/// later tombstone can name the exact message each server should collapse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Message id the destination returned.
    pub id: String,
    /// Shared-inbox endpoint, for public announcements.
    pub endpoint: Option<String>,
    /// Recipient actor, for per-recipient announcements.
    pub actor: Option<String>,
}

/// Announcement metadata common to every delivery form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaBase {
    /// Storage-bucket key holding the envelope bytes.
    pub bucket_key: String,
    /// Message id of a prior announcement this one tombstones.
    pub tombstone_of: Option<String>,
}

/// The metadata map, a tagged sum decoded by its discriminating keys:
/// `s`/`n` mark the owner's self-copy, `a` marks a per-recipient delivery,
/// and the base form is used only for masked deliveries to shared inboxes.
/// Exactly one discriminant may be set.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageMeta {
    /// Masked delivery to a shared inbox.
    Shared { base: MetaBase },
    /// The owner's self-copy: every ticket plus the receipts of all other
    /// announcements for the same object.
    Owner {
        base: MetaBase,
        tickets: Option<Vec<Vec<u8>>>,
        receipts: Vec<Receipt>,
    },
    /// Delivery to one allowed recipient: that recipient's ticket and its
    /// index in the allowed list.
    Recipient {
        base: MetaBase,
        ticket: Vec<u8>,
        index: u64,
    },
}

impl MessageMeta {
    pub fn base(&self) -> &MetaBase {
        match self {
            MessageMeta::Shared { base } => base,
            MessageMeta::Owner { base, .. } => base,
            MessageMeta::Recipient { base, .. } => base,
        }
    }

    /// Encode to the wire metadata map.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GraffitiError> {
        let mut entries: Vec<(Value, Value)> = Vec::new();
        let base = self.base();
        entries.push((cbor_text("k"), cbor_text(&base.bucket_key)));
        if let Some(prior) = &base.tombstone_of {
            entries.push((cbor_text("t"), cbor_text(prior)));
        }
        match self {
            MessageMeta::Shared { .. } => {}
            MessageMeta::Owner { tickets, receipts, .. } => {
                if let Some(tickets) = tickets {
                    entries.push((
                        cbor_text("s"),
                        Value::Array(tickets.iter().map(|t| cbor_bytes(t)).collect()),
                    ));
                }
                let receipts = receipts
                    .iter()
                    .map(|receipt| {
                        let mut fields = vec![(cbor_text("id"), cbor_text(&receipt.id))];
                        if let Some(endpoint) = &receipt.endpoint {
                            fields.push((cbor_text("e"), cbor_text(endpoint)));
                        }
                        if let Some(actor) = &receipt.actor {
                            fields.push((cbor_text("a"), cbor_text(actor)));
                        }
                        Value::Map(fields)
                    })
                    .collect();
                entries.push((cbor_text("n"), Value::Array(receipts)));
            }
            MessageMeta::Recipient { ticket, index, .. } => {
                entries.push((cbor_text("a"), cbor_bytes(ticket)));
                entries.push((cbor_text("i"), cbor_uint(*index)));
            }
        }
        cbor_to_vec(&Value::Map(entries))
    }

    /// Decode the wire metadata map, classifying by discriminating keys.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraffitiError> {
        let value = cbor_from_slice(bytes)?;
        let entries = expect_map(&value, "metadata")?;

        let bucket_key = expect_text(
            map_get(&entries, "k")
                .ok_or_else(|| GraffitiError::ProtocolViolation("metadata missing bucket key".into()))?,
            "metadata bucket key",
        )?;
        let tombstone_of = match map_get(&entries, "t") {
            Some(value) => Some(expect_text(value, "metadata tombstone id")?),
            None => None,
        };
        let base = MetaBase {
            bucket_key,
            tombstone_of,
        };

        let owner_keys = map_get(&entries, "s").is_some() || map_get(&entries, "n").is_some();
        let recipient_keys = map_get(&entries, "a").is_some() || map_get(&entries, "i").is_some();
        if owner_keys && recipient_keys {
            return Err(GraffitiError::ProtocolViolation(
                "metadata sets both owner and recipient keys".into(),
            ));
        }

        if owner_keys {
            let tickets = match map_get(&entries, "s") {
                Some(value) => {
                    let mut tickets = Vec::new();
                    for entry in expect_array(value, "metadata tickets")? {
                        tickets.push(expect_bytes(&entry, "metadata ticket")?);
                    }
                    Some(tickets)
                }
                None => None,
            };
            let mut receipts = Vec::new();
            if let Some(value) = map_get(&entries, "n") {
                for entry in expect_array(value, "metadata receipts")? {
                    let fields = expect_map(&entry, "receipt")?;
                    let id = expect_text(
                        map_get(&fields, "id").ok_or_else(|| {
                            GraffitiError::ProtocolViolation("receipt missing id".into())
                        })?,
                        "receipt id",
                    )?;
                    let endpoint = match map_get(&fields, "e") {
                        Some(value) => Some(expect_text(value, "receipt endpoint")?),
                        None => None,
                    };
                    let actor = match map_get(&fields, "a") {
                        Some(value) => Some(expect_text(value, "receipt actor")?),
                        None => None,
                    };
                    receipts.push(Receipt { id, endpoint, actor });
                }
            }
            return Ok(MessageMeta::Owner {
                base,
                tickets,
                receipts,
            });
        }

        if recipient_keys {
            let ticket = expect_bytes(
                map_get(&entries, "a").ok_or_else(|| {
                    GraffitiError::ProtocolViolation("recipient metadata missing ticket".into())
                })?,
                "metadata ticket",
            )?;
            let index = expect_uint(
                map_get(&entries, "i").ok_or_else(|| {
                    GraffitiError::ProtocolViolation("recipient metadata missing index".into())
                })?,
                "metadata index",
            )?;
            return Ok(MessageMeta::Recipient {
                base,
                ticket,
                index,
            });
        }

        Ok(MessageMeta::Shared { base })
    }
}

/// A wire message: tags, embedded object, opaque metadata.
///
/// The metadata stays raw bytes at this layer; consumers parse it with
/// [`MessageMeta::from_bytes`] so one malformed message can be labeled
/// invalid without poisoning the page it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub tags: Vec<Vec<u8>>,
    pub object: Object,
    pub meta: Vec<u8>,
}

fn object_to_cbor(object: &Object) -> Result<Value, GraffitiError> {
    let allowed = match &object.allowed {
        None => Value::Null,
        Some(recipients) => Value::Array(recipients.iter().map(|r| cbor_text(r)).collect()),
    };
    Ok(Value::Map(vec![
        (cbor_text("url"), cbor_text(&object.url)),
        (cbor_text("actor"), cbor_text(&object.actor)),
        (cbor_text("value"), json_to_cbor(&object.value)?),
        (
            cbor_text("channels"),
            Value::Array(object.channels.iter().map(|c| cbor_text(c)).collect()),
        ),
        (cbor_text("allowed"), allowed),
    ]))
}

fn object_from_cbor(value: &Value) -> Result<Object, GraffitiError> {
    let entries = expect_map(value, "object")?;
    let url = expect_text(
        map_get(&entries, "url")
            .ok_or_else(|| GraffitiError::ProtocolViolation("object missing url".into()))?,
        "object url",
    )?;
    let actor = expect_text(
        map_get(&entries, "actor")
            .ok_or_else(|| GraffitiError::ProtocolViolation("object missing actor".into()))?,
        "object actor",
    )?;
    let object_value = cbor_to_json(
        map_get(&entries, "value")
            .ok_or_else(|| GraffitiError::ProtocolViolation("object missing value".into()))?,
    )?;
    let mut channels = Vec::new();
    if let Some(value) = map_get(&entries, "channels") {
        for entry in expect_array(value, "object channels")? {
            channels.push(expect_text(&entry, "object channel")?);
        }
    }
    let allowed = match map_get(&entries, "allowed") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let mut recipients = Vec::new();
            for entry in expect_array(value, "object allowed")? {
                recipients.push(expect_text(&entry, "object allowed entry")?);
            }
            Some(recipients)
        }
    };
    Ok(Object {
        url,
        actor,
        value: object_value,
        channels,
        allowed,
    })
}

impl Message {
    /// Build a message from typed metadata.
    pub fn new(tags: Vec<Vec<u8>>, object: Object, meta: &MessageMeta) -> Result<Self, GraffitiError> {
        Ok(Message {
            tags,
            object,
            meta: meta.to_bytes()?,
        })
    }

    /// Parse the opaque metadata bytes.
    pub fn parse_meta(&self) -> Result<MessageMeta, GraffitiError> {
        MessageMeta::from_bytes(&self.meta)
    }

    /// Encode for `PUT /send`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GraffitiError> {
        let value = Value::Map(vec![
            (
                cbor_text("t"),
                Value::Array(self.tags.iter().map(|t| cbor_bytes(t)).collect()),
            ),
            (cbor_text("o"), object_to_cbor(&self.object)?),
            (cbor_text("m"), cbor_bytes(&self.meta)),
        ]);
        cbor_to_vec(&value)
    }

    pub fn from_cbor(value: &Value) -> Result<Self, GraffitiError> {
        let entries = expect_map(value, "message")?;
        let mut tags = Vec::new();
        if let Some(value) = map_get(&entries, "t") {
            for entry in expect_array(value, "message tags")? {
                tags.push(expect_bytes(&entry, "message tag")?);
            }
        }
        let object = object_from_cbor(
            map_get(&entries, "o")
                .ok_or_else(|| GraffitiError::ProtocolViolation("message missing object".into()))?,
        )?;
        let meta = expect_bytes(
            map_get(&entries, "m")
                .ok_or_else(|| GraffitiError::ProtocolViolation("message missing metadata".into()))?,
            "message metadata",
        )?;
        Ok(Message { tags, object, meta })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraffitiError> {
        Message::from_cbor(&cbor_from_slice(bytes)?)
    }
}

/// A message plus the label its server has assigned it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMessage {
    pub id: String,
    pub message: Message,
    pub label: Label,
}

impl LabeledMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, GraffitiError> {
        let message_value = cbor_from_slice(&self.message.to_bytes()?)?;
        let value = Value::Map(vec![
            (cbor_text("id"), cbor_text(&self.id)),
            (cbor_text("m"), message_value),
            (cbor_text("l"), cbor_uint(self.label.as_u64())),
        ]);
        cbor_to_vec(&value)
    }

    pub fn from_cbor(value: &Value) -> Result<Self, GraffitiError> {
        let entries = expect_map(value, "labeled message")?;
        let id = expect_text(
            map_get(&entries, "id")
                .ok_or_else(|| GraffitiError::ProtocolViolation("labeled message missing id".into()))?,
            "labeled message id",
        )?;
        let message = Message::from_cbor(map_get(&entries, "m").ok_or_else(|| {
            GraffitiError::ProtocolViolation("labeled message missing body".into())
        })?)?;
        let label = Label::from_u64(expect_uint(
            map_get(&entries, "l").ok_or_else(|| {
                GraffitiError::ProtocolViolation("labeled message missing label".into())
            })?,
            "message label",
        )?)?;
        Ok(LabeledMessage { id, message, label })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraffitiError> {
        LabeledMessage::from_cbor(&cbor_from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Wire bodies
// ---------------------------------------------------------------------------

/// Body of the first `POST /query` page: `{tags, schema}`.
pub fn encode_query_body(
    tags: &[Vec<u8>],
    schema: &serde_json::Value,
) -> Result<Vec<u8>, GraffitiError> {
    cbor_to_vec(&Value::Map(vec![
        (
            cbor_text("tags"),
            Value::Array(tags.iter().map(|t| cbor_bytes(t)).collect()),
        ),
        (cbor_text("schema"), json_to_cbor(schema)?),
    ]))
}

/// Body of `PUT /label/{id}`: `{l}`.
pub fn encode_label_body(label: Label) -> Result<Vec<u8>, GraffitiError> {
    cbor_to_vec(&Value::Map(vec![(
        cbor_text("l"),
        cbor_uint(label.as_u64()),
    )]))
}

/// Response of `PUT /send`: `{id}`.
pub fn decode_send_response(bytes: &[u8]) -> Result<String, GraffitiError> {
    let value = cbor_from_slice(bytes)?;
    let entries = expect_map(&value, "send response")?;
    expect_text(
        map_get(&entries, "id")
            .ok_or_else(|| GraffitiError::ProtocolViolation("send response missing id".into()))?,
        "send response id",
    )
}

/// One page of query or export results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub results: Vec<LabeledMessage>,
    pub has_more: bool,
    pub cursor: Option<String>,
}

/// Response of `POST /query` and `POST /export`:
/// `{results, hasMore, cursor}`.
pub fn decode_query_page(bytes: &[u8]) -> Result<QueryPage, GraffitiError> {
    let value = cbor_from_slice(bytes)?;
    let entries = expect_map(&value, "query page")?;
    let mut results = Vec::new();
    if let Some(value) = map_get(&entries, "results") {
        for entry in expect_array(value, "query results")? {
            results.push(LabeledMessage::from_cbor(&entry)?);
        }
    }
    let has_more = match map_get(&entries, "hasMore") {
        Some(Value::Bool(flag)) => *flag,
        Some(_) => {
            return Err(GraffitiError::ProtocolViolation(
                "query page hasMore is not a bool".into(),
            ))
        }
        None => false,
    };
    let cursor = match map_get(&entries, "cursor") {
        Some(Value::Null) | None => None,
        Some(value) => Some(expect_text(value, "query page cursor")?),
    };
    Ok(QueryPage {
        results,
        has_more,
        cursor,
    })
}

/// One page of a bucket export: `{keys, cursor?}`.
#[derive(Debug, Clone)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

pub fn decode_key_page(bytes: &[u8]) -> Result<KeyPage, GraffitiError> {
    let value = cbor_from_slice(bytes)?;
    let entries = expect_map(&value, "export page")?;
    let mut keys = Vec::new();
    if let Some(value) = map_get(&entries, "keys") {
        for entry in expect_array(value, "export keys")? {
            keys.push(expect_text(&entry, "export key")?);
        }
    }
    let cursor = match map_get(&entries, "cursor") {
        Some(Value::Null) | None => None,
        Some(value) => Some(expect_text(value, "export cursor")?),
    };
    Ok(KeyPage { keys, cursor })
}
