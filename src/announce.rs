//! Announcement engine.
//!
//! Posting an object means writing its envelope bytes into the actor's own
//! bucket, then dispatching tagged messages: one per allowed recipient
//! (masked, carrying that recipient's ticket), or one per configured
//! shared inbox (masked, public), and always a self-announcement to the
//! actor's personal inbox carrying the full object, every ticket, and the
//! receipts of the other deliveries. Those receipts are what a later
//! tombstone uses to name the exact prior message each server should
//! collapse.
//!
//! Failures toward individual recipients or shared inboxes are logged and
//! reported, but only a failed self-announcement fails the operation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::bucket::BucketClient;
use crate::error::GraffitiError;
use crate::glog;
use crate::identity::{IdentityResolver, PERSONAL_INBOX_SERVICE};
use crate::inbox::InboxClient;
use crate::logging;
use crate::protocol::{Message, MessageMeta, MetaBase, Object, Receipt};
use crate::session::Session;

/// Byte length of random bucket keys before encoding.
const BUCKET_KEY_BYTES: usize = 24;

/// A fresh random bucket key. New randomness per post, even for identical
/// values, so bucket keys never collide or become guessable.
pub fn random_bucket_key() -> String {
    random_bucket_key_with_rng(&mut OsRng)
}

/// [`random_bucket_key`] with a caller-supplied RNG.
pub fn random_bucket_key_with_rng(rng: &mut (impl RngCore + CryptoRng)) -> String {
    let mut key = [0u8; BUCKET_KEY_BYTES];
    rng.fill_bytes(&mut key);
    URL_SAFE_NO_PAD.encode(key)
}

/// Receipts of a prior announcement round, read back from the self-copy's
/// metadata when emitting a tombstone.
#[derive(Debug, Clone)]
pub struct PriorAnnouncements {
    /// Message id of the prior self-announcement.
    pub self_id: String,
    /// Receipts of the prior per-recipient or shared-inbox deliveries.
    pub receipts: Vec<Receipt>,
}

impl PriorAnnouncements {
    fn for_recipient(&self, actor: &str) -> Option<String> {
        self.receipts
            .iter()
            .find(|r| r.actor.as_deref() == Some(actor))
            .map(|r| r.id.clone())
    }

    fn for_endpoint(&self, endpoint: &str) -> Option<String> {
        self.receipts
            .iter()
            .find(|r| r.endpoint.as_deref() == Some(endpoint))
            .map(|r| r.id.clone())
    }
}

/// One failed delivery during fan-out.
#[derive(Debug)]
pub struct AnnounceFailure {
    /// Recipient actor or shared-inbox endpoint.
    pub destination: String,
    pub error: GraffitiError,
}

/// Outcome of an announcement round.
#[derive(Debug)]
pub struct AnnounceOutcome {
    pub self_message_id: String,
    pub receipts: Vec<Receipt>,
    pub failures: Vec<AnnounceFailure>,
}

/// Dispatches announcements for one session.
#[derive(Clone)]
pub struct Announcer {
    inbox: InboxClient,
    bucket: BucketClient,
    resolver: Arc<dyn IdentityResolver>,
}

impl Announcer {
    pub fn new(inbox: InboxClient, bucket: BucketClient, resolver: Arc<dyn IdentityResolver>) -> Self {
        Announcer {
            inbox,
            bucket,
            resolver,
        }
    }

    /// Announce `object` under `bucket_key`.
    ///
    /// With `bytes` supplied, the envelope is written to the session's
    /// bucket first (a fresh post). Without, the bucket value is expected
    /// to be gone and the announcement is a tombstone round; `prior`
    /// receipts then populate each delivery's tombstone reference.
    #[allow(clippy::too_many_arguments)]
    pub async fn announce(
        &self,
        session: &Session,
        object: &Object,
        tags: &[Vec<u8>],
        allowed_tickets: Option<&[Vec<u8>]>,
        bucket_key: &str,
        bytes: Option<&[u8]>,
        prior: Option<&PriorAnnouncements>,
    ) -> Result<AnnounceOutcome, GraffitiError> {
        if let Some(bytes) = bytes {
            self.bucket
                .put(
                    &session.storage_bucket.endpoint,
                    bucket_key,
                    bytes.to_vec(),
                    &session.storage_bucket.token,
                )
                .await?;
        }

        // Channel tags first (aligned with the envelope's attestations),
        // then the per-URL lookup tag so `get` can find the announcement.
        let mut wire_tags = tags.to_vec();
        wire_tags.push(crate::protocol::url_tag(&object.url));
        let tags = wire_tags.as_slice();

        let mut receipts = Vec::new();
        let mut failures = Vec::new();

        match &object.allowed {
            Some(recipients) => {
                let tickets = allowed_tickets.ok_or_else(|| {
                    GraffitiError::ProtocolViolation(
                        "private announcement without recipient tickets".into(),
                    )
                })?;
                if tickets.len() != recipients.len() {
                    return Err(GraffitiError::ProtocolViolation(format!(
                        "{} tickets for {} recipients",
                        tickets.len(),
                        recipients.len()
                    )));
                }

                let deliveries = recipients.iter().enumerate().map(|(index, recipient)| {
                    let ticket = tickets[index].clone();
                    async move {
                        self.deliver_to_recipient(
                            object, tags, bucket_key, recipient, ticket, index, prior,
                        )
                        .await
                        .map_err(|error| (recipient.clone(), error))
                    }
                });
                for outcome in join_all(deliveries).await {
                    match outcome {
                        Ok(receipt) => receipts.push(receipt),
                        Err((destination, error)) => {
                            glog!(
                                "announce: delivery to {} failed: {error}",
                                logging::actor_id(&destination)
                            );
                            failures.push(AnnounceFailure { destination, error });
                        }
                    }
                }
            }
            None => {
                let deliveries = session.shared_inboxes.iter().map(|endpoint| {
                    async move {
                        self.deliver_to_shared(object, tags, bucket_key, endpoint, prior)
                            .await
                            .map_err(|error| (endpoint.clone(), error))
                    }
                });
                for outcome in join_all(deliveries).await {
                    match outcome {
                        Ok(receipt) => receipts.push(receipt),
                        Err((destination, error)) => {
                            glog!("announce: shared inbox {destination} refused: {error}");
                            failures.push(AnnounceFailure { destination, error });
                        }
                    }
                }
            }
        }

        // The self-announcement carries the full object, every ticket, and
        // the receipts collected above; it is the one delivery that must
        // land.
        let meta = MessageMeta::Owner {
            base: MetaBase {
                bucket_key: bucket_key.to_string(),
                tombstone_of: prior.map(|p| p.self_id.clone()),
            },
            tickets: allowed_tickets.map(|t| t.to_vec()),
            receipts: receipts.clone(),
        };
        let message = Message::new(tags.to_vec(), object.clone(), &meta)?;
        let self_message_id = self
            .inbox
            .send(&session.personal_inbox.endpoint, &message)
            .await?;
        glog!(
            "announce: self-copy {} stored, {} receipt(s), {} failure(s)",
            logging::msg_id(&self_message_id),
            receipts.len(),
            failures.len()
        );

        Ok(AnnounceOutcome {
            self_message_id,
            receipts,
            failures,
        })
    }

    async fn deliver_to_recipient(
        &self,
        object: &Object,
        tags: &[Vec<u8>],
        bucket_key: &str,
        recipient: &str,
        ticket: Vec<u8>,
        index: usize,
        prior: Option<&PriorAnnouncements>,
    ) -> Result<Receipt, GraffitiError> {
        let doc = self.resolver.resolve(recipient).await?;
        let endpoint = doc.service_endpoint(PERSONAL_INBOX_SERVICE).ok_or_else(|| {
            GraffitiError::NotFound(format!("{recipient} lists no personal inbox"))
        })?;
        let meta = MessageMeta::Recipient {
            base: MetaBase {
                bucket_key: bucket_key.to_string(),
                tombstone_of: prior.and_then(|p| p.for_recipient(recipient)),
            },
            ticket,
            index: index as u64,
        };
        let message = Message::new(
            tags.to_vec(),
            object.masked_for_recipient(recipient),
            &meta,
        )?;
        let id = self.inbox.send(endpoint, &message).await?;
        Ok(Receipt {
            id,
            endpoint: None,
            actor: Some(recipient.to_string()),
        })
    }

    async fn deliver_to_shared(
        &self,
        object: &Object,
        tags: &[Vec<u8>],
        bucket_key: &str,
        endpoint: &str,
        prior: Option<&PriorAnnouncements>,
    ) -> Result<Receipt, GraffitiError> {
        let meta = MessageMeta::Shared {
            base: MetaBase {
                bucket_key: bucket_key.to_string(),
                tombstone_of: prior.and_then(|p| p.for_endpoint(endpoint)),
            },
        };
        let message = Message::new(tags.to_vec(), object.masked_public(), &meta)?;
        let id = self.inbox.send(endpoint, &message).await?;
        Ok(Receipt {
            id,
            endpoint: Some(endpoint.to_string()),
            actor: None,
        })
    }
}
