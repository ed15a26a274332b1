//! Object encoding, addressing, and wire-form properties exercised through
//! the public API.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::json;

use graffiti::codec::{decode_bytes, encode_bytes, escape_component, unescape_component};
use graffiti::crypto::channel_public_id;
use graffiti::error::GraffitiError;
use graffiti::protocol::{
    decode_object_url, encode_object, encode_object_url, encode_object_with_rng, url_tag,
    validate_object, ContentAddress, HashMethod, Label, LabeledMessage, Message, MessageMeta,
    MetaBase, Object, PartialObject, PrivateInfo, Receipt, MAX_OBJECT_SIZE_BYTES,
};

fn partial(value: serde_json::Value, channels: &[&str], allowed: Option<&[&str]>) -> PartialObject {
    PartialObject {
        value,
        channels: channels.iter().map(|c| c.to_string()).collect(),
        allowed: allowed.map(|a| a.iter().map(|r| r.to_string()).collect()),
    }
}

#[test]
fn byte_codec_round_trips_arbitrary_bytes() {
    for payload in [&b""[..], &b"\x00\xff\x80"[..], &[0x12u8, 0x20, 7, 7, 7][..]] {
        let encoded = encode_bytes(payload);
        assert!(encoded.starts_with('u'));
        assert_eq!(decode_bytes(&encoded).unwrap(), payload);
    }
}

#[test]
fn content_addresses_are_deterministic() {
    let a = ContentAddress::digest(HashMethod::Sha2_256, b"same bytes");
    let b = ContentAddress::digest(HashMethod::Sha2_256, b"same bytes");
    assert_eq!(a, b);
    assert_eq!(a.method(), HashMethod::Sha2_256);
    assert_ne!(a, ContentAddress::digest(HashMethod::Sha2_256, b"same bytes."));
}

#[test]
fn object_urls_survive_hostile_actor_ids() {
    let address = ContentAddress::digest(HashMethod::Sha2_256, b"x");
    for actor in [
        "did:web:a.test",
        "did:plc:ab/cd:ef",
        "with spaces and % signs",
        "query?and#fragment",
        "literal!bang~tilde",
        "did:web:oh!no:~user/home",
    ] {
        let url = encode_object_url(actor, &address);
        // The embedded components never carry raw separators.
        let body = url.strip_prefix("graffiti:").unwrap();
        assert_eq!(body.matches(':').count(), 1);
        let (decoded_actor, decoded_address) = decode_object_url(&url).unwrap();
        assert_eq!(decoded_actor, actor);
        assert_eq!(decoded_address, address);
    }
}

#[test]
fn component_escaping_round_trips() {
    for component in [
        "plain",
        "a:b/c",
        "% already %41",
        "ünïcødé",
        "a!b",
        "tilde~path",
        ":!/~",
    ] {
        let escaped = escape_component(component);
        assert_eq!(unescape_component(&escaped).unwrap(), component);
    }
}

#[test]
fn encoding_binds_actor_address_and_bytes() {
    let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
    let encoded = encode_object_with_rng(
        &partial(json!({"m": "hi", "n": [1, 2, 3]}), &["c1", "c2"], None),
        "did:web:a.test",
        &mut rng,
    )
    .unwrap();

    let (actor, address) = decode_object_url(&encoded.object.url).unwrap();
    assert_eq!(actor, "did:web:a.test");
    assert_eq!(
        address,
        ContentAddress::digest(HashMethod::Sha2_256, &encoded.bytes)
    );
    assert_eq!(
        encoded.tags,
        vec![
            channel_public_id("c1").to_vec(),
            channel_public_id("c2").to_vec(),
        ]
    );

    validate_object(
        &encoded.object.url,
        &json!({"m": "hi", "n": [1, 2, 3]}),
        &encoded.tags,
        &encoded.bytes,
        None,
    )
    .unwrap();
}

#[test]
fn identical_posts_get_distinct_urls() {
    let p = partial(json!({"m": "hi"}), &["c1"], None);
    let first = encode_object(&p, "did:web:a.test").unwrap();
    let second = encode_object(&p, "did:web:a.test").unwrap();
    assert_ne!(first.object.url, second.object.url);
    assert_ne!(first.bytes, second.bytes);
}

#[test]
fn size_gate_is_deterministic() {
    let blob = "x".repeat(MAX_OBJECT_SIZE_BYTES);
    for _ in 0..2 {
        let err = encode_object(&partial(json!({ "blob": blob.clone() }), &[], None), "did:web:a.test")
            .unwrap_err();
        assert!(matches!(err, GraffitiError::TooLarge(_)));
    }
    // Values comfortably under the gate encode fine.
    encode_object(
        &partial(json!({"blob": "x".repeat(1024)}), &[], None),
        "did:web:a.test",
    )
    .unwrap();
}

#[test]
fn owner_and_recipient_views_of_a_private_object_agree() {
    let recipients = ["did:web:b.test", "did:web:c.test", "did:web:d.test"];
    let encoded = encode_object(
        &partial(json!({"x": 1}), &["c1"], Some(&recipients)),
        "did:web:a.test",
    )
    .unwrap();
    let tickets = encoded.allowed_tickets.clone().unwrap();
    assert_eq!(tickets.len(), 3);
    let recipient_list: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();

    validate_object(
        &encoded.object.url,
        &json!({"x": 1}),
        &encoded.tags,
        &encoded.bytes,
        Some(PrivateInfo::Owner {
            recipients: &recipient_list,
            tickets: &tickets,
        }),
    )
    .unwrap();

    for (index, recipient) in recipients.iter().enumerate() {
        validate_object(
            &encoded.object.url,
            &json!({"x": 1}),
            &encoded.tags,
            &encoded.bytes,
            Some(PrivateInfo::Recipient {
                recipient,
                ticket: &tickets[index],
                index,
            }),
        )
        .unwrap();
    }

    // A recipient cannot pass itself off at another recipient's index.
    assert!(validate_object(
        &encoded.object.url,
        &json!({"x": 1}),
        &encoded.tags,
        &encoded.bytes,
        Some(PrivateInfo::Recipient {
            recipient: "did:web:b.test",
            ticket: &tickets[0],
            index: 2,
        }),
    )
    .is_err());
}

#[test]
fn masking_strips_exactly_what_each_destination_may_see() {
    let object = Object {
        url: "graffiti:did!web!a.test:uEiA".into(),
        actor: "did:web:a.test".into(),
        value: json!({"m": "hi"}),
        channels: vec!["c1".into(), "c2".into()],
        allowed: Some(vec!["did:web:b.test".into(), "did:web:c.test".into()]),
    };

    let for_bob = object.masked_for_recipient("did:web:b.test");
    assert_eq!(for_bob.channels, Vec::<String>::new());
    assert_eq!(for_bob.allowed, Some(vec!["did:web:b.test".to_string()]));
    assert_eq!(for_bob.value, object.value);

    let public = object.masked_public();
    assert_eq!(public.channels, Vec::<String>::new());
    assert_eq!(public.allowed, None);
    assert_eq!(public.url, object.url);
}

#[test]
fn wire_messages_round_trip_with_receipts() {
    let object = Object {
        url: "graffiti:did!web!a.test:uEiA".into(),
        actor: "did:web:a.test".into(),
        value: json!({"m": "hi"}),
        channels: vec![],
        allowed: None,
    };
    let meta = MessageMeta::Owner {
        base: MetaBase {
            bucket_key: "bkey".into(),
            tombstone_of: Some("m-prior".into()),
        },
        tickets: None,
        receipts: vec![
            Receipt {
                id: "r-1".into(),
                endpoint: Some("https://shared.test".into()),
                actor: None,
            },
            Receipt {
                id: "r-2".into(),
                endpoint: None,
                actor: Some("did:web:b.test".into()),
            },
        ],
    };
    let message = Message::new(
        vec![url_tag(&object.url)],
        object,
        &meta,
    )
    .unwrap();
    let labeled = LabeledMessage {
        id: "m-1".into(),
        message,
        label: Label::Unlabeled,
    };

    let decoded = LabeledMessage::from_bytes(&labeled.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, labeled);
    assert_eq!(decoded.message.parse_meta().unwrap(), meta);
}

#[test]
fn label_values_match_the_wire_encoding() {
    for (label, value) in [
        (Label::Unlabeled, 0),
        (Label::Valid, 1),
        (Label::Trash, 2),
        (Label::Invalid, 3),
    ] {
        assert_eq!(label.as_u64(), value);
        assert_eq!(Label::from_u64(value).unwrap(), label);
    }
    assert!(Label::from_u64(9).is_err());
}

#[test]
fn garbage_bytes_never_validate() {
    let encoded = encode_object(&partial(json!({"m": "hi"}), &["c1"], None), "did:web:a.test")
        .unwrap();
    for bytes in [&b""[..], &b"not cbor at all"[..], &encoded.bytes[1..]] {
        assert!(validate_object(
            &encoded.object.url,
            &json!({"m": "hi"}),
            &encoded.tags,
            bytes,
            None,
        )
        .is_err());
    }
}
