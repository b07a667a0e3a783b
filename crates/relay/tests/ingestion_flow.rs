//! End-to-end ingestion scenarios: policy decision followed by storage,
//! the way the connection handler runs them.

use nostr_core::{Event, EventTemplate, Filter, finalize_event, generate_secret_key};
use nostr_relay::policy::{AdminPolicy, Decision, IngestionPolicy, reason};
use nostr_relay::storage::{PutOutcome, Storage};
use nostr_relay::store_sqlite::SqliteStore;
use proptest::prelude::*;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;

fn signed(kind: u32, created_at: i64, content: &str, sk: &[u8; 32]) -> Event {
    finalize_event(
        &EventTemplate {
            kind,
            tags: vec![],
            content: content.to_string(),
            created_at,
        },
        sk,
    )
    .unwrap()
}

fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(dir.path().join("relay.db").to_str().unwrap()).unwrap()
}

fn default_policy() -> IngestionPolicy {
    IngestionPolicy::new(600, 86400, 900, false)
}

#[test]
fn admit_then_replay() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut policy = default_policy();
    let admin = AdminPolicy::default();

    let sk = generate_secret_key();
    let event = signed(1, NOW, "hello", &sk);

    // first submission is stored
    assert_eq!(policy.decide(&event, NOW, None, &admin), Decision::Store);
    assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Stored);

    // replay within the TTL is acknowledged without touching the store
    assert_eq!(
        policy.decide(&event, NOW + 1, None, &admin),
        Decision::AcceptNoStore(reason::DUPLICATE)
    );

    // and even past the replay cache, the store itself dedups by id
    assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Duplicate);

    let found = store.query(&[Filter::default()], 10).unwrap();
    assert_eq!(found.remaining(), 1);
}

#[test]
fn skewed_event_rejected_before_storage() {
    let mut policy = default_policy();
    let admin = AdminPolicy::default();
    let sk = generate_secret_key();

    let future = signed(1, NOW + 7200, "from the future", &sk);
    assert_eq!(
        policy.decide(&future, NOW, None, &admin),
        Decision::Reject(reason::CREATED_AT_OUT_OF_RANGE)
    );

    let ancient = signed(1, NOW - 200_000, "from the past", &sk);
    assert_eq!(
        policy.decide(&ancient, NOW, None, &admin),
        Decision::Reject(reason::CREATED_AT_OUT_OF_RANGE)
    );
}

#[test]
fn replaceable_overwrite_keeps_newest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut policy = default_policy();
    let admin = AdminPolicy::default();
    let sk = generate_secret_key();

    let older = signed(0, NOW - 10, r#"{"name":"before"}"#, &sk);
    let newer = signed(0, NOW, r#"{"name":"after"}"#, &sk);

    assert_eq!(policy.decide(&older, NOW, None, &admin), Decision::Store);
    assert_eq!(store.put_event(&older).unwrap(), PutOutcome::Stored);
    assert_eq!(policy.decide(&newer, NOW, None, &admin), Decision::Store);
    assert_eq!(store.put_event(&newer).unwrap(), PutOutcome::Replaced);

    let filter = Filter {
        kinds: Some(vec![0]),
        ..Default::default()
    };
    let mut handle = store.query(&[filter], 10).unwrap();
    let events = handle.next_batch(10);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, newer.id);

    // a late arrival older than what is stored loses
    let stale = signed(0, NOW - 100, r#"{"name":"stale"}"#, &sk);
    assert_eq!(store.put_event(&stale).unwrap(), PutOutcome::Superseded);
}

#[test]
fn banned_pubkey_blocked_end_to_end() {
    let mut policy = default_policy();
    let sk = generate_secret_key();
    let event = signed(1, NOW, "spam", &sk);

    let mut admin = AdminPolicy::default();
    admin.banned_pubkeys.insert(event.pubkey.clone());
    assert_eq!(
        policy.decide(&event, NOW, None, &admin),
        Decision::Reject(reason::BANNED_PUBKEY)
    );
}

proptest! {
    // Any structurally valid, freshly signed event inside the skew window
    // passes the default policy.
    #[test]
    fn prop_fresh_signed_events_admitted(
        kind in 0u32..20_000,
        content in ".{0,64}",
        offset in -3600i64..600,
    ) {
        let sk = generate_secret_key();
        let event = signed(kind, NOW + offset, &content, &sk);
        let mut policy = default_policy();
        prop_assert_eq!(
            policy.decide(&event, NOW, None, &AdminPolicy::default()),
            Decision::Store
        );
    }
}
