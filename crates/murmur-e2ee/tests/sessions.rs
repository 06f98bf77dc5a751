//! Session lifecycle: replay, supersession, crossed first messages,
//! desync and concurrency.

mod common;

use common::{device, inbound};
use futures_util::future::join_all;
use murmur_common::EnvelopeKind;
use murmur_e2ee::{E2eeError, Inbound, InMemoryKeyDirectory, SessionState};
use std::sync::Arc;

#[tokio::test]
async fn test_duplicate_delivery_is_replay() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    let first = alice
        .client
        .send_encrypted(b"one", &[bob.user.clone()])
        .await
        .unwrap();
    let second = alice
        .client
        .send_encrypted(b"two", &[bob.user.clone()])
        .await
        .unwrap();

    let first_in = inbound(&alice, &first.envelope);
    let second_in = inbound(&alice, &second.envelope);
    assert!(matches!(
        bob.client.handle_incoming(&first_in).await.unwrap(),
        Inbound::Plaintext(_)
    ));
    assert!(matches!(
        bob.client.handle_incoming(&second_in).await.unwrap(),
        Inbound::Plaintext(_)
    ));

    // At-least-once transport: both arrive again.
    assert_eq!(
        bob.client.handle_incoming(&first_in).await.unwrap(),
        Inbound::ReplayOrTooOld
    );
    assert_eq!(
        bob.client.handle_incoming(&second_in).await.unwrap(),
        Inbound::ReplayOrTooOld
    );
}

#[tokio::test]
async fn test_not_for_this_device() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;
    let carol = device(&directory, "carol").await;

    let report = alice
        .client
        .send_encrypted(b"for bob", &[bob.user.clone()])
        .await
        .unwrap();
    assert_eq!(
        carol
            .client
            .handle_incoming(&inbound(&alice, &report.envelope))
            .await
            .unwrap(),
        Inbound::NotForThisDevice
    );
}

#[tokio::test]
async fn test_out_of_order_delivery() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    let mut envelopes = Vec::new();
    for i in 0..5u8 {
        let report = alice
            .client
            .send_encrypted(&[i], &[bob.user.clone()])
            .await
            .unwrap();
        envelopes.push(report.envelope);
    }

    for i in [0usize, 4, 2, 1, 3] {
        match bob
            .client
            .handle_incoming(&inbound(&alice, &envelopes[i]))
            .await
            .unwrap()
        {
            Inbound::Plaintext(message) => assert_eq!(message.plaintext, vec![i as u8]),
            other => panic!("message {i}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_supersession_retires_old_session() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    let first = alice
        .client
        .send_encrypted(b"old session", &[bob.user.clone()])
        .await
        .unwrap();
    bob.client
        .handle_incoming(&inbound(&alice, &first.envelope))
        .await
        .unwrap();
    let held_back = alice
        .client
        .send_encrypted(b"sent under the old session", &[bob.user.clone()])
        .await
        .unwrap();

    // Alice loses her session and starts over.
    alice.client.reset_session(&bob.user, &bob.key).await.unwrap();
    assert_eq!(
        alice.client.session_state(&bob.user, &bob.key).await.unwrap(),
        SessionState::Absent
    );
    let fresh = alice
        .client
        .send_encrypted(b"new session", &[bob.user.clone()])
        .await
        .unwrap();
    assert_eq!(
        fresh.envelope.entry_for(&bob.key).unwrap().kind,
        EnvelopeKind::Initial
    );

    match bob
        .client
        .handle_incoming(&inbound(&alice, &fresh.envelope))
        .await
        .unwrap()
    {
        Inbound::Plaintext(message) => assert_eq!(message.plaintext, b"new session"),
        other => panic!("unexpected {other:?}"),
    }

    let stale = bob
        .client
        .handle_incoming(&inbound(&alice, &held_back.envelope))
        .await;
    assert!(matches!(stale, Err(E2eeError::StaleSession)));

    // The old initial cannot resurrect the retired session either.
    let replayed = bob
        .client
        .handle_incoming(&inbound(&alice, &first.envelope))
        .await;
    assert!(matches!(replayed, Err(E2eeError::StaleSession)));
}

#[tokio::test]
async fn test_failed_persist_desyncs_until_reset() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    alice
        .client
        .send_encrypted(b"hello", &[bob.user.clone()])
        .await
        .unwrap();

    alice.storage.fail_writes(true);
    let blocked = alice
        .client
        .send_encrypted(b"lost?", &[bob.user.clone()])
        .await;
    assert!(matches!(blocked, Err(E2eeError::SendBlocked { skipped: 1 })));

    // Storage recovers, but the session stays unusable.
    alice.storage.fail_writes(false);
    let still_blocked = alice
        .client
        .send_encrypted(b"again", &[bob.user.clone()])
        .await;
    assert!(matches!(
        still_blocked,
        Err(E2eeError::SendBlocked { skipped: 1 })
    ));

    alice.client.reset_session(&bob.user, &bob.key).await.unwrap();
    let report = alice
        .client
        .send_encrypted(b"after reset", &[bob.user.clone()])
        .await
        .unwrap();
    assert_eq!(
        report.envelope.entry_for(&bob.key).unwrap().kind,
        EnvelopeKind::Initial
    );
    match bob
        .client
        .handle_incoming(&inbound(&alice, &report.envelope))
        .await
        .unwrap()
    {
        Inbound::Plaintext(message) => assert_eq!(message.plaintext, b"after reset"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_sends_claim_once() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;
    let before = bob.client.account().current_prekey_count().await.unwrap();

    let payloads: Vec<[u8; 1]> = (0..8u8).map(|i| [i]).collect();
    let recipients = [bob.user.clone()];
    let sends = payloads
        .iter()
        .map(|payload| alice.client.send_encrypted(payload, &recipients));
    let reports: Vec<_> = join_all(sends)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(
        bob.client.account().current_prekey_count().await.unwrap(),
        before - 1
    );
    let initials = reports
        .iter()
        .filter(|r| r.envelope.entry_for(&bob.key).unwrap().kind == EnvelopeKind::Initial)
        .count();
    assert_eq!(initials, 1);
}

#[tokio::test]
async fn test_reset_device_destroys_state() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    alice
        .client
        .send_encrypted(b"hello", &[bob.user.clone()])
        .await
        .unwrap();
    alice.client.reset_device().await.unwrap();

    assert!(matches!(
        alice.client.device_key().await,
        Err(E2eeError::NotInitialized)
    ));
    assert!(matches!(
        alice.client.send_encrypted(b"x", &[bob.user.clone()]).await,
        Err(E2eeError::NotInitialized)
    ));
    assert_eq!(alice.client.queued_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_crossed_first_messages_converge() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    // Both open a session before seeing the other's first message.
    let from_alice = alice
        .client
        .send_encrypted(b"hi bob", &[bob.user.clone()])
        .await
        .unwrap();
    let from_bob = bob
        .client
        .send_encrypted(b"hi alice", &[alice.user.clone()])
        .await
        .unwrap();
    let alice_again = alice
        .client
        .send_encrypted(b"still there?", &[bob.user.clone()])
        .await
        .unwrap();
    let bob_again = bob
        .client
        .send_encrypted(b"hello?", &[alice.user.clone()])
        .await
        .unwrap();
    assert_eq!(
        from_alice.envelope.entry_for(&bob.key).unwrap().kind,
        EnvelopeKind::Initial
    );
    assert_eq!(
        from_bob.envelope.entry_for(&alice.key).unwrap().kind,
        EnvelopeKind::Initial
    );

    let deliveries = [
        (&bob, &alice, &from_alice, b"hi bob".as_slice()),
        (&alice, &bob, &from_bob, b"hi alice".as_slice()),
        (&bob, &alice, &alice_again, b"still there?".as_slice()),
        (&alice, &bob, &bob_again, b"hello?".as_slice()),
    ];
    for (to, from, report, expected) in deliveries {
        match to
            .client
            .handle_incoming(&inbound(from, &report.envelope))
            .await
            .unwrap()
        {
            Inbound::Plaintext(message) => assert_eq!(message.plaintext, expected),
            other => panic!("unexpected {other:?}"),
        }
    }

    // Both ends settled on the same session and keep talking over it.
    for round in 0..3u8 {
        let ping = alice
            .client
            .send_encrypted(&[round], &[bob.user.clone()])
            .await
            .unwrap();
        assert_eq!(
            ping.envelope.entry_for(&bob.key).unwrap().kind,
            EnvelopeKind::Continuation
        );
        let received = bob
            .client
            .handle_incoming(&inbound(&alice, &ping.envelope))
            .await
            .unwrap();
        assert!(matches!(received, Inbound::Plaintext(m) if m.plaintext == [round]));

        let pong = bob
            .client
            .send_encrypted(&[round + 100], &[alice.user.clone()])
            .await
            .unwrap();
        assert_eq!(
            pong.envelope.entry_for(&alice.key).unwrap().kind,
            EnvelopeKind::Continuation
        );
        let received = alice
            .client
            .handle_incoming(&inbound(&bob, &pong.envelope))
            .await
            .unwrap();
        assert!(matches!(received, Inbound::Plaintext(m) if m.plaintext == [round + 100]));
    }
    assert_eq!(
        alice.client.session_state(&bob.user, &bob.key).await.unwrap(),
        SessionState::Established
    );
    assert_eq!(
        bob.client.session_state(&alice.user, &alice.key).await.unwrap(),
        SessionState::Established
    );
}

#[tokio::test]
async fn test_recovered_messages_returned_to_caller() {
    let directory = Arc::new(InMemoryKeyDirectory::default());
    let alice = device(&directory, "alice").await;
    let bob = device(&directory, "bob").await;

    let mut envelopes = Vec::new();
    for text in [b"one", b"two", b"tri"] {
        let report = alice
            .client
            .send_encrypted(text, &[bob.user.clone()])
            .await
            .unwrap();
        envelopes.push(inbound(&alice, &report.envelope));
    }

    // Nothing is listening anywhere; the later two arrive first.
    for late in [&envelopes[2], &envelopes[1]] {
        assert_eq!(
            bob.client.handle_incoming(late).await.unwrap(),
            Inbound::Queued
        );
    }
    assert_eq!(bob.client.queued_len().await.unwrap(), 2);

    let result = bob.client.handle_incoming(&envelopes[0]).await.unwrap();
    assert!(matches!(result, Inbound::Recovered { .. }));
    let messages = result.into_messages();
    let ids: Vec<_> = messages.iter().map(|m| m.message_id).collect();
    assert_eq!(
        ids,
        [
            envelopes[2].message_id,
            envelopes[1].message_id,
            envelopes[0].message_id
        ]
    );
    let texts: Vec<_> = messages.iter().map(|m| m.plaintext.as_slice()).collect();
    assert_eq!(
        texts,
        [b"tri".as_slice(), b"two".as_slice(), b"one".as_slice()]
    );
    assert_eq!(bob.client.queued_len().await.unwrap(), 0);

    // Redelivery of a recovered message is a replay, not a second copy.
    assert_eq!(
        bob.client.handle_incoming(&envelopes[1]).await.unwrap(),
        Inbound::ReplayOrTooOld
    );
}
