mod test_support;

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use inbox_module::ingestion::{sign, IngestError, SignatureError};
use inbox_module::messages::Direction;
use inbox_module::shadow::{DraftOutcome, DraftReply, ReplyStatus, ShadowReplyLoop, ShadowStatus};
use inbox_module::worker::JobOutcome;
use inbox_module::JobKind;

use test_support::{
    inbound_webhook, signed, start_time, with_attachment, FlakyBroker, ScriptedDrafter, TestInbox, ACCOUNT_ID,
};

#[test]
fn inbound_webhook_flows_to_message_summary_and_shadow_reply() {
    let t = TestInbox::new();
    let ts = start_time().timestamp_millis();
    let accepted = t.accept_signed(&inbound_webhook("user-1", "mid.first", "is this still available?", ts));
    assert!(!accepted.duplicate);
    let job_id = accepted.job_id.expect("ingest job");

    let worker = t.default_worker(JobKind::Ingest);
    assert_eq!(worker.run_once().unwrap(), Some(JobOutcome::Completed { job_id }));
    assert_eq!(t.inbox.queue.store().count(JobKind::Ingest).unwrap(), 0);

    let message = t.inbox.upsert.find_by_external_id("mid.first").unwrap().unwrap();
    assert_eq!(message.direction, Direction::In);
    assert_eq!(message.sender_id.as_deref(), Some("user-1"));
    assert_eq!(message.timestamp_ms, Some(ts));
    let conversation_id = message.conversation_id.unwrap();

    let conversation = t.inbox.resolver.find(conversation_id).unwrap().unwrap();
    assert_eq!(conversation.account_id, ACCOUNT_ID);
    assert_eq!(conversation.counterparty_id, "user-1");
    assert_eq!(conversation.summary.last_message_id, Some(message.id));
    assert_eq!(
        conversation.summary.last_message_text.as_deref(),
        Some("is this still available?")
    );
    assert_eq!(conversation.summary.last_message_direction, Some(Direction::In));

    let state = t.inbox.shadow.get(conversation_id).unwrap().unwrap();
    assert_eq!(state.status, ShadowStatus::Pending);
    assert_eq!(state.last_inbound_timestamp_ms, Some(ts));
    assert_eq!(state.next_attempt_at, Some(start_time() + Duration::seconds(30)));

    let drafter = Arc::new(ScriptedDrafter::new(vec![Ok(DraftOutcome::Reply(DraftReply {
        text: "Yes, it is!".to_string(),
        model: Some("drafter-v1".to_string()),
        confidence: Some(0.82),
        reason: None,
    }))]));
    let shadow_loop = ShadowReplyLoop::new(t.inbox.shadow.clone(), drafter.clone(), Arc::new(t.clock.clone()));
    assert_eq!(shadow_loop.run_once().unwrap().due, 0);

    t.clock.advance(Duration::seconds(31));
    let report = shadow_loop.run_once().unwrap();
    assert_eq!(report.drafted, 1);
    assert_eq!(*drafter.calls.lock().unwrap(), vec![(conversation_id, 1)]);

    let reply = t.inbox.shadow.latest_reply(conversation_id).unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Suggested);
    assert_eq!(reply.text, "Yes, it is!");
    let state = t.inbox.shadow.get(conversation_id).unwrap().unwrap();
    assert_eq!(state.status, ShadowStatus::Pending);
    assert_eq!(state.next_attempt_at, None);
}

#[test]
fn redelivered_webhook_is_stored_and_processed_once() {
    let t = TestInbox::new();
    let ts = start_time().timestamp_millis();
    let body = inbound_webhook("user-2", "mid.dup", "hello", ts);

    let first = t.accept_signed(&body);
    let second = t.accept_signed(&body);
    assert!(!first.duplicate);
    assert!(second.duplicate);
    // Not processed yet, so the redelivery re-enqueues the same job.
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.raw_event.id, first.raw_event.id);
    assert_eq!(t.count("raw_events"), 1);
    assert_eq!(t.count("jobs"), 1);

    let report = t.inbox.pipeline.process(first.raw_event.id).unwrap();
    assert_eq!(report.inserted, 1);
    let again = t.inbox.pipeline.process(first.raw_event.id).unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.duplicates, 1);
    let third = t.accept_signed(&body);
    assert!(third.duplicate);
    assert_eq!(third.job_id, None);

    // Same message inside a differently shaped delivery.
    let mut reshaped = body.clone();
    reshaped["entry"][0]["time"] = json!(ts + 5_000);
    let other = t.accept_signed(&reshaped);
    assert!(!other.duplicate);
    let report = t.inbox.pipeline.process(other.raw_event.id).unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(t.count("messages"), 1);
    assert_eq!(t.count("conversations"), 1);
}

#[test]
fn bad_signatures_store_nothing() {
    let t = TestInbox::new();
    let body = inbound_webhook("user-3", "mid.sig", "hi", start_time().timestamp_millis());
    let (bytes, signature) = signed(&body);

    let wrong_secret = sign(&bytes, "not-the-secret");
    let missing = t.inbox.pipeline.accept(&bytes, None);
    let forged = t.inbox.pipeline.accept(&bytes, Some(&wrong_secret));
    let mut tampered = bytes.clone();
    tampered.extend_from_slice(b" ");
    let altered = t.inbox.pipeline.accept(&tampered, Some(&signature));

    assert!(matches!(missing, Err(IngestError::Signature(SignatureError::Missing))));
    assert!(matches!(forged, Err(IngestError::Signature(SignatureError::Invalid))));
    assert!(matches!(altered, Err(IngestError::Signature(SignatureError::Invalid))));
    assert_eq!(t.count("raw_events"), 0);
    assert_eq!(t.count("jobs"), 0);
}

#[test]
fn unsupported_objects_are_ignored() {
    let t = TestInbox::new();
    let mut body = inbound_webhook("user-4", "mid.obj", "hi", start_time().timestamp_millis());
    body["object"] = json!("whatsapp_business_account");
    let (bytes, signature) = signed(&body);

    let result = t.inbox.pipeline.accept(&bytes, Some(&signature));
    assert!(matches!(result, Err(IngestError::IgnoredObject(object)) if object == "whatsapp_business_account"));
    assert_eq!(t.count("raw_events"), 0);
}

#[test]
fn newer_inbound_message_restarts_debounce() {
    let t = TestInbox::new();
    let worker = t.default_worker(JobKind::Ingest);
    let ts = start_time().timestamp_millis();

    t.accept_signed(&inbound_webhook("user-5", "mid.a", "first", ts));
    worker.run_once().unwrap();
    t.clock.advance(Duration::seconds(20));
    t.accept_signed(&inbound_webhook("user-5", "mid.b", "second", ts + 20_000));
    worker.run_once().unwrap();

    let message = t.inbox.upsert.find_by_external_id("mid.b").unwrap().unwrap();
    let state = t.inbox.shadow.get(message.conversation_id.unwrap()).unwrap().unwrap();
    assert_eq!(state.next_attempt_at, Some(start_time() + Duration::seconds(50)));
    assert_eq!(state.last_inbound_timestamp_ms, Some(ts + 20_000));
}

#[test]
fn summary_keeps_the_latest_message_when_deliveries_arrive_out_of_order() {
    let t = TestInbox::new();
    let worker = t.default_worker(JobKind::Ingest);
    for (mid, ts) in [("mid.100", 100), ("mid.300", 300), ("mid.200", 200)] {
        t.accept_signed(&inbound_webhook("user-6", mid, &format!("text at {ts}"), ts));
        worker.run_once().unwrap();
    }

    let message = t.inbox.upsert.find_by_external_id("mid.300").unwrap().unwrap();
    let conversation = t.inbox.resolver.find(message.conversation_id.unwrap()).unwrap().unwrap();
    assert_eq!(conversation.summary.last_message_timestamp_ms, Some(300));
    assert_eq!(conversation.summary.last_message_text.as_deref(), Some("text at 300"));
    assert_eq!(conversation.summary.last_message_id, Some(message.id));
}

#[test]
fn identical_deliveries_yield_one_event_and_one_message() {
    let t = TestInbox::new();
    let worker = t.default_worker(JobKind::Ingest);
    let body = inbound_webhook("U", "mid.hello", "hello", 1000);

    t.accept_signed(&body);
    worker.run_once().unwrap();
    t.accept_signed(&body);
    assert_eq!(worker.run_once().unwrap(), None);

    assert_eq!(t.count("raw_events"), 1);
    assert_eq!(t.count("messages"), 1);
    let message = t.inbox.upsert.find_by_external_id("mid.hello").unwrap().unwrap();
    let conversation = t.inbox.resolver.find(message.conversation_id.unwrap()).unwrap().unwrap();
    assert_eq!(conversation.counterparty_id, "U");
    assert_eq!(conversation.summary.last_message_text.as_deref(), Some("hello"));
}

#[test]
fn echoes_are_outbound_and_do_not_schedule_replies() {
    let t = TestInbox::new();
    let ts = start_time().timestamp_millis();
    let body = json!({
        "object": "instagram",
        "entry": [{
            "id": ACCOUNT_ID,
            "messaging": [{
                "sender": {"id": ACCOUNT_ID},
                "recipient": {"id": "user-7"},
                "timestamp": ts,
                "message": {"mid": "mid.echo", "text": "thanks!", "is_echo": true}
            }]
        }]
    });
    t.accept_signed(&body);
    t.default_worker(JobKind::Ingest).run_once().unwrap();

    let message = t.inbox.upsert.find_by_external_id("mid.echo").unwrap().unwrap();
    assert_eq!(message.direction, Direction::Out);
    let conversation_id = message.conversation_id.unwrap();
    let conversation = t.inbox.resolver.find(conversation_id).unwrap().unwrap();
    assert_eq!(conversation.counterparty_id, "user-7");
    assert!(t.inbox.shadow.get(conversation_id).unwrap().is_none());
}

#[test]
fn redelivery_after_a_failed_enqueue_is_still_processed() {
    let broker = FlakyBroker::new();
    let t = TestInbox::with_broker(broker.clone());
    let worker = t.default_worker(JobKind::Ingest);
    let body = inbound_webhook("user-9", "mid.retry", "anyone there?", start_time().timestamp_millis());
    let (bytes, signature) = signed(&body);

    broker.fail_next_push(JobKind::Ingest);
    let first = t.inbox.pipeline.accept(&bytes, Some(&signature));
    assert!(matches!(first, Err(IngestError::Queue(_))));
    assert_eq!(t.count("raw_events"), 1);
    assert_eq!(worker.run_once().unwrap(), None);

    let redelivered = t.accept_signed(&body);
    assert!(redelivered.duplicate);
    let job_id = redelivered.job_id.expect("ingest job enqueued again");
    assert_eq!(worker.run_once().unwrap(), Some(JobOutcome::Completed { job_id }));
    assert!(t.inbox.upsert.find_by_external_id("mid.retry").unwrap().is_some());

    let late = t.accept_signed(&body);
    assert!(late.duplicate);
    assert_eq!(late.job_id, None);
    assert_eq!(worker.run_once().unwrap(), None);
}

#[test]
fn shadow_state_and_media_job_commit_with_the_message() {
    let broker = FlakyBroker::new();
    let t = TestInbox::with_broker(broker.clone());
    let ts = start_time().timestamp_millis();
    t.accept_signed(&with_attachment(
        inbound_webhook("user-10", "mid.photo", "what size is this?", ts),
        "https://cdn.example.com/photo.jpg",
    ));

    broker.fail_next_push(JobKind::FetchMedia);
    let outcome = t.default_worker(JobKind::Ingest).run_once().unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));

    let message = t.inbox.upsert.find_by_external_id("mid.photo").unwrap().unwrap();
    let state = t.inbox.shadow.get(message.conversation_id.unwrap()).unwrap().unwrap();
    assert_eq!(state.status, ShadowStatus::Pending);
    assert_eq!(state.last_inbound_timestamp_ms, Some(ts));

    // The fetch job is durable even though its pointer never reached the broker.
    assert_eq!(t.inbox.queue.store().count(JobKind::FetchMedia).unwrap(), 1);
    let short = std::time::Duration::from_millis(20);
    assert!(t.inbox.queue.dequeue(JobKind::FetchMedia, short).unwrap().is_none());

    t.clock.advance(Duration::minutes(16));
    assert_eq!(t.inbox.queue.recover_stale(JobKind::FetchMedia).unwrap(), 1);
    let job = t.inbox.queue.dequeue(JobKind::FetchMedia, short).unwrap().expect("fetch job");
    assert_eq!(job.key, format!("{}:0", message.id));
}

#[test]
fn event_without_sender_id_is_skipped_not_rejected() {
    let t = TestInbox::new();
    let ts = start_time().timestamp_millis();
    let body = json!({
        "object": "instagram",
        "entry": [{
            "id": ACCOUNT_ID,
            "messaging": [
                {
                    "sender": {},
                    "recipient": {"id": ACCOUNT_ID},
                    "timestamp": ts,
                    "message": {"mid": "mid.anon", "text": "who am i"}
                },
                {
                    "sender": {"id": "user-11"},
                    "recipient": {"id": ACCOUNT_ID},
                    "timestamp": ts,
                    "message": {"mid": "mid.known", "text": "hello"}
                }
            ]
        }]
    });
    let accepted = t.accept_signed(&body);

    let report = t.inbox.pipeline.process(accepted.raw_event.id).unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.skipped, 1);
    assert!(t.inbox.upsert.find_by_external_id("mid.anon").unwrap().is_none());
    assert!(t.inbox.upsert.find_by_external_id("mid.known").unwrap().is_some());
}

