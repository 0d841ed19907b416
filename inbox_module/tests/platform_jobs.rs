mod test_support;

use mockito::Matcher;
use serde_json::json;

use inbox_module::jobs::JobRequest;
use inbox_module::messages::{AttachmentStore, Direction, FetchStatus};
use inbox_module::worker::JobOutcome;
use inbox_module::JobKind;

use test_support::{inbound_webhook, start_mockito_server, start_time, with_attachment, TestInbox, ACCOUNT_ID};

#[test]
fn media_attachments_are_downloaded_by_their_own_job() {
    let Some(mut server) = start_mockito_server("media_attachments_are_downloaded_by_their_own_job") else {
        return;
    };
    let image = server
        .mock("GET", "/cdn/photo.jpg")
        .with_status(200)
        .with_body(vec![0xffu8, 0xd8, 0xff, 0xe0])
        .create();
    let t = TestInbox::with_api_base(Some(&server.url()));
    let body = with_attachment(
        inbound_webhook("user-1", "mid.photo", "", start_time().timestamp_millis()),
        &format!("{}/cdn/photo.jpg", server.url()),
    );

    t.accept_signed(&body);
    t.default_worker(JobKind::Ingest).run_once().unwrap();
    let message = t.inbox.upsert.find_by_external_id("mid.photo").unwrap().unwrap();
    let attachments = AttachmentStore::new(t.inbox.db.clone());
    assert_eq!(attachments.for_message(message.id).unwrap()[0].fetch_status, FetchStatus::Pending);

    let outcome = t.default_worker(JobKind::FetchMedia).run_once().unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    image.assert();

    let stored = attachments.get(message.id, 0).unwrap().unwrap();
    assert_eq!(stored.fetch_status, FetchStatus::Ok);
    let expected_path = t.media_root().join(message.id.to_string()).join("0");
    assert_eq!(stored.storage_path.as_deref(), Some(expected_path.to_string_lossy().as_ref()));
    assert_eq!(std::fs::read(expected_path).unwrap(), vec![0xff, 0xd8, 0xff, 0xe0]);
}

#[test]
fn missing_media_is_marked_failed_and_dead_lettered() {
    let Some(mut server) = start_mockito_server("missing_media_is_marked_failed_and_dead_lettered") else {
        return;
    };
    let _gone = server.mock("GET", "/cdn/expired.jpg").with_status(404).create();
    let t = TestInbox::with_api_base(Some(&server.url()));
    let body = with_attachment(
        inbound_webhook("user-2", "mid.expired", "look", start_time().timestamp_millis()),
        &format!("{}/cdn/expired.jpg", server.url()),
    );

    t.accept_signed(&body);
    t.default_worker(JobKind::Ingest).run_once().unwrap();
    let outcome = t.default_worker(JobKind::FetchMedia).run_once().unwrap();
    assert!(matches!(outcome, Some(JobOutcome::DeadLettered { .. })));

    let message = t.inbox.upsert.find_by_external_id("mid.expired").unwrap().unwrap();
    let stored = AttachmentStore::new(t.inbox.db.clone()).get(message.id, 0).unwrap().unwrap();
    assert_eq!(stored.fetch_status, FetchStatus::Error);
    assert!(stored.error.is_some());
}

#[test]
fn hydrate_pages_history_and_stores_oldest_first() {
    let Some(mut server) = start_mockito_server("hydrate_pages_history_and_stores_oldest_first") else {
        return;
    };
    let first_page = server
        .mock("GET", "/v21.0/t_thread_1/messages")
        .match_header("authorization", "Bearer page-token")
        .match_query(Matcher::Regex("limit=50$".into()))
        .with_status(200)
        .with_body(
            json!({
                "data": [
                    {"id": "m-4", "from": {"id": ACCOUNT_ID}, "to": {"data": [{"id": "user-9"}]},
                     "created_time": "2026-03-01T10:03:00+0000", "message": "we ship tomorrow"},
                    {"id": "m-3", "from": {"id": "user-9"}, "to": {"data": [{"id": ACCOUNT_ID}]},
                     "created_time": "2026-03-01T10:02:00+0000", "message": "when does it ship?"}
                ],
                "paging": {"cursors": {"after": "c2"}, "next": "https://next-page"}
            })
            .to_string(),
        )
        .create();
    let second_page = server
        .mock("GET", "/v21.0/t_thread_1/messages")
        .match_query(Matcher::Regex("after=c2$".into()))
        .with_status(200)
        .with_body(
            json!({
                "data": [
                    {"id": "m-2", "from": {"id": ACCOUNT_ID}, "to": {"data": [{"id": "user-9"}]},
                     "created_time": "2026-03-01T10:01:00+0000", "message": "yes"},
                    {"id": "m-1", "from": {"id": "user-9"}, "to": {"data": [{"id": ACCOUNT_ID}]},
                     "created_time": "2026-03-01T10:00:00+0000", "message": "available?"}
                ]
            })
            .to_string(),
        )
        .create();

    let t = TestInbox::with_api_base(Some(&server.url()));
    let conversation_id = t.inbox.resolver.resolve_or_create(ACCOUNT_ID, "user-9").unwrap();
    t.inbox.resolver.attach_external_id(conversation_id, "t_thread_1").unwrap();
    t.inbox
        .queue
        .enqueue_request(JobRequest::hydrate(conversation_id, Some(3)).unwrap())
        .unwrap();

    let outcome = t.default_worker(JobKind::HydrateConversation).run_once().unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    first_page.assert();
    second_page.assert();

    // Three newest messages, so m-1 is never stored.
    assert_eq!(t.count("messages"), 3);
    assert!(t.inbox.upsert.find_by_external_id("m-1").unwrap().is_none());
    let reply = t.inbox.upsert.find_by_external_id("m-4").unwrap().unwrap();
    assert_eq!(reply.direction, Direction::Out);
    assert_eq!(reply.conversation_id, Some(conversation_id));
    let earlier = t.inbox.upsert.find_by_external_id("m-2").unwrap().unwrap();
    assert!(earlier.id < reply.id);

    let conversation = t.inbox.resolver.find(conversation_id).unwrap().unwrap();
    assert_eq!(conversation.summary.last_message_text.as_deref(), Some("we ship tomorrow"));
    assert_eq!(conversation.hydrated_at, Some(start_time()));
}

#[test]
fn hydrate_discovers_the_thread_through_the_directory() {
    let Some(mut server) = start_mockito_server("hydrate_discovers_the_thread_through_the_directory") else {
        return;
    };
    let listing = server
        .mock("GET", format!("/v21.0/{ACCOUNT_ID}/conversations").as_str())
        .match_query(Matcher::UrlEncoded("platform".into(), "instagram".into()))
        .with_status(200)
        .with_body(
            json!({
                "data": [
                    {"id": "t_other", "participants": {"data": [{"id": ACCOUNT_ID}, {"id": "user-1"}]}},
                    {"id": "t_found", "participants": {"data": [{"id": ACCOUNT_ID}, {"id": "user-5"}]}}
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create();
    let history = server
        .mock("GET", "/v21.0/t_found/messages")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"data": []}).to_string())
        .create();

    let t = TestInbox::with_api_base(Some(&server.url()));
    let conversation_id = t.inbox.resolver.resolve_or_create(ACCOUNT_ID, "user-5").unwrap();
    t.inbox
        .queue
        .enqueue_request(JobRequest::hydrate(conversation_id, None).unwrap())
        .unwrap();

    let outcome = t.default_worker(JobKind::HydrateConversation).run_once().unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    listing.assert();
    history.assert();

    let conversation = t.inbox.resolver.find(conversation_id).unwrap().unwrap();
    assert_eq!(conversation.external_conversation_id.as_deref(), Some("t_found"));
}
