use chrono::{NaiveDate, Utc};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use trialwatch::error::ScanError;
use trialwatch::models::{
    DateWindow, InsertOutcome, NaturalKey, NewTrial, StoredCredential, TrialLinks, TrialPatch,
    TrialSource, TrialStatus,
};
use trialwatch::store::{CredentialStore, MemoryStore, TrialStore};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn manual(owner: Uuid, service: &str, end: NaiveDate) -> NewTrial {
    NewTrial::manual(owner, service, end, None, Some(9.99))
}

#[tokio::test]
async fn test_insert_if_absent_returns_existing_record() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let trial = manual(owner, "Netflix", date(2024, 7, 1));

    let first = assert_ok!(store.insert_if_absent(trial.service_key(), trial.clone()).await);
    assert!(first.was_inserted());

    let mut retry = trial.clone();
    retry.renewal_price = Some(19.99);
    let second = assert_ok!(store.insert_if_absent(retry.service_key(), retry).await);

    assert_eq!(second, InsertOutcome::AlreadyExists(first.trial().clone()));
    assert_eq!(second.trial().renewal_price, Some(9.99));
    assert_eq!(store.trials_for(owner).expect("trials").len(), 1);
}

#[tokio::test]
async fn test_same_service_for_different_owners() {
    let store = MemoryStore::new();
    let end = date(2024, 7, 1);
    for owner in [Uuid::new_v4(), Uuid::new_v4()] {
        let trial = manual(owner, "Spotify", end);
        let outcome = assert_ok!(store.insert_if_absent(trial.service_key(), trial).await);
        assert!(outcome.was_inserted());
    }
}

#[tokio::test]
async fn test_partner_webhook_trials_deduplicate_on_service_and_date() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let links = TrialLinks {
        gmail_message_id: None,
        candidate_id: Some("cand-42".to_string()),
    };
    let from_partner = NewTrial::from_partner_webhook(
        owner,
        "Disney+",
        date(2024, 8, 15),
        Some("https://disney.example/cancel".to_string()),
        None,
        links,
    );
    assert_eq!(from_partner.source, TrialSource::WebhookPartner);

    let first = assert_ok!(store.insert_if_absent(from_partner.service_key(), from_partner.clone()).await);
    assert!(first.was_inserted());

    // The same trial entered by hand is recognised as a duplicate
    let by_hand = manual(owner, "Disney+", date(2024, 8, 15));
    let second = assert_ok!(store.insert_if_absent(by_hand.service_key(), by_hand).await);
    assert!(!second.was_inserted());
    assert_eq!(second.trial().source, TrialSource::WebhookPartner);
}

#[tokio::test]
async fn test_mailbox_key_matches_on_message_id() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let mut trial = manual(owner, "Trial ending", date(2024, 6, 1));
    trial.source = TrialSource::Gmail;
    trial.links.gmail_message_id = Some("msg-1".to_string());

    let key = NaturalKey::MailboxMessage {
        user_id: owner,
        gmail_message_id: "msg-1".to_string(),
    };
    assert!(assert_ok!(store.insert_if_absent(key.clone(), trial.clone()).await).was_inserted());

    // Renamed subject, same message: still the same trial
    trial.service_name = "Renamed".to_string();
    assert!(!assert_ok!(store.insert_if_absent(key, trial).await).was_inserted());
}

#[tokio::test]
async fn test_partner_trial_for_an_ingested_message_is_not_duplicated() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let mut from_mailbox = manual(owner, "Your free trial ends soon", date(2024, 6, 1));
    from_mailbox.source = TrialSource::Gmail;
    from_mailbox.links.gmail_message_id = Some("m1".to_string());
    let key = NaturalKey::MailboxMessage {
        user_id: owner,
        gmail_message_id: "m1".to_string(),
    };
    assert!(assert_ok!(store.insert_if_absent(key, from_mailbox).await).was_inserted());

    // Different service and date, same mailbox message
    let links = TrialLinks {
        gmail_message_id: Some("m1".to_string()),
        candidate_id: Some("cand-7".to_string()),
    };
    let partner = NewTrial::from_partner_webhook(owner, "Netflix", date(2024, 6, 30), None, None, links);
    let outcome = assert_ok!(store.insert_if_absent(partner.service_key(), partner).await);

    assert!(!outcome.was_inserted());
    assert_eq!(outcome.trial().source, TrialSource::Gmail);
    let with_m1: Vec<_> = store
        .trials_for(owner)
        .expect("trials")
        .into_iter()
        .filter(|t| t.links.gmail_message_id.as_deref() == Some("m1"))
        .collect();
    assert_eq!(with_m1.len(), 1);
}

#[tokio::test]
async fn test_find_filters_by_owner_status_and_window() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    for (service, end) in [
        ("Late", date(2024, 9, 1)),
        ("Early", date(2024, 6, 1)),
        ("Middle", date(2024, 7, 1)),
    ] {
        let trial = manual(owner, service, end);
        assert_ok!(store.insert_if_absent(trial.service_key(), trial).await);
    }
    let foreign = manual(stranger, "Middle", date(2024, 7, 1));
    assert_ok!(store.insert_if_absent(foreign.service_key(), foreign).await);

    let all = assert_ok!(store.find_by_owner_and_status(owner, None, DateWindow::default()).await);
    let names: Vec<&str> = all.iter().map(|t| t.service_name.as_str()).collect();
    assert_eq!(names, vec!["Early", "Middle", "Late"]);

    let window = DateWindow {
        from: Some(date(2024, 6, 15)),
        to: Some(date(2024, 9, 1)),
    };
    let windowed = assert_ok!(store.find_by_owner_and_status(owner, None, window).await);
    assert_eq!(windowed.len(), 2);

    let confirmed = assert_ok!(
        store
            .find_by_owner_and_status(owner, Some(TrialStatus::Confirmed), DateWindow::default())
            .await
    );
    assert!(confirmed.is_empty());
}

#[tokio::test]
async fn test_update_only_touches_owned_trials() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let trial = manual(owner, "Hulu", date(2024, 6, 1));
    let created = assert_ok!(store.insert_if_absent(trial.service_key(), trial).await);
    let id = created.trial().id;

    let patch = TrialPatch {
        status: Some(TrialStatus::Canceled),
        ..TrialPatch::default()
    };

    let foreign = assert_ok!(store.update_by_id(id, Uuid::new_v4(), patch.clone()).await);
    assert!(foreign.is_none());

    let updated = assert_ok!(store.update_by_id(id, owner, patch).await).expect("owned trial");
    assert_eq!(updated.status, TrialStatus::Canceled);
    assert_eq!(updated.service_name, "Hulu");
    assert!(updated.updated_at >= created.trial().updated_at);

    let missing = assert_ok!(
        store
            .update_by_id(Uuid::new_v4(), owner, TrialPatch {
                service_name: Some("Nope".to_string()),
                ..TrialPatch::default()
            })
            .await
    );
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_update_cannot_collide_with_another_trial() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let end = date(2024, 6, 1);
    let a = manual(owner, "A", end);
    let b = manual(owner, "B", date(2024, 6, 2));
    assert_ok!(store.insert_if_absent(a.service_key(), a).await);
    let b_id = assert_ok!(store.insert_if_absent(b.service_key(), b).await)
        .trial()
        .id;

    let rename = TrialPatch {
        service_name: Some("A".to_string()),
        ..TrialPatch::default()
    };
    // Renaming alone is fine: the dates differ
    assert_ok!(store.update_by_id(b_id, owner, rename).await).expect("owned trial");

    let redate = TrialPatch {
        end_date: Some(end),
        status: Some(TrialStatus::Confirmed),
        ..TrialPatch::default()
    };
    let err = assert_err!(store.update_by_id(b_id, owner, redate).await);
    assert!(matches!(err, ScanError::Validation(_)));

    let trials = store.trials_for(owner).expect("trials");
    let b_now = trials.iter().find(|t| t.id == b_id).expect("trial b");
    assert_eq!(b_now.end_date, date(2024, 6, 2));
    assert_eq!(b_now.status, TrialStatus::Detected);
    assert_eq!(trials.iter().filter(|t| t.service_name == "A" && t.end_date == end).count(), 1);

    // A patch that keeps the trial's own key is not a collision
    let same_key = TrialPatch {
        service_name: Some("A".to_string()),
        renewal_price: Some(4.99),
        ..TrialPatch::default()
    };
    let updated = assert_ok!(store.update_by_id(b_id, owner, same_key).await).expect("owned trial");
    assert_eq!(updated.renewal_price, Some(4.99));
}

#[tokio::test]
async fn test_empty_patch_is_rejected() {
    let store = MemoryStore::new();
    let err = assert_err!(
        store
            .update_by_id(Uuid::new_v4(), Uuid::new_v4(), TrialPatch::default())
            .await
    );
    assert!(matches!(err, ScanError::Validation(_)));
}

#[tokio::test]
async fn test_delete_requires_owner() {
    let store = MemoryStore::new();
    let owner = Uuid::new_v4();
    let trial = manual(owner, "Max", date(2024, 6, 1));
    let id = assert_ok!(store.insert_if_absent(trial.service_key(), trial).await)
        .trial()
        .id;

    assert!(!assert_ok!(store.delete_by_id(id, Uuid::new_v4()).await));
    assert!(assert_ok!(store.delete_by_id(id, owner).await));
    assert!(!assert_ok!(store.delete_by_id(id, owner).await));
    assert!(store.trials_for(owner).expect("trials").is_empty());
}

#[tokio::test]
async fn test_watermark_is_monotonic() {
    let store = MemoryStore::new();
    let user_id = Uuid::new_v4();
    store
        .add_user(
            "w@example.com",
            StoredCredential {
                user_id,
                provider: "google".to_string(),
                access_token: None,
                refresh_token: None,
                expiry: None,
            },
        )
        .expect("add user");

    assert_eq!(assert_ok!(store.get_watermark(user_id).await), 0);
    assert_ok!(store.set_watermark(user_id, 2000, Utc::now()).await);
    assert_ok!(store.set_watermark(user_id, 1000, Utc::now()).await);
    assert_eq!(assert_ok!(store.get_watermark(user_id).await), 2000);
    assert!(store.last_scan_at(user_id).expect("last scan").is_some());
}

#[tokio::test]
async fn test_watermark_write_for_unknown_user_fails() {
    let store = MemoryStore::new();
    let ghost = Uuid::new_v4();

    assert_eq!(assert_ok!(store.get_watermark(ghost).await), 0);
    assert!(matches!(
        store.set_watermark(ghost, 10, Utc::now()).await,
        Err(ScanError::Store(_))
    ));
    assert!(matches!(
        store.touch_last_scan(ghost, Utc::now()).await,
        Err(ScanError::Store(_))
    ));
}

#[tokio::test]
async fn test_unavailable_store_fails_every_operation() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let owner = Uuid::new_v4();
    let trial = manual(owner, "Any", date(2024, 6, 1));

    assert!(matches!(
        store.insert_if_absent(trial.service_key(), trial).await,
        Err(ScanError::Store(_))
    ));
    assert!(matches!(store.list_scannable_users().await, Err(ScanError::Store(_))));

    store.set_unavailable(false);
    assert_ok!(store.list_scannable_users().await);
}
