use std::sync::Arc;
use std::time::Duration;

use draftq_core::{
    DraftActionStatus, FieldValue, FieldValueRepresentation, RecordRepresentation, field_key,
    record_key,
};
use draftq_engine::{ProcessActionResult, normalize_record};
use draftq_harness::{LatencyStore, TestClient, record_response};
use draftq_storage::{
    DEFAULT_SEGMENT, DRAFT_ID_MAPPINGS_SEGMENT, DRAFT_SEGMENT, DurableStore, DurableStoreEntries,
    DurableStoreEntry, EntryData, SqliteDurableStore,
};

fn account(id: &str, name: &str) -> RecordRepresentation {
    RecordRepresentation::new("Account", id).with_field("Name", name)
}

// ============================================================================
// Merging (3 tests)
// ============================================================================

#[tokio::test]
async fn concurrent_partial_writes_keep_every_field() -> Result<(), Box<dyn std::error::Error>> {
    let sqlite = Arc::new(SqliteDurableStore::open_in_memory()?);
    let slow = Arc::new(LatencyStore::new(sqlite.clone(), Duration::from_millis(10)));
    let client = TestClient::with_store(slow).await?;

    let names = RecordRepresentation::new("Contact", "003E").with_field("LastName", "Lovelace");
    let birthday = RecordRepresentation::new("Contact", "003E").with_field("Birthdate", "1815-12-10");
    let (first, second) = tokio::join!(
        client.engine.ingest_record(&names),
        client.engine.ingest_record(&birthday),
    );
    first?;
    second?;

    let key = record_key("003E");
    let stored = sqlite.get_entries(std::slice::from_ref(&key), DEFAULT_SEGMENT).await?;
    let record = stored.get(&key).and_then(|e| e.as_record()).ok_or("record missing")?;
    assert_eq!(record.field_value("LastName"), Some(&FieldValue::text("Lovelace")));
    assert_eq!(record.field_value("Birthdate"), Some(&FieldValue::text("1815-12-10")));
    Ok(())
}

#[tokio::test]
async fn concurrent_edit_and_refresh_both_land() -> Result<(), Box<dyn std::error::Error>> {
    let sqlite = Arc::new(SqliteDurableStore::open_in_memory()?);
    let slow = Arc::new(LatencyStore::new(sqlite, Duration::from_millis(5)));
    let client = TestClient::with_store(slow).await?;
    client.engine.ingest_record(&account("001A", "A")).await?;

    let refreshed = account("001A", "A").with_field("Rating", "Hot");
    let (edit, refresh) = tokio::join!(
        client
            .engine
            .update_record("001A", [("Name", FieldValue::text("B"))]),
        client.engine.ingest_record(&refreshed),
    );
    let edit = edit?;
    refresh?;

    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("B")));
    assert_eq!(record.field_value("Rating"), Some(&FieldValue::text("Hot")));
    assert_eq!(
        record.drafts.as_ref().map(|d| d.draft_action_ids.clone()),
        Some(vec![edit.id])
    );
    Ok(())
}

#[tokio::test]
async fn overlay_refresh_never_rolls_back_a_server_write() -> Result<(), Box<dyn std::error::Error>> {
    let canonical = account("001A", "A").with_field("Rating", "Cold").with_weak_etag(1);
    let refreshed = account("001A", "Z").with_field("Rating", "Cold").with_weak_etag(2);

    // Land the refresh at different points of the edit's overlay refresh.
    for offset in (0..=150).step_by(15) {
        let physical = Arc::new(SqliteDurableStore::open_in_memory()?);
        let slow = Arc::new(LatencyStore::new(physical, Duration::from_millis(20)));
        let client = TestClient::with_store(slow).await?;
        client.engine.ingest_record(&canonical).await?;

        let (edit, refresh) = tokio::join!(
            client
                .engine
                .update_record("001A", [("Rating", FieldValue::text("Hot"))]),
            async {
                tokio::time::sleep(Duration::from_millis(offset)).await;
                client.engine.ingest_record(&refreshed).await
            },
        );
        edit?;
        refresh?;

        let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
        assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Z")), "offset {offset}");
        assert_eq!(record.weak_etag, 2, "offset {offset}");
        assert_eq!(record.field_value("Rating"), Some(&FieldValue::text("Hot")), "offset {offset}");
        let drafts = record.drafts.as_ref().ok_or("no overlay")?;
        assert_eq!(drafts.server_values["Rating"].value, FieldValue::text("Cold"));
    }
    Ok(())
}

// ============================================================================
// Denormalized layout (3 tests)
// ============================================================================

#[tokio::test]
async fn record_is_one_durable_entry() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client
        .engine
        .ingest_record(&account("001A", "Acme").with_field("Rating", "Warm"))
        .await?;

    let key = record_key("001A");
    let physical = client.physical.get_all_entries(DEFAULT_SEGMENT).await?;
    assert_eq!(physical.keys().cloned().collect::<Vec<_>>(), vec![key.clone()]);
    let record = physical[&key].as_record().ok_or("not a record")?;
    assert_eq!(record.links["Rating"].key, field_key(&key, "Rating"));

    let name_key = field_key(&key, "Name");
    let fields = client
        .engine
        .store()
        .get_entries(std::slice::from_ref(&name_key), DEFAULT_SEGMENT)
        .await?;
    assert_eq!(
        fields.get(&name_key).map(|e| &e.data),
        Some(&EntryData::Field(FieldValueRepresentation::plain("Acme")))
    );
    Ok(())
}

#[tokio::test]
async fn dangling_field_reference_skips_the_record() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let key = record_key("001D");
    let mut entries = normalize_record(&account("001D", "Dangling").with_field("Rating", "Cold"));
    entries.remove(&field_key(&key, "Rating"));

    client.engine.store().set_entries(entries, DEFAULT_SEGMENT).await?;
    assert!(client.engine.get_record("001D").await?.is_none());
    assert!(client.physical.get_all_entries(DEFAULT_SEGMENT).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn field_fill_under_a_draft_updates_the_server_value() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001A", "A")).await?;
    let edit = client
        .engine
        .update_record("001A", [("Name", FieldValue::text("B"))])
        .await?;

    let name_key = field_key(&record_key("001A"), "Name");
    let fill = DurableStoreEntries::from([(
        name_key,
        DurableStoreEntry::new(EntryData::Field(FieldValueRepresentation::plain("C"))),
    )]);
    client.engine.store().set_entries(fill, DEFAULT_SEGMENT).await?;

    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("B")));
    let drafts = record.drafts.as_ref().ok_or("no overlay")?;
    assert_eq!(drafts.server_values["Name"].value, FieldValue::text("C"));

    // Discarding the edit reveals the filled value, not the one it replaced.
    client.engine.queue().remove_draft_action(edit.id).await?;
    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("C")));
    assert!(record.drafts.is_none());
    Ok(())
}

// ============================================================================
// Completion and id mapping (3 tests)
// ============================================================================

#[tokio::test]
async fn completed_create_is_read_by_server_id() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let create = client
        .engine
        .create_record("Account", [("Name", FieldValue::text("Acme"))])
        .await?;
    let draft_id = create.target_id.clone();

    client
        .network
        .push_response(record_response(&account("001xyz", "Acme").with_weak_etag(1)));
    assert_eq!(client.engine.process_next().await?, ProcessActionResult::ActionSucceeded);

    let record = client.engine.get_record("001xyz").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Acme")));
    assert!(record.drafts.is_none());
    assert_eq!(record.weak_etag, 1);

    // The draft id still resolves, through the persisted mapping.
    let via_draft = client.engine.get_record(&draft_id).await?.ok_or("mapping not followed")?;
    assert_eq!(via_draft, record);
    let mappings = client.physical.get_all_entries(DRAFT_ID_MAPPINGS_SEGMENT).await?;
    let mapping = mappings[&record_key(&draft_id)].as_id_mapping().ok_or("not a mapping")?;
    assert_eq!(mapping.canonical_key, record_key("001xyz"));

    // The synthetic record is gone from durable storage.
    let physical = client.physical.get_all_entries(DEFAULT_SEGMENT).await?;
    assert!(!physical.contains_key(&record_key(&draft_id)));
    assert!(client.engine.queue().get_queue_actions().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn completed_create_rewrites_later_drafts() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let create = client
        .engine
        .create_record("Account", [("Name", FieldValue::text("Acme"))])
        .await?;
    let draft_id = create.target_id.clone();
    let contact = client
        .engine
        .create_record(
            "Contact",
            [
                ("LastName", FieldValue::text("Lovelace")),
                ("AccountId", FieldValue::text(draft_id.as_str())),
            ],
        )
        .await?;
    let edit = client
        .engine
        .update_record(&draft_id, [("Name", FieldValue::text("Acme 2"))])
        .await?;

    client
        .network
        .push_response(record_response(&account("001xyz", "Acme")));
    assert_eq!(client.engine.process_next().await?, ProcessActionResult::ActionSucceeded);

    let queued = client.engine.queue().get_queue_actions().await?;
    assert_eq!(queued.iter().map(|a| a.id).collect::<Vec<_>>(), vec![contact.id, edit.id]);
    let moved = &queued[1];
    assert_eq!(moved.tag, record_key("001xyz"));
    assert_eq!(moved.target_id, "001xyz");
    assert_eq!(moved.resource().map(|r| r.path.as_str()), Some("/records/001xyz"));
    let contact_body = queued[0]
        .resource()
        .and_then(|r| r.body.as_ref())
        .ok_or("contact lost its body")?;
    assert_eq!(contact_body.fields["AccountId"], FieldValue::text("001xyz"));
    assert_eq!(queued[0].tag, contact.tag);

    let account_record = client.engine.get_record("001xyz").await?.ok_or("record missing")?;
    assert_eq!(account_record.field_value("Name"), Some(&FieldValue::text("Acme 2")));
    let drafts = account_record.drafts.as_ref().ok_or("no overlay")?;
    assert!(drafts.edited && !drafts.created);
    assert_eq!(drafts.draft_action_ids, vec![edit.id]);

    let contact_record = client
        .engine
        .get_record(&contact.target_id)
        .await?
        .ok_or("synthetic contact missing")?;
    assert_eq!(contact_record.field_value("AccountId"), Some(&FieldValue::text("001xyz")));
    Ok(())
}

#[tokio::test]
async fn completed_delete_evicts_the_record() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001A", "A")).await?;
    client.engine.delete_record("001A").await?;
    client.network.push_status(204);

    assert_eq!(client.engine.process_next().await?, ProcessActionResult::ActionSucceeded);
    assert!(client.engine.get_record("001A").await?.is_none());
    assert!(client.engine.queue().get_queue_actions().await?.is_empty());
    Ok(())
}

// ============================================================================
// Persistence (1 test)
// ============================================================================

#[tokio::test]
async fn queue_and_overlay_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("draftq.db");
    let path = path.to_str().ok_or("temp path is not utf-8")?;

    let edit_id = {
        let client = TestClient::open(path).await?;
        client.engine.ingest_record(&account("001A", "A")).await?;
        client
            .engine
            .update_record("001A", [("Name", FieldValue::text("B"))])
            .await?
            .id
    };

    // Simulate a crash mid-upload.
    {
        let raw = SqliteDurableStore::open(path)?;
        let mut entries = raw.get_all_entries(DRAFT_SEGMENT).await?;
        let entry = entries.get_mut(&edit_id.to_string()).ok_or("action not persisted")?;
        if let EntryData::DraftAction(action) = &mut entry.data {
            action.status = DraftActionStatus::Uploading;
        }
        raw.set_entries(entries, DRAFT_SEGMENT).await?;
    }

    let client = TestClient::open(path).await?;
    let queued = client.engine.queue().get_queue_actions().await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, edit_id);
    assert_eq!(queued[0].status, DraftActionStatus::Pending);

    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("B")));

    let later = client
        .engine
        .update_record("001A", [("Name", FieldValue::text("C"))])
        .await?;
    assert!(later.timestamp > queued[0].timestamp);

    client.network.push_status(204);
    client.network.push_status(204);
    assert_eq!(
        client.engine.drain().await?,
        vec![ProcessActionResult::ActionSucceeded; 2]
    );
    let sent: Vec<_> = client
        .network
        .requests()
        .into_iter()
        .filter_map(|r| r.body)
        .map(|b| b.fields["Name"].clone())
        .collect();
    assert_eq!(sent, vec![FieldValue::text("B"), FieldValue::text("C")]);
    Ok(())
}
