use draftq_core::{
    FieldValue, FieldValueRepresentation, RecordRepresentation, StoreLink, field_key,
    is_draft_record_id, record_key,
};
use draftq_engine::RecordCache;
use draftq_harness::{TEST_USER_ID, TestClient};
use draftq_storage::EntryData;

fn account(id: &str, name: &str) -> RecordRepresentation {
    RecordRepresentation::new("Account", id).with_field("Name", name)
}

// ============================================================================
// Edit overlays (4 tests)
// ============================================================================

#[tokio::test]
async fn edit_overlay_rolls_back_cleanly() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001A", "A")).await?;
    let edit = client
        .engine
        .update_record("001A", [("Name", FieldValue::text("B"))])
        .await?;

    let overlaid = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(overlaid.field_value("Name"), Some(&FieldValue::text("B")));
    let drafts = overlaid.drafts.as_ref().ok_or("no overlay")?;
    assert!(drafts.edited);
    assert!(!drafts.created && !drafts.deleted);
    assert_eq!(drafts.server_values["Name"].value, FieldValue::text("A"));
    assert_eq!(
        overlaid.field_value("LastModifiedById"),
        Some(&FieldValue::text(TEST_USER_ID))
    );

    client.engine.queue().remove_draft_action(edit.id).await?;
    let restored = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(restored.field_value("Name"), Some(&FieldValue::text("A")));
    assert!(restored.drafts.is_none());
    assert!(restored.field_value("LastModifiedById").is_none());
    assert!(restored.field_value("LastModifiedDate").is_none());
    Ok(())
}

#[tokio::test]
async fn later_edit_wins_and_first_value_is_kept() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001E", "Justin")).await?;
    let edit1 = client
        .engine
        .update_record("001E", [("Name", FieldValue::text("Jason"))])
        .await?;
    let edit2 = client
        .engine
        .update_record("001E", [("Name", FieldValue::text("Jay"))])
        .await?;

    let record = client.engine.get_record("001E").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Jay")));
    let drafts = record.drafts.as_ref().ok_or("no overlay")?;
    assert_eq!(drafts.server_values["Name"].value, FieldValue::text("Justin"));
    assert_eq!(drafts.draft_action_ids, vec![edit1.id, edit2.id]);
    assert_eq!(drafts.latest_draft_action_id, Some(edit2.id));

    // Dropping the older edit keeps the newer one applied.
    client.engine.queue().remove_draft_action(edit1.id).await?;
    let record = client.engine.get_record("001E").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Jay")));
    assert_eq!(
        record.drafts.as_ref().map(|d| d.draft_action_ids.clone()),
        Some(vec![edit2.id])
    );
    Ok(())
}

#[tokio::test]
async fn recomputing_an_overlay_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let canonical = account("001A", "A").with_field("Rating", "Warm");
    client.engine.ingest_record(&canonical).await?;
    let edit = client
        .engine
        .update_record(
            "001A",
            [("Name", FieldValue::text("B")), ("Rating", FieldValue::text("Hot"))],
        )
        .await?;
    let before = client.engine.get_record("001A").await?.ok_or("record missing")?;

    // Rewriting the action and re-ingesting the same canonical record both replay again.
    client
        .engine
        .queue()
        .update_draft_action_metadata(edit.id, edit.metadata.clone())
        .await?;
    client.engine.ingest_record(&canonical).await?;
    let after = client.engine.get_record("001A").await?.ok_or("record missing")?;

    assert_eq!(before, after);
    assert_eq!(serde_json::to_vec(&before)?, serde_json::to_vec(&after)?);
    assert_eq!(
        after.fields["Rating"].display_value.as_deref(),
        Some("Hot")
    );
    Ok(())
}

#[tokio::test]
async fn server_refresh_under_pending_edit_keeps_edit() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001A", "A")).await?;
    client
        .engine
        .update_record("001A", [("Name", FieldValue::text("Mine"))])
        .await?;

    let refreshed = account("001A", "Theirs").with_weak_etag(7);
    client.engine.ingest_record(&refreshed).await?;

    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Mine")));
    assert_eq!(record.weak_etag, 7);
    let drafts = record.drafts.as_ref().ok_or("no overlay")?;
    assert_eq!(drafts.server_values["Name"].value, FieldValue::text("Theirs"));
    Ok(())
}

// ============================================================================
// Creates and deletes (3 tests)
// ============================================================================

#[tokio::test]
async fn create_draft_is_readable_as_synthetic_record() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let create = client
        .engine
        .create_record("Account", [("Name", FieldValue::text("Acme"))])
        .await?;
    assert!(is_draft_record_id(&create.target_id));
    assert!(create.target_id.starts_with("DRAFT-001-"));

    let record = client
        .engine
        .get_record(&create.target_id)
        .await?
        .ok_or("synthetic record missing")?;
    assert_eq!(record.id, create.target_id);
    assert_eq!(record.api_name, "Account");
    assert_eq!(record.weak_etag, -1);
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Acme")));
    assert_eq!(record.field_value("Id"), Some(&FieldValue::text(create.target_id.as_str())));
    assert_eq!(record.field_value("CreatedById"), Some(&FieldValue::text(TEST_USER_ID)));
    let drafts = record.drafts.as_ref().ok_or("no overlay")?;
    assert!(drafts.created);
    assert_eq!(drafts.draft_action_ids, vec![create.id]);

    // Discarding the create discards the record with it.
    client.engine.queue().remove_draft_action(create.id).await?;
    assert!(client.engine.get_record(&create.target_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn edit_of_draft_record_stacks_on_create() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let create = client
        .engine
        .create_record("Account", [("Name", FieldValue::text("Acme"))])
        .await?;
    let edit = client
        .engine
        .update_record(&create.target_id, [("Name", FieldValue::text("Acme Ltd"))])
        .await?;
    assert_eq!(edit.tag, create.tag);

    let record = client
        .engine
        .get_record(&create.target_id)
        .await?
        .ok_or("synthetic record missing")?;
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("Acme Ltd")));
    let drafts = record.drafts.as_ref().ok_or("no overlay")?;
    assert!(drafts.created && drafts.edited);
    assert_eq!(drafts.draft_action_ids, vec![create.id, edit.id]);
    Ok(())
}

#[tokio::test]
async fn delete_draft_marks_record_deleted() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001A", "A")).await?;
    client.engine.delete_record("001A").await?;

    let record = client.engine.get_record("001A").await?.ok_or("record missing")?;
    assert!(record.drafts.as_ref().is_some_and(|d| d.deleted));
    assert_eq!(record.field_value("Name"), Some(&FieldValue::text("A")));
    Ok(())
}

// ============================================================================
// References and cache (3 tests)
// ============================================================================

#[tokio::test]
async fn reference_edit_links_a_stub_record() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client
        .engine
        .ingest_record(&RecordRepresentation::new("Contact", "003C").with_field("LastName", "Lovelace"))
        .await?;
    client
        .engine
        .update_record("003C", [("AccountId", FieldValue::text("001P"))])
        .await?;

    let contact = client.engine.get_record("003C").await?.ok_or("record missing")?;
    assert_eq!(contact.field_value("AccountId"), Some(&FieldValue::text("001P")));
    assert_eq!(
        contact.field_value("Account"),
        Some(&FieldValue::Link(StoreLink::new(record_key("001P"))))
    );

    let stub = client.engine.get_record("001P").await?.ok_or("stub missing")?;
    assert_eq!(stub.api_name, "Account");
    assert_eq!(stub.field_value("Id"), Some(&FieldValue::text("001P")));
    Ok(())
}

#[tokio::test]
async fn stub_never_replaces_stored_record() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    client.engine.ingest_record(&account("001Q", "Parent Co")).await?;
    client
        .engine
        .ingest_record(&RecordRepresentation::new("Contact", "003C").with_field("LastName", "Lovelace"))
        .await?;
    client
        .engine
        .update_record("003C", [("AccountId", FieldValue::text("001Q"))])
        .await?;

    let parent = client.engine.get_record("001Q").await?.ok_or("record missing")?;
    assert_eq!(parent.field_value("Name"), Some(&FieldValue::text("Parent Co")));
    assert!(parent.field_value("Id").is_none());
    Ok(())
}

#[tokio::test]
async fn pumped_changes_reach_the_cache() -> Result<(), Box<dyn std::error::Error>> {
    let client = TestClient::new().await?;
    let cache = client.engine.cache().clone();
    let mut rx = cache.subscribe();

    client.engine.ingest_record(&account("001A", "A")).await?;
    client
        .engine
        .update_record("001A", [("Name", FieldValue::text("B"))])
        .await?;
    assert!(client.engine.pump_changes().await? > 0);

    let key = record_key("001A");
    assert!(matches!(cache.get(&key), Some(EntryData::NormalizedRecord(_))));
    assert_eq!(
        cache.get(&field_key(&key, "Name")),
        Some(EntryData::Field(FieldValueRepresentation::plain("B")))
    );
    let published = rx.try_recv()?;
    assert!(published.contains(&key));

    // Nothing new since the last pump.
    assert_eq!(client.engine.pump_changes().await?, 0);
    Ok(())
}
