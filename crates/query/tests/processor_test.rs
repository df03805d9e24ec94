mod common;

use common::temp_buffer_pool;
use query::{BPlusTree, HashIndex, QueryError, QueryProcessor, QueryResult};
use storage::Record;
use tempfile::TempDir;

fn setup() -> (TempDir, QueryProcessor) {
    let (dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool.clone(), true).expect("create tree");
    (dir, QueryProcessor::new(pool, tree, "primary_btree"))
}

fn setup_with_hash() -> (TempDir, QueryProcessor) {
    let (dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool.clone(), true).expect("create tree");
    let hash = HashIndex::new(pool.clone()).expect("create hash index");
    let mut processor = QueryProcessor::new(pool, tree, "primary_btree");
    processor.attach_hash_index("primary_hash", hash);
    (dir, processor)
}

fn user(id: i64, name: &str) -> Record {
    Record::new(id, vec![name.to_string(), format!("{name}@example.com")])
}

#[test]
fn insert_then_point_select() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    processor.insert("42", user(42, "alice"))?;
    let rows = processor.select("id = 42")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attrs[0], "alice");
    assert!(processor.select("id = 43")?.is_empty());
    assert_eq!(processor.stats().total_queries, 3);
    assert!(processor.stats().avg_access_time_us > 0.0);
    Ok(())
}

#[test]
fn comparison_operators_dispatch_to_ranges() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    for key in 1..=20 {
        processor.insert(&key.to_string(), user(key, &format!("u{key}")))?;
    }

    let rows = processor.select("id >= 18")?;
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![18, 19, 20]);

    // The strict comparison maps onto the same closed range.
    let rows = processor.select("id > 18")?;
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![18, 19, 20]);

    let rows = processor.select("id <= 3")?;
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn malformed_conditions_report_offsets() {
    let (_dir, mut processor) = setup();
    match processor.select("id != 5") {
        Err(QueryError::Parse { offset, .. }) => assert_eq!(offset, 3),
        other => panic!("expected parse error, got {other:?}"),
    }
    match processor.select("id = banana") {
        Err(QueryError::Parse { offset, .. }) => assert_eq!(offset, 5),
        other => panic!("expected parse error, got {other:?}"),
    }
    assert!(processor.select("just_one_token").is_err());
}

#[test]
fn update_replaces_record_and_keeps_key() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    processor.insert("7", user(7, "before"))?;
    assert!(processor.update("7", user(7, "after"))?);
    let rows = processor.select("id = 7")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attrs[0], "after");

    assert!(!processor.update("8", user(8, "nobody"))?);
    Ok(())
}

#[test]
fn delete_tracks_health_and_frees_the_key() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    for key in 1..=10 {
        processor.insert(&key.to_string(), user(key, "x"))?;
    }
    assert!(!processor.needs_rebuild());
    for key in 1..=8 {
        assert!(processor.delete(&key.to_string())?);
    }
    assert!(!processor.delete("99")?);

    let health = processor.health();
    assert_eq!(health.total_operations, 18);
    assert_eq!(health.delete_operations, 8);
    // 8 deletes out of 18 operations crossed the 0.4 ratio.
    assert!(processor.needs_rebuild());

    assert!(processor.select("id = 3")?.is_empty());
    assert_eq!(processor.select("id >= 1")?.len(), 2);
    Ok(())
}

#[test]
fn rebuild_resets_health_and_preserves_data() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    for key in 1..=50 {
        processor.insert(&key.to_string(), user(key, &format!("u{key}")))?;
    }
    for key in 1..=30 {
        processor.delete(&key.to_string())?;
    }
    assert!(processor.needs_rebuild());

    processor.rebuild_index()?;
    let health = processor.health();
    assert_eq!(health.total_operations, 0);
    assert_eq!(health.delete_operations, 0);
    assert!(!processor.needs_rebuild());

    for key in 31..=50 {
        let rows = processor.select(&format!("id = {key}"))?;
        assert_eq!(rows.len(), 1, "key {key}");
        assert_eq!(rows[0].attrs[0], format!("u{key}"));
    }
    assert_eq!(processor.tree().len()?, 20);
    Ok(())
}

#[test]
fn range_select_returns_records_in_key_order() -> QueryResult<()> {
    let (_dir, mut processor) = setup();
    for key in (1..=100).rev() {
        processor.insert(&key.to_string(), user(key, &format!("u{key}")))?;
    }
    let rows = processor.range_select(40, 44)?;
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![40, 41, 42, 43, 44]);
    Ok(())
}

#[test]
fn exact_match_uses_the_hash_index() -> QueryResult<()> {
    let (_dir, mut processor) = setup_with_hash();
    for key in 1..=25 {
        processor.insert(&key.to_string(), user(key, &format!("u{key}")))?;
    }
    let hash_entries = processor
        .hash_index()
        .map(|hash| hash.entry_count())
        .unwrap_or(0);
    assert_eq!(hash_entries, 25);

    let rows = processor.select("id = 17")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attrs[0], "u17");

    // Deletes keep both indexes aligned.
    assert!(processor.delete("17")?);
    assert!(processor.select("id = 17")?.is_empty());
    let hash_entries = processor
        .hash_index()
        .map(|hash| hash.entry_count())
        .unwrap_or(0);
    assert_eq!(hash_entries, 24);

    // Ranges still come from the tree.
    let rows = processor.select("id >= 24")?;
    assert_eq!(rows.len(), 2);
    Ok(())
}

#[test]
fn records_spill_across_data_pages() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool.clone(), true).expect("create tree");
    let mut processor = QueryProcessor::new(pool, tree, "primary");
    let payload = "p".repeat(500);
    for key in 1..=40 {
        processor.insert(&key.to_string(), Record::new(key, vec![payload.clone()]))?;
    }
    assert!(processor.data_pages().len() > 1);
    for key in 1..=40 {
        let rows = processor.select(&format!("id = {key}"))?;
        assert_eq!(rows.len(), 1);
    }
    Ok(())
}
