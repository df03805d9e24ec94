use db::engine::Engine;
use tempfile::TempDir;

#[test]
fn records_survive_engine_restart() {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("data.db");

    {
        let mut engine = Engine::open(&db_path).expect("open engine");
        engine
            .insert("1", vec!["alice".into(), "a@example.com".into()])
            .expect("insert");
        engine
            .insert("2", vec!["bob".into(), "b@example.com".into()])
            .expect("insert");
        engine
            .insert("3", vec!["carol".into(), "c@example.com".into()])
            .expect("insert");
        assert!(engine.delete("2").expect("delete"));
        // Checkpoint happens on drop.
    }

    let mut engine = Engine::open(&db_path).expect("reopen engine");
    let rows = engine.select("id = 1").expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attrs[0], "alice");

    assert!(engine.select("id = 2").expect("select").is_empty());

    let rows = engine.range(1, 3).expect("range");
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![1, 3]);

    let stats = engine.stats().expect("stats");
    assert_eq!(stats.key_count, 2);
    assert_eq!(stats.hash_entries, 2);
}

#[test]
fn update_and_maintenance_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("data.db");
    let mut engine = Engine::open(&db_path).expect("open engine");

    for key in 1..=30 {
        engine
            .insert(&key.to_string(), vec!["x".repeat(200)])
            .expect("insert");
    }
    assert!(engine
        .update("5", vec!["updated".into()])
        .expect("update"));
    let rows = engine.select("id = 5").expect("select");
    assert_eq!(rows[0].attrs[0], "updated");

    for key in 1..=20 {
        engine.delete(&key.to_string()).expect("delete");
    }
    // Whether or not thresholds fired, maintenance must leave the data
    // reachable.
    engine.maintain().expect("maintain");
    for key in 21..=30 {
        assert_eq!(engine.select(&format!("id = {key}")).expect("select").len(), 1);
    }
}

#[test]
fn reopen_after_unclean_shutdown_recovers() {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("data.db");

    {
        let mut engine = Engine::open(&db_path).expect("open engine");
        engine.insert("10", vec!["durable".into()]).expect("insert");
        // Forget the engine without running its destructor, as a crash
        // would: no page flush, no manifest rewrite beyond the initial one.
        std::mem::forget(engine);
    }

    let mut engine = Engine::open(&db_path).expect("reopen engine");
    let rows = engine.select("id = 10").expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attrs[0], "durable");
}
