mod common;

use common::{ptr_for, temp_buffer_pool};
use query::{BPlusTree, QueryResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use storage::{PageType, INVALID_PAGE_ID};

#[test]
fn empty_tree_lookups() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool, false)?;
    assert!(!tree.find(1)?.is_valid());
    assert!(!tree.contains(1)?);
    assert!(tree.range(0, 100)?.is_empty());
    assert_eq!(tree.min()?, None);
    assert_eq!(tree.max()?, None);
    assert_eq!(tree.len()?, 0);
    tree.check_integrity()?;
    Ok(())
}

#[test]
fn fixed_shape_with_order_two() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, false, 2)?;
    for key in [50, 70, 150, 175, 100, 200, 250, 20, 90, 235] {
        tree.insert(key, ptr_for(key))?;
    }
    let rendered: String = tree
        .entries()?
        .iter()
        .map(|(key, _)| format!("{key}|"))
        .collect();
    assert_eq!(rendered, "20|50|70|90|100|150|175|200|235|250|");

    assert!(tree.find(150)?.is_valid());
    assert_eq!(tree.find(150)?, ptr_for(150));
    assert!(!tree.contains(999)?);
    assert_eq!(tree.lower_bound(150)?, Some(150));
    assert_eq!(tree.upper_bound(150)?, Some(175));
    assert_eq!(tree.min()?, Some(20));
    assert_eq!(tree.max()?, Some(250));
    assert!(tree.height()? > 1);
    tree.check_integrity()?;
    Ok(())
}

#[test]
fn remove_and_reinsert() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, false, 2)?;
    for key in [50, 70, 150, 175, 100, 200, 250, 20, 90, 235] {
        tree.insert(key, ptr_for(key))?;
    }
    let before = tree.entries()?;

    // Removing an absent key is a no-op.
    assert!(!tree.remove(270)?);
    assert_eq!(tree.entries()?, before);

    assert!(tree.remove(250)?);
    tree.check_integrity()?;
    tree.insert(250, ptr_for(250))?;
    assert_eq!(tree.entries()?, before);
    tree.check_integrity()?;

    assert!(!tree.remove(260)?);
    assert!(tree.remove(70)?);
    let keys: Vec<i64> = tree.entries()?.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, vec![20, 50, 90, 100, 150, 175, 200, 235, 250]);
    assert!(!tree.contains(70)?);
    tree.check_integrity()?;
    Ok(())
}

#[test]
fn range_scan_over_thousand_keys() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool, true)?;
    for key in 1..=1000 {
        tree.insert(key, ptr_for(key))?;
    }
    let hits = tree.range(250, 260)?;
    assert_eq!(hits.len(), 11);
    for (index, (key, found)) in hits.iter().enumerate() {
        assert_eq!(*key, 250 + index as i64);
        assert_eq!(*found, ptr_for(*key));
    }
    assert!(tree.range(1001, 2000)?.is_empty());
    tree.check_integrity()?;
    Ok(())
}

#[test]
fn random_workload_matches_reference() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, true, 4)?;
    let mut rng = StdRng::seed_from_u64(0xB7EE);
    let mut reference = BTreeMap::new();

    while reference.len() < 300 {
        let key = rng.gen_range(0..10_000);
        let pointer = ptr_for(key);
        tree.insert(key, pointer)?;
        reference.insert(key, pointer);
    }
    tree.check_integrity()?;

    let keys: Vec<i64> = reference.keys().copied().collect();
    for (round, key) in keys.iter().enumerate() {
        if round % 2 == 0 {
            assert!(tree.remove(*key)?, "key {key} should be removable");
            reference.remove(key);
            if round % 50 == 0 {
                tree.check_integrity()?;
            }
        }
    }
    tree.check_integrity()?;

    assert_eq!(tree.len()?, reference.len() as u64);
    for (key, pointer) in &reference {
        assert_eq!(tree.find(*key)?, *pointer);
    }
    let scanned: Vec<i64> = tree.entries()?.iter().map(|(key, _)| *key).collect();
    let expected: Vec<i64> = reference.keys().copied().collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn delete_everything_collapses_to_empty_root() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, true, 2)?;
    for key in 0..64 {
        tree.insert(key, ptr_for(key))?;
    }
    assert!(tree.height()? >= 3);
    for key in 0..64 {
        assert!(tree.remove(key)?);
    }
    assert_eq!(tree.len()?, 0);
    assert_eq!(tree.height()?, 1);
    tree.check_integrity()?;

    // The emptied tree is still usable.
    tree.insert(7, ptr_for(7))?;
    assert_eq!(tree.find(7)?, ptr_for(7));
    Ok(())
}

#[test]
fn duplicate_policy_follows_constructor_flag() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let unique = BPlusTree::create_with_order(pool.clone(), true, 4)?;
    unique.insert(5, ptr_for(5))?;
    unique.insert(5, ptr_for(99))?;
    assert_eq!(unique.len()?, 1);
    assert_eq!(unique.find(5)?, ptr_for(99));

    let multi = BPlusTree::create_with_order(pool, false, 4)?;
    multi.insert(5, ptr_for(1))?;
    multi.insert(5, ptr_for(2))?;
    multi.insert(5, ptr_for(3))?;
    assert_eq!(multi.len()?, 3);
    assert_eq!(multi.find_all(5)?.len(), 3);
    multi.check_integrity()?;
    Ok(())
}

#[test]
fn broken_leaf_chain_heals_itself() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool.clone(), true, 2)?;
    for key in 0..20 {
        tree.insert(key, ptr_for(key))?;
    }

    // Point some leaf's chain link at a data page behind the tree's back.
    let data_page = pool.new_page().expect("allocate data page");
    {
        let mut guard = pool.fetch_page(data_page).expect("fetch data page");
        guard.init(data_page, PageType::Data);
    }
    pool.unpin_page(data_page, true).expect("unpin");
    pool.unpin_page(data_page, true).expect("unpin");

    let total_pages = pool.with_file_manager(|file| file.total_pages()) as i64;
    let mut victim = INVALID_PAGE_ID;
    for page_id in 0..total_pages {
        let is_linked_leaf = {
            let guard = pool.fetch_page(page_id).expect("fetch page");
            guard.page_type() == PageType::Index
                && guard.is_leaf()
                && guard.next_leaf() != INVALID_PAGE_ID
        };
        pool.unpin_page(page_id, false).expect("unpin");
        if is_linked_leaf {
            victim = page_id;
            break;
        }
    }
    assert_ne!(victim, INVALID_PAGE_ID, "expected a chained leaf");
    {
        let mut guard = pool.fetch_page(victim).expect("fetch victim");
        guard.set_next_leaf(data_page);
        guard.update_checksum();
    }
    pool.unpin_page(victim, true).expect("unpin");

    // The scan ends at the broken link instead of walking into the data
    // page, and the link is reset.
    let entries = tree.entries()?;
    assert!(entries.len() < 20);
    let healed = {
        let guard = pool.fetch_page(victim).expect("fetch victim");
        guard.next_leaf()
    };
    pool.unpin_page(victim, false).expect("unpin");
    assert_eq!(healed, INVALID_PAGE_ID);
    Ok(())
}
