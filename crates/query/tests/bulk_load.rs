mod common;

use common::{ptr_for, temp_buffer_pool};
use query::{BPlusTree, QueryResult};

fn height_bound(n: f64, max_keys: f64, fill_factor: f64) -> usize {
    let leaves = n / (max_keys * fill_factor);
    (leaves.log(max_keys + 1.0).ceil() as usize).max(1) + 1
}

#[test]
fn bulk_loaded_tree_answers_all_lookups() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create(pool, true)?;
    let n = 5_000i64;
    let entries: Vec<_> = (1..=n).map(|key| (key, ptr_for(key))).collect();
    tree.bulk_replace(entries, 0.85)?;

    assert_eq!(tree.len()?, n as u64);
    for key in 1..=n {
        assert_eq!(tree.find(key)?, ptr_for(key), "key {key}");
    }
    assert!(!tree.contains(0)?);
    assert!(!tree.contains(n + 1)?);

    let bound = height_bound(n as f64, tree.max_keys() as f64, 0.85);
    assert!(
        tree.height()? <= bound,
        "height {} exceeds bound {bound}",
        tree.height()?
    );
    Ok(())
}

#[test]
fn leaves_are_packed_to_the_fill_factor() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, true, 10)?;
    let n = 500i64;
    let entries: Vec<_> = (1..=n).map(|key| (key, ptr_for(key))).collect();
    tree.bulk_replace(entries, 0.85)?;

    let fills = tree.leaf_fill_factors()?;
    assert!(fills.len() > 1);
    let (last, packed) = fills.split_last().expect("at least one leaf");
    for fill in packed {
        assert!(*fill >= 0.85 - 1e-9, "leaf fill {fill} below target");
    }
    assert!(*last > 0.0);

    let bound = height_bound(n as f64, 10.0, 0.85);
    assert!(tree.height()? <= bound);

    // The scan order survives the rebuild.
    let keys: Vec<i64> = tree.entries()?.iter().map(|(key, _)| *key).collect();
    let expected: Vec<i64> = (1..=n).collect();
    assert_eq!(keys, expected);
    Ok(())
}

#[test]
fn trailing_parent_groups_are_balanced() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    // Order two: seven entries pack into four leaves. Naive grouping of
    // three children per parent would leave a keyless one-child trailing
    // parent; balancing splits the leaves two-and-two instead.
    let tree = BPlusTree::create_with_order(pool.clone(), true, 2)?;
    let entries: Vec<_> = (1..=7).map(|key| (key, ptr_for(key))).collect();
    tree.bulk_replace(entries, 0.85)?;
    tree.check_integrity()?;
    for key in 1..=7 {
        assert_eq!(tree.find(key)?, ptr_for(key));
    }

    // Order four: six full leaves group three-and-three rather than
    // five-and-one.
    let tree = BPlusTree::create_with_order(pool, true, 4)?;
    let entries: Vec<_> = (1..=24).map(|key| (key, ptr_for(key))).collect();
    tree.bulk_replace(entries, 0.85)?;
    tree.check_integrity()?;
    assert_eq!(tree.len()?, 24);
    for key in 1..=24 {
        assert_eq!(tree.find(key)?, ptr_for(key));
    }
    Ok(())
}

#[test]
fn bulk_replace_of_empty_input_leaves_empty_tree() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, true, 4)?;
    for key in 0..10 {
        tree.insert(key, ptr_for(key))?;
    }
    tree.bulk_replace(Vec::new(), 0.85)?;
    assert_eq!(tree.len()?, 0);
    assert!(!tree.contains(3)?);
    assert_eq!(tree.height()?, 1);
    Ok(())
}

#[test]
fn range_scans_work_after_bulk_load() -> QueryResult<()> {
    let (_dir, pool) = temp_buffer_pool();
    let tree = BPlusTree::create_with_order(pool, true, 8)?;
    let entries: Vec<_> = (0..200).map(|key| (key * 2, ptr_for(key * 2))).collect();
    tree.bulk_replace(entries, 0.85)?;

    let hits = tree.range(10, 30)?;
    let keys: Vec<i64> = hits.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, vec![10, 12, 14, 16, 18, 20, 22, 24, 26, 28, 30]);
    assert_eq!(tree.min()?, Some(0));
    assert_eq!(tree.max()?, Some(398));
    Ok(())
}
