use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, path};

use super::*;
use crate::{
    dbf::{Config, Cursor, FieldInfo, FieldType},
    Error,
};

fn scratch_path(name: &str) -> String {
    let file: path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    std::fs::remove_file(&file).ok();
    std::fs::remove_file(file.with_extension("cdx")).ok();
    file.to_string_lossy().to_string()
}

fn loose_config() -> Config {
    let mut config = Config::default();
    config.set_safety(false).set_auto_open(false);
    config
}

fn name_age_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("NAME", FieldType::Character, 10, 0).unwrap(),
        FieldInfo::new("AGE", FieldType::Numeric, 3, 0).unwrap(),
    ]
}

fn seeded(path: &str, rows: &[(&str, i64)]) -> Cursor {
    let mut cursor = Cursor::create(loose_config(), path, name_age_schema()).unwrap();
    let name = cursor.field("NAME").unwrap();
    let age = cursor.field("AGE").unwrap();
    for (n, a) in rows.iter() {
        cursor.append().unwrap();
        cursor.assign(name, n).unwrap();
        cursor.assign_i64(age, *a).unwrap();
        cursor.write().unwrap();
    }
    cursor
}

fn cleanup(path: &str) {
    let file = path::Path::new(path);
    std::fs::remove_file(file).ok();
    std::fs::remove_file(file.with_extension("cdx")).ok();
}

#[test]
fn test_seek_result_codes() {
    assert_eq!(SeekResult::Success.to_code(), 0);
    assert_eq!(SeekResult::Found.to_code(), 1);
    assert_eq!(SeekResult::After.to_code(), 2);
    assert_eq!(SeekResult::Eof.to_code(), 3);
    assert!(SeekResult::Success.is_match());
    assert!(SeekResult::Found.is_match());
    assert!(!SeekResult::After.is_match());
    assert!(!SeekResult::Eof.is_match());
}

#[test]
fn test_seek_exact_after_eof() {
    let path = scratch_path("test-index-seek-three-way.dbf");
    let mut cursor = seeded(&path, &[("Alice", 30), ("Bob", 25), ("Dave", 40)]);

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    assert_eq!(cursor.seek_str("Bob").unwrap(), SeekResult::Success);
    assert!(cursor.found());
    assert_eq!(cursor.current_key().unwrap(), "Bob");
    let name = cursor.field("NAME").unwrap();
    assert_eq!(cursor.as_string(name).unwrap(), "Bob       ");

    assert_eq!(cursor.seek_str("Carol").unwrap(), SeekResult::After);
    assert!(!cursor.found());
    assert_eq!(cursor.current_key().unwrap(), "Dave");

    assert_eq!(cursor.seek_str("Zoe").unwrap(), SeekResult::Eof);
    assert!(!cursor.found());
    assert!(cursor.eof());

    cleanup(&path);
}

#[test]
fn test_descending_walk() {
    let path = scratch_path("test-index-descending-walk.dbf");
    let mut cursor = seeded(&path, &[("Alice", 30), ("Bob", 25), ("Dave", 40)]);
    let age = cursor.field("AGE").unwrap();

    let mut spec = TagSpec::new("BYAGE", "AGE");
    spec.set_descending(true);
    cursor.create_index(None, &[spec]).unwrap();
    cursor.select_tag("BYAGE").unwrap();

    cursor.first().unwrap();
    assert_eq!(cursor.as_int(age).unwrap(), 40);
    cursor.next().unwrap();
    assert_eq!(cursor.as_int(age).unwrap(), 30);
    cursor.next().unwrap();
    assert_eq!(cursor.as_int(age).unwrap(), 25);
    cursor.next().unwrap();
    assert!(cursor.eof());

    assert!(cursor.selected_tag().unwrap().is_descending());

    cleanup(&path);
}

#[test]
fn test_keyed_traversal_order() {
    let path = scratch_path("test-index-keyed-traversal.dbf");
    let rows = [("mango", 5), ("apple", 3), ("peach", 9), ("banana", 1), ("cherry", 7)];
    let mut cursor = seeded(&path, &rows);
    let name = cursor.field("NAME").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["apple", "banana", "cherry", "mango", "peach"]);

    // and backwards from the end.
    let mut seen = vec![];
    cursor.last().unwrap();
    loop {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.previous().unwrap();
        if cursor.bof() {
            break;
        }
    }
    assert_eq!(seen, vec!["peach", "mango", "cherry", "banana", "apple"]);

    cleanup(&path);
}

#[test]
fn test_traversal_skips_deleted() {
    let path = scratch_path("test-index-skips-deleted.dbf");
    let mut cursor = seeded(&path, &[("aa", 1), ("bb", 2), ("cc", 3)]);
    let name = cursor.field("NAME").unwrap();

    cursor.goto(2).unwrap();
    cursor.delete().unwrap();
    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["aa", "cc"]);

    // a seek for the deleted record's key cannot match.
    assert_eq!(cursor.seek_str("bb").unwrap(), SeekResult::After);

    cleanup(&path);
}

#[test]
fn test_expression_keys() {
    let path = scratch_path("test-index-expression-keys.dbf");
    let mut cursor = seeded(&path, &[("delta", 4), ("ALPHA", 1), ("Charlie", 3)]);
    let name = cursor.field("NAME").unwrap();

    cursor
        .create_index(None, &[TagSpec::new("UPNAME", "UPPER(NAME)")])
        .unwrap();
    cursor.select_tag("UPNAME").unwrap();

    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["ALPHA", "Charlie", "delta"]);

    // seeks format through the same evaluator, case folds away.
    assert_eq!(cursor.seek_str("CHARLIE").unwrap(), SeekResult::Success);

    cleanup(&path);
}

#[test]
fn test_filtered_tag() {
    let path = scratch_path("test-index-filtered-tag.dbf");
    let mut cursor = seeded(&path, &[("young", 10), ("mid", 30), ("old", 80)]);
    let name = cursor.field("NAME").unwrap();

    let mut spec = TagSpec::new("BIGAGE", "NAME");
    spec.set_filter("AGE - 30");
    cursor.create_index(None, &[spec]).unwrap();
    cursor.select_tag("BIGAGE").unwrap();

    // a numeric filter is truthy when nonzero, only AGE = 30 drops
    // out.
    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["old", "young"]);

    assert_eq!(cursor.tag("BIGAGE").unwrap().filter(), "AGE - 30");

    cleanup(&path);
}

#[test]
fn test_unique_tag_keeps_first() {
    let path = scratch_path("test-index-unique-tag.dbf");
    let mut cursor =
        seeded(&path, &[("dup", 1), ("dup", 2), ("solo", 3), ("dup", 4)]);
    let age = cursor.field("AGE").unwrap();

    let mut spec = TagSpec::new("UNAME", "NAME");
    spec.set_unique(true);
    cursor.create_index(None, &[spec]).unwrap();
    cursor.select_tag("UNAME").unwrap();

    cursor.first().unwrap();
    assert_eq!(cursor.as_int(age).unwrap(), 1); // first record of the run
    cursor.next().unwrap();
    assert_eq!(cursor.as_int(age).unwrap(), 3);
    cursor.next().unwrap();
    assert!(cursor.eof());

    assert!(cursor.tag("UNAME").unwrap().is_unique());

    cleanup(&path);
}

#[test]
fn test_duplicate_keys_report_found() {
    let path = scratch_path("test-index-duplicate-found.dbf");
    let mut cursor = seeded(&path, &[("dup", 1), ("dup", 2), ("solo", 3)]);
    let age = cursor.field("AGE").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    // positioned on the first duplicate, flagged as Found.
    assert_eq!(cursor.seek_str("dup").unwrap(), SeekResult::Found);
    assert!(cursor.found());
    assert_eq!(cursor.as_int(age).unwrap(), 1);

    // seek_next walks the duplicate run, then falls off it.
    assert_eq!(cursor.seek_next("dup").unwrap(), SeekResult::Success);
    assert_eq!(cursor.as_int(age).unwrap(), 2);
    assert_eq!(cursor.seek_next("dup").unwrap(), SeekResult::After);
    assert_eq!(cursor.as_int(age).unwrap(), 3);

    // a unique key is plain Success.
    assert_eq!(cursor.seek_str("solo").unwrap(), SeekResult::Success);

    cleanup(&path);
}

#[test]
fn test_partial_seek() {
    let path = scratch_path("test-index-partial-seek.dbf");
    let mut cursor =
        seeded(&path, &[("Anderson", 1), ("Andrews", 2), ("Baker", 3)]);
    let name = cursor.field("NAME").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    // only the first three bytes take part in the comparison.
    assert_eq!(cursor.seek_n("And", 3).unwrap(), SeekResult::Found);
    assert_eq!(cursor.as_string(name).unwrap(), "Anderson  ");

    assert_eq!(cursor.seek_n("Bak", 3).unwrap(), SeekResult::Success);
    assert_eq!(cursor.as_string(name).unwrap(), "Baker     ");

    assert_eq!(cursor.seek_n("Az", 2).unwrap(), SeekResult::After);
    assert_eq!(cursor.as_string(name).unwrap(), "Baker     ");

    assert_eq!(cursor.seek_n("Zz", 2).unwrap(), SeekResult::Eof);

    cleanup(&path);
}

#[test]
fn test_numeric_tag_seek() {
    let path = scratch_path("test-index-numeric-seek.dbf");
    let mut cursor = seeded(
        &path,
        &[("a", 300), ("b", -25), ("c", 40), ("d", 7), ("e", -9)],
    );
    let age = cursor.field("AGE").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYAGE", "AGE")]).unwrap();
    cursor.select_tag("BYAGE").unwrap();

    // negatives order below positives.
    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_int(age).unwrap());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec![-25, -9, 7, 40, 300]);

    assert_eq!(cursor.seek_i64(40).unwrap(), SeekResult::Success);
    assert_eq!(cursor.as_int(age).unwrap(), 40);
    assert_eq!(cursor.current_key().unwrap(), "40.00");

    assert_eq!(cursor.seek_f64(10.0).unwrap(), SeekResult::After);
    assert_eq!(cursor.as_int(age).unwrap(), 40);

    assert_eq!(cursor.seek_i64(999).unwrap(), SeekResult::Eof);

    cleanup(&path);
}

#[test]
fn test_stale_marking_and_reindex() {
    let path = scratch_path("test-index-stale-reindex.dbf");
    let mut cursor = seeded(&path, &[("aa", 1), ("bb", 2)]);
    let name = cursor.field("NAME").unwrap();
    let age = cursor.field("AGE").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();
    assert!(!cursor.tag("BYNAME").unwrap().is_stale());

    // mutations mark the attached tags stale.
    cursor.append().unwrap();
    cursor.assign(name, "am").unwrap();
    cursor.assign_i64(age, 3).unwrap();
    cursor.write().unwrap();
    assert!(cursor.tag("BYNAME").unwrap().is_stale());

    cursor.reindex().unwrap();
    assert!(!cursor.tag("BYNAME").unwrap().is_stale());

    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["aa", "am", "bb"]);

    cleanup(&path);
}

#[test]
fn test_pack_requires_reindex() {
    let path = scratch_path("test-index-pack-reindex.dbf");
    let mut cursor = seeded(&path, &[("aa", 1), ("bb", 2), ("cc", 3)]);
    let name = cursor.field("NAME").unwrap();

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.goto(1).unwrap();
    cursor.delete().unwrap();
    cursor.pack().unwrap();
    assert!(cursor.tag("BYNAME").unwrap().is_stale());

    cursor.reindex().unwrap();
    cursor.select_tag("BYNAME").unwrap();
    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.as_string(name).unwrap().trim_end().to_string());
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec!["bb", "cc"]);

    cleanup(&path);
}

#[test]
fn test_multi_tag_index_and_lookup() {
    let path = scratch_path("test-index-multi-tag.dbf");
    let mut cursor = seeded(&path, &[("bb", 2), ("aa", 1)]);

    let specs = vec![TagSpec::new("BYNAME", "NAME"), TagSpec::new("BYAGE", "AGE")];
    cursor.create_index(None, &specs).unwrap();

    assert_eq!(cursor.tags().len(), 2);
    assert!(cursor.tag("byname").is_some()); // case-insensitive
    assert!(cursor.tag("BYAGE").is_some());
    assert!(cursor.tag("NOSUCH").is_none());
    assert!(matches!(cursor.select_tag("NOSUCH"), Err(Error::IndexError(_, _))));

    cursor.select_tag("byage").unwrap();
    assert_eq!(cursor.selected_tag().unwrap().name(), "BYAGE");
    cursor.first().unwrap();
    assert_eq!(cursor.position(), 2); // record with AGE=1

    cursor.clear_tag_selection();
    cursor.first().unwrap();
    assert_eq!(cursor.position(), 1); // physical order again

    cleanup(&path);
}

#[test]
fn test_index_reopen() {
    let path = scratch_path("test-index-reopen.dbf");
    {
        let mut cursor = seeded(&path, &[("bb", 2), ("aa", 1), ("cc", 3)]);
        cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    }

    // auto-open attaches the production index and selects its first
    // tag.
    let mut config = Config::default();
    config.set_safety(false);
    let mut cursor = Cursor::open(config, &path).unwrap();
    let tag = cursor.selected_tag().expect("production index selected");
    assert_eq!(tag.name(), "BYNAME");
    assert_eq!(tag.expression(), "NAME");
    assert_eq!(tag.key_len(), 10);

    let name = cursor.field("NAME").unwrap();
    cursor.first().unwrap();
    assert_eq!(cursor.as_string(name).unwrap(), "aa        ");
    assert_eq!(cursor.seek_str("cc").unwrap(), SeekResult::Success);

    cleanup(&path);
}

#[test]
fn test_tag_position_fraction() {
    let path = scratch_path("test-index-tag-position.dbf");
    let rows: Vec<(String, i64)> =
        (1..=10).map(|i| (format!("k{:02}", i), i)).collect();
    let rows: Vec<(&str, i64)> = rows.iter().map(|(s, i)| (s.as_str(), *i)).collect();
    let mut cursor = seeded(&path, &rows);

    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    cursor.first().unwrap();
    assert!((cursor.tag_position().unwrap() - 0.1).abs() < 1e-9);
    cursor.last().unwrap();
    assert!((cursor.tag_position().unwrap() - 1.0).abs() < 1e-9);

    cursor.tag_set_position(0.5).unwrap();
    assert_eq!(cursor.current_key().unwrap(), "k05");
    cursor.tag_set_position(0.0).unwrap();
    assert_eq!(cursor.current_key().unwrap(), "k01");
    cursor.tag_set_position(1.0).unwrap();
    assert_eq!(cursor.current_key().unwrap(), "k10");

    cleanup(&path);
}

#[test]
fn test_large_tree_multi_level() {
    let seed: u64 = random();
    println!("test_large_tree_multi_level {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let path = scratch_path("test-index-large-tree.dbf");
    let mut cursor = Cursor::create(loose_config(), &path, name_age_schema()).unwrap();
    let name = cursor.field("NAME").unwrap();
    let age = cursor.field("AGE").unwrap();

    // enough keys for several leaves and at least one branch level,
    // a 10-byte key gives 35 entries per block.
    let n = 500 + rng.gen::<u32>() % 500;
    let mut keys = vec![];
    for i in 0..n {
        let key = format!("k{:06}", rng.gen::<u32>() % 1_000_000);
        cursor.append().unwrap();
        cursor.assign(name, &key).unwrap();
        cursor.assign_i64(age, (i % 999) as i64).unwrap();
        cursor.write().unwrap();
        keys.push(key);
    }
    cursor.create_index(None, &[TagSpec::new("BYNAME", "NAME")]).unwrap();
    cursor.select_tag("BYNAME").unwrap();

    // the walk sees every record in non-descending key order.
    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.current_key().unwrap());
        cursor.next().unwrap();
    }
    assert_eq!(seen.len(), keys.len());
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(seen, sorted);

    // every key present seeks to a match.
    for key in keys.iter().take(50) {
        assert!(cursor.seek_str(key).unwrap().is_match(), "{}", key);
        assert_eq!(cursor.current_key().unwrap(), *key);
    }

    cleanup(&path);
}

#[test]
fn test_compound_expression_tag() {
    let path = scratch_path("test-index-compound-expr.dbf");
    let mut cursor = seeded(
        &path,
        &[("beta", 2), ("alpha", 2), ("alpha", 1), ("beta", 1)],
    );

    let spec = TagSpec::new("COMPO", "STR(AGE) + ALLTRIM(NAME)");
    cursor.create_index(None, &[spec]).unwrap();
    cursor.select_tag("COMPO").unwrap();

    let mut seen = vec![];
    cursor.first().unwrap();
    while !cursor.eof() {
        seen.push(cursor.position());
        cursor.next().unwrap();
    }
    // key order: "1.00alpha", "1.00beta", "2.00alpha", "2.00beta"
    assert_eq!(seen, vec![3, 4, 2, 1]);

    cleanup(&path);
}
