use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, ffi, path};

use super::*;

fn scratch_file(name: &str) -> ffi::OsString {
    let file: path::PathBuf = [env::temp_dir(), name.into()].iter().collect();
    std::fs::remove_file(&file).ok();
    file.into_os_string()
}

#[test]
fn test_memo_create_header() {
    let file = scratch_file("test-memo-create-header.fpt");

    let memo = MemoFile::create(&file, false, false).unwrap();
    assert_eq!(memo.block_size(), DEFAULT_BLOCK_SIZE);

    // reopen and confirm the header survives.
    let memo = MemoFile::open(&file, AccessMode::DenyNone).unwrap();
    assert_eq!(memo.block_size(), DEFAULT_BLOCK_SIZE);
    assert_eq!(memo.next_block, 1);

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_write_read() {
    let file = scratch_file("test-memo-write-read.fpt");
    let mut memo = MemoFile::create(&file, false, false).unwrap();

    let a = memo.write(b"a short note").unwrap();
    let b = memo.write("a longer note that still fits one block".as_bytes()).unwrap();
    assert_eq!(a, 1);
    assert_eq!(b, 2);

    assert_eq!(memo.read(a).unwrap().unwrap(), "a short note");
    assert_eq!(
        memo.read(b).unwrap().unwrap(),
        "a longer note that still fits one block"
    );

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_empty_payload() {
    let file = scratch_file("test-memo-empty-payload.fpt");
    let mut memo = MemoFile::create(&file, false, false).unwrap();

    // a zero-length payload is a valid memo, not corruption.
    let empty = memo.write(b"").unwrap();
    let after = memo.write(b"next").unwrap();
    assert_eq!(empty, 1);
    assert_eq!(after, 2);

    assert_eq!(memo.read(empty).unwrap().as_deref(), Some(""));
    assert_eq!(memo.read(after).unwrap().as_deref(), Some("next"));

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_multi_block_payload() {
    let file = scratch_file("test-memo-multi-block.fpt");
    let mut memo = MemoFile::create(&file, false, false).unwrap();

    let big = "x".repeat(1500); // needs three 512-byte blocks
    let a = memo.write(big.as_bytes()).unwrap();
    let b = memo.write(b"after the big one").unwrap();

    assert_eq!(a, 1);
    assert_eq!(b, 4);
    assert_eq!(memo.read(a).unwrap().unwrap(), big);
    assert_eq!(memo.read(b).unwrap().unwrap(), "after the big one");

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_bad_references() {
    let file = scratch_file("test-memo-bad-references.fpt");
    let mut memo = MemoFile::create(&file, false, false).unwrap();
    memo.write(b"only one").unwrap();

    assert_eq!(memo.read(0).unwrap(), None); // block zero is the header
    assert_eq!(memo.read(99).unwrap(), None); // past end of file

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_nul_trim() {
    let file = scratch_file("test-memo-nul-trim.fpt");
    let mut memo = MemoFile::create(&file, false, false).unwrap();

    let block = memo.write(b"padded\x00\x00\x00").unwrap();
    assert_eq!(memo.read(block).unwrap().unwrap(), "padded");

    std::fs::remove_file(&file).unwrap();
}

#[test]
fn test_memo_survives_reopen() {
    let seed: u64 = random();
    println!("test_memo_survives_reopen {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let file = scratch_file("test-memo-survives-reopen.fpt");
    let mut notes: Vec<(u32, String)> = vec![];
    {
        let mut memo = MemoFile::create(&file, false, false).unwrap();
        for i in 0..20 {
            let n = 1 + rng.gen::<usize>() % 900;
            let text: String = (0..n).map(|j| (b'a' + ((i + j) % 26) as u8) as char).collect();
            let block = memo.write(text.as_bytes()).unwrap();
            notes.push((block, text));
        }
        memo.flush().unwrap();
    }

    let mut memo = MemoFile::open(&file, AccessMode::DenyNone).unwrap();
    for (block, text) in notes.iter() {
        assert_eq!(memo.read(*block).unwrap().as_deref(), Some(text.as_str()));
    }

    std::fs::remove_file(&file).unwrap();
}
