use anyhow::Result;
use osmjoin::config::SorterConfig;
use osmjoin::record::{Record, RecordError, RecordErrorKind};
use osmjoin::sorter::SortingWriter;
use osmjoin::testing::{assert_non_decreasing, assert_same_multiset, read_records};
use std::path::Path;
use std::sync::Arc;
use std::thread;

fn open(dir: &Path, name: &str, bucket_size: usize) -> Result<SortingWriter> {
    let config = SorterConfig::new(
        dir.join("work").join(name),
        dir.join(format!("{name}.gz")),
        bucket_size,
    )?
    .with_log_every(0);
    SortingWriter::open(config)
}

/// Deterministic pseudo-random input with plenty of repeated keys and records.
fn shuffled_input(n: u64) -> Vec<Record> {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    (0..n)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = format!("{:05}", state % 97);
            let value = format!("v{}", i % 5);
            Record::new(key, value)
        })
        .collect()
}

#[test]
fn round_trip_preserves_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = vec![
        Record::new("b", "2"),
        Record::new("a", "1"),
        Record::new("b", "2"),
        Record::new("a", "1"),
        Record::new("c", "3"),
        Record::new("a", "0"),
    ];
    let sorter = open(dir.path(), "dups", 4)?;
    for r in &input {
        sorter.put(r.key.as_str(), r.value.as_str())?;
    }
    let stats = sorter.close()?;
    assert_eq!(stats.records, 6);

    let output = read_records(&stats.output)?;
    assert_non_decreasing(&output);
    assert_same_multiset(&output, &input);
    Ok(())
}

#[test]
fn output_is_sorted_by_key_across_many_buckets() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = shuffled_input(2_000);
    let sorter = open(dir.path(), "many", 37)?;
    for r in &input {
        sorter.put(r.key.as_str(), r.value.as_str())?;
    }
    let stats = sorter.close()?;
    assert!(stats.buckets > 50);

    let output = read_records(&stats.output)?;
    assert_non_decreasing(&output);
    assert_same_multiset(&output, &input);
    Ok(())
}

#[test]
fn empty_input_gives_empty_output_and_no_work_dir() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sorter = open(dir.path(), "empty", 10)?;
    let stats = sorter.close()?;
    assert_eq!(stats.records, 0);
    assert_eq!(stats.buckets, 0);
    assert!(stats.output.exists());
    assert!(read_records(&stats.output)?.is_empty());
    assert!(!dir.path().join("work").join("empty").exists());
    Ok(())
}

#[test]
fn concurrent_puts_lose_nothing() -> Result<()> {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1_500;

    let dir = tempfile::tempdir()?;
    let sorter = Arc::new(open(dir.path(), "concurrent", 64)?);
    thread::scope(|s| {
        for t in 0..THREADS {
            let sorter = Arc::clone(&sorter);
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    sorter
                        .put(format!("{:06}", (i * 31 + t) % 1000), format!("t{t}-{i}"))
                        .expect("put");
                }
            });
        }
    });
    let sorter = Arc::into_inner(sorter).expect("all writers joined");
    assert_eq!(sorter.stats().records, (THREADS * PER_THREAD) as u64);
    let stats = sorter.close()?;

    let output = read_records(&stats.output)?;
    assert_eq!(output.len(), THREADS * PER_THREAD);
    assert_non_decreasing(&output);
    let mut values: Vec<&str> = output.iter().map(|r| r.value.as_str()).collect();
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), THREADS * PER_THREAD);
    Ok(())
}

#[test]
fn bucket_size_does_not_change_the_result() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = shuffled_input(500);

    let small = open(dir.path(), "small", 7)?;
    let large = open(dir.path(), "large", 10_000)?;
    for r in &input {
        small.put(r.key.as_str(), r.value.as_str())?;
        large.put(r.key.as_str(), r.value.as_str())?;
    }
    let small = small.close()?;
    let large = large.close()?;
    assert!(small.buckets > 1);
    assert_eq!(large.buckets, 1);

    let small = read_records(&small.output)?;
    let large = read_records(&large.output)?;
    // Order within a key run may differ between bucket layouts.
    assert_same_multiset(&small, &large);
    assert_eq!(
        small.iter().map(|r| &r.key).collect::<Vec<_>>(),
        large.iter().map(|r| &r.key).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn delimiter_in_value_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sorter = open(dir.path(), "reserved", 10)?;
    let err = sorter.put("k", "a;b").unwrap_err();
    assert_eq!(
        err.downcast_ref::<RecordError>().map(|e| e.kind),
        Some(RecordErrorKind::ReservedCharacter)
    );
    assert!(sorter.put("k", "line\nbreak").is_err());
    sorter.put("k", "fine")?;
    assert_eq!(sorter.close()?.records, 1);
    Ok(())
}

#[test]
fn unrecognised_output_extension_is_still_compressed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("sorted.out");
    let config = SorterConfig::new(dir.path().join("w"), &out, 2)?.with_log_every(0);
    let sorter = SortingWriter::open(config)?;
    sorter.put("2", "b")?;
    sorter.put("1", "a")?;
    sorter.put("3", "c")?;
    sorter.close()?;

    let raw = std::fs::read(&out)?;
    assert_eq!(&raw[..2], &[0x1f, 0x8b], "output is not gzip");
    assert_eq!(
        read_records(&out)?,
        vec![Record::new("1", "a"), Record::new("2", "b"), Record::new("3", "c")]
    );
    assert!(!dir.path().join("sorted.out.partial").exists());
    Ok(())
}
