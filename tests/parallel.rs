use anyhow::{Result, bail};
use osmjoin::parallel::{MapStats, ParallelMap};
use std::collections::HashSet;
use std::thread;

#[test]
fn every_item_reaches_the_consumer_once() -> Result<()> {
    let mut seen = HashSet::new();
    let stats = ParallelMap::new(4, 8)?.run(
        0..10_000u32,
        |n| Ok(n.to_string()),
        |s| {
            assert!(seen.insert(s));
            Ok(())
        },
    )?;
    assert_eq!(stats, MapStats { ok: 10_000, failed: 0 });
    assert_eq!(seen.len(), 10_000);
    Ok(())
}

#[test]
fn failing_items_are_counted_and_skipped() -> Result<()> {
    let mut sum = 0u64;
    let stats = ParallelMap::new(3, 2)?.run(
        1..=100u64,
        |n| {
            if n % 10 == 0 {
                bail!("item {n} is bad");
            }
            Ok(n)
        },
        |n| {
            sum += n;
            Ok(())
        },
    )?;
    assert_eq!(stats.failed, 10);
    assert_eq!(stats.ok, 90);
    assert_eq!(sum, 5050 - 550);
    Ok(())
}

#[test]
fn consumer_runs_on_the_calling_thread() -> Result<()> {
    let caller = thread::current().id();
    ParallelMap::new(2, 4)?.run(
        0..100,
        |n: i32| Ok(thread::current().id() != caller || n < 0),
        |on_worker| {
            assert!(on_worker);
            assert_eq!(thread::current().id(), caller);
            Ok(())
        },
    )?;
    Ok(())
}

#[test]
fn consumer_error_stops_the_run() -> Result<()> {
    let mut consumed = 0;
    let err = ParallelMap::new(2, 1)?
        .run(
            0..1_000_000u64,
            Ok,
            |_| {
                consumed += 1;
                if consumed == 5 {
                    bail!("disk full");
                }
                Ok(())
            },
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "disk full");
    assert_eq!(consumed, 5);
    Ok(())
}
