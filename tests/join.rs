use anyhow::Result;
use osmjoin::config::SorterConfig;
use osmjoin::io::write_records;
use osmjoin::join::{JoinedGroup, SortMergeJoin, join_files};
use osmjoin::record::{Record, RecordError, RecordErrorKind};
use osmjoin::sorter::SortingWriter;
use osmjoin::testing::records;

fn left() -> Vec<Record> {
    records(&[
        ("1", "one"),
        ("1", "ein"),
        ("2", "two"),
        ("3", "drei"),
        ("3", "three"),
        ("3", "drie"),
        ("4", "four"),
        ("5", "five"),
    ])
}

fn right() -> Vec<Record> {
    records(&[
        ("1", "111111"),
        ("1", "111"),
        ("1", "1"),
        ("2", "22222"),
        ("2", "22"),
        ("5", "5555"),
        ("6", "6666"),
    ])
}

fn shape(groups: &[JoinedGroup]) -> Vec<(&str, usize, usize)> {
    groups
        .iter()
        .map(|g| (g.key.as_str(), g.left.len(), g.right.len()))
        .collect()
}

#[test]
fn groups_only_keys_on_both_sides() -> Result<()> {
    let groups: Vec<JoinedGroup> =
        SortMergeJoin::new(left().into_iter().map(Ok), right().into_iter().map(Ok))
            .collect::<Result<_>>()?;
    assert_eq!(shape(&groups), vec![("1", 2, 3), ("2", 1, 2), ("5", 1, 1)]);
    assert_eq!(groups[0].left, vec!["one", "ein"]);
    assert_eq!(groups[0].right, vec!["111111", "111", "1"]);
    assert_eq!(groups[0].pairs().count(), 6);
    Ok(())
}

#[test]
fn joins_sorter_outputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut outputs = Vec::new();
    for (name, data) in [("left", left()), ("right", right())] {
        let sorter = SortingWriter::open(
            SorterConfig::new(dir.path().join(name), dir.path().join(format!("{name}.gz")), 3)?
                .with_log_every(0),
        )?;
        // Feed in reverse so the sorter has real work to do.
        for r in data.iter().rev() {
            sorter.put(r.key.as_str(), r.value.as_str())?;
        }
        outputs.push(sorter.close()?.output);
    }

    let groups: Vec<JoinedGroup> = join_files(&outputs[0], &outputs[1])?.collect::<Result<_>>()?;
    assert_eq!(shape(&groups), vec![("1", 2, 3), ("2", 1, 2), ("5", 1, 1)]);
    Ok(())
}

#[test]
fn validated_join_accepts_sorted_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let l = dir.path().join("l.gz");
    let r = dir.path().join("r.gz");
    write_records(&l, &left())?;
    write_records(&r, &right())?;
    let groups: Vec<JoinedGroup> = join_files(&l, &r)?.validated().collect::<Result<_>>()?;
    assert_eq!(groups.len(), 3);
    Ok(())
}

#[test]
fn validated_join_rejects_unsorted_right() {
    let mut unsorted = right();
    unsorted.swap(2, 3);
    let err = SortMergeJoin::new(left().into_iter().map(Ok), unsorted.into_iter().map(Ok))
        .validated()
        .find_map(Result::err)
        .expect("out-of-order right side detected");
    assert_eq!(
        err.downcast_ref::<RecordError>().map(|e| e.kind),
        Some(RecordErrorKind::UnsortedInput)
    );
}

#[test]
fn malformed_line_aborts_the_join() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let l = dir.path().join("l.txt");
    let r = dir.path().join("r.txt");
    std::fs::write(&l, "1;a\nno delimiter here\n3;c\n")?;
    std::fs::write(&r, "1;x\n3;z\n")?;
    let results: Vec<Result<JoinedGroup>> = join_files(&l, &r)?.collect();
    assert_eq!(results.len(), 2);
    let err = results[1].as_ref().expect_err("parse error");
    assert_eq!(
        err.downcast_ref::<RecordError>().map(|e| e.kind),
        Some(RecordErrorKind::MissingDelimiter)
    );
    Ok(())
}
