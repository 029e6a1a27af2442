use chanbus::eventlog::{EventLog, LogMode, HEADER_SIZE};
use tempfile::tempdir;

#[test]
fn write_close_reopen_read() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("round_trip.log");
    let payload: Vec<u8> = (0..=255u8).collect();

    let mut writer = EventLog::open(&path, LogMode::Write)?;
    assert_eq!(writer.write_record(1_234_567, "CHAN", &payload)?, 0);
    writer.close()?;

    let mut reader = EventLog::open(&path, LogMode::Read)?;
    let record = reader.read_next_record()?.expect("one record");
    assert_eq!(record.eventnum, 0);
    assert_eq!(record.timestamp_us, 1_234_567);
    assert_eq!(record.channel, "CHAN");
    assert_eq!(record.payload, payload);
    assert_eq!(reader.tell(), reader.size()?);
    assert_eq!(reader.size()?, (HEADER_SIZE + 4 + payload.len()) as u64);
    assert!(reader.read_next_record()?.is_none());
    Ok(())
}

#[test]
fn seek_to_every_timestamp() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("seek.log");
    let timestamps: Vec<i64> = (0..64).map(|k| 1_000 + k * k * 7).collect();

    let mut writer = EventLog::open(&path, LogMode::Write)?;
    for (k, ts) in timestamps.iter().enumerate() {
        // Vary the record length so seeks land mid-record.
        let payload = vec![k as u8; (k * 13) % 97];
        writer.write_record(*ts, &format!("CH{k}"), &payload)?;
    }
    writer.close()?;

    let mut reader = EventLog::open(&path, LogMode::Read)?;
    for (k, ts) in timestamps.iter().enumerate() {
        reader.seek_to_timestamp(*ts)?;
        let record = reader.read_next_record()?.expect("record at timestamp");
        assert_eq!(record.timestamp_us, *ts, "seek to t{k}");
        assert_eq!(record.eventnum, k as i64);
    }

    // Between two timestamps lands on the later one; past the end is empty.
    reader.seek_to_timestamp(timestamps[10] + 1)?;
    assert_eq!(reader.read_next_record()?.map(|r| r.eventnum), Some(11));
    reader.seek_to_timestamp(i64::MAX)?;
    assert!(reader.read_next_record()?.is_none());
    reader.seek_to_timestamp(i64::MIN)?;
    assert_eq!(reader.read_next_record()?.map(|r| r.eventnum), Some(0));
    Ok(())
}

#[test]
fn append_session_continues_numbering() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("append.log");

    let mut first = EventLog::open(&path, LogMode::Write)?;
    first.write_record(1, "A", b"a")?;
    first.write_record(2, "A", b"b")?;
    first.close()?;

    let mut second = EventLog::open(&path, LogMode::Append)?;
    assert_eq!(second.next_eventnum(), 2);
    assert_eq!(second.write_record(3, "B", b"c")?, 2);
    second.close()?;

    let mut reader = EventLog::open(&path, LogMode::Read)?;
    let eventnums: Vec<i64> = reader
        .records()
        .map(|r| r.map(|r| r.eventnum))
        .collect::<chanbus::Result<_>>()?;
    assert_eq!(eventnums, vec![0, 1, 2]);
    Ok(())
}
