use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanbus::{Broker, Error, EventLog, LogMode};
use tempfile::tempdir;

fn file_url(path: &std::path::Path, mode: &str) -> String {
    format!("file://{}?mode={mode}", path.display())
}

#[test]
fn writer_broker_only_publishes() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("write.log");
    let broker = Broker::open(&file_url(&path, "w"))?;

    for n in 0..5u8 {
        broker.publish("REC", &[n])?;
    }
    assert!(matches!(broker.handle(), Err(Error::WriteOnlyViolation)));
    assert!(matches!(
        broker.handle_timeout(0),
        Err(Error::WriteOnlyViolation)
    ));
    broker.publish("REC", b"still fine")?;
    broker.close();

    let mut log = EventLog::open(&path, LogMode::Read)?;
    assert_eq!(log.records().count(), 6);
    Ok(())
}

#[test]
fn reader_broker_replays_then_ends() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("read.log");
    let mut log = EventLog::open(&path, LogMode::Write)?;
    log.write_record(100, "POSE", b"p1")?;
    log.write_record(200, "IMU", b"i1")?;
    log.write_record(300, "POSE", b"p2")?;
    log.close()?;

    let broker = Broker::open(&file_url(&path, "r"))?;
    assert!(matches!(
        broker.publish("POSE", b""),
        Err(Error::ReadOnlyViolation)
    ));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    broker.subscribe("POSE", move |msg| {
        sink.lock()
            .unwrap()
            .push((msg.recv_timestamp_us, msg.payload.clone()))
    })?;

    // Replay is unpaced by default: everything is available at once.
    assert_eq!(broker.handle_timeout(0)?, 2);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(100, b"p1".to_vec()), (300, b"p2".to_vec())]
    );
    assert!(matches!(broker.handle(), Err(Error::EndOfLog)));
    assert!(matches!(broker.handle_timeout(10), Err(Error::EndOfLog)));
    Ok(())
}

#[test]
fn reader_broker_starts_at_timestamp() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("start.log");
    let mut log = EventLog::open(&path, LogMode::Write)?;
    for ts in [10i64, 20, 30] {
        log.write_record(ts, "T", &ts.to_be_bytes())?;
    }
    log.close()?;

    let broker = Broker::open(&format!(
        "file://{}?mode=r&start_timestamp=20",
        path.display()
    ))?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    broker.subscribe(".*", move |msg| sink.lock().unwrap().push(msg.recv_timestamp_us))?;
    broker.handle()?;
    broker.handle()?;
    assert_eq!(*seen.lock().unwrap(), vec![20, 30]);
    Ok(())
}

#[test]
fn missing_log_fails_to_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.log");
    assert!(matches!(
        Broker::open(&file_url(&path, "r")),
        Err(Error::Io(_))
    ));
}

#[test]
fn readiness_tracks_subscribed_records() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ready.log");
    let mut log = EventLog::open(&path, LogMode::Write)?;
    log.write_record(1, "IMU", b"i")?;
    log.write_record(2, "POSE", b"p")?;
    log.write_record(3, "IMU", b"i")?;
    log.close()?;

    let broker = Broker::open(&file_url(&path, "r"))?;
    assert!(!broker.readiness().wait(Some(Duration::ZERO))?);

    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    broker.subscribe("POSE", move |_| *sink.lock().unwrap() += 1)?;
    assert!(broker.readiness().wait(Some(Duration::ZERO))?);

    assert_eq!(broker.handle_timeout(0)?, 1);
    assert_eq!(*seen.lock().unwrap(), 1);
    // Only unsubscribed records remain.
    assert!(!broker.readiness().wait(Some(Duration::ZERO))?);
    assert!(matches!(broker.handle_timeout(0), Err(Error::EndOfLog)));
    assert!(!broker.readiness().wait(Some(Duration::ZERO))?);
    Ok(())
}

#[test]
fn log_without_subscribed_channels_is_never_ready() -> chanbus::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("noise.log");
    let mut log = EventLog::open(&path, LogMode::Write)?;
    log.write_record(1, "NOISE", b"n")?;
    log.close()?;

    let broker = Broker::open(&file_url(&path, "r"))?;
    broker.subscribe("POSE", |_| {})?;
    assert!(!broker.readiness().wait(Some(Duration::ZERO))?);
    assert!(matches!(broker.handle_timeout(0), Err(Error::EndOfLog)));
    Ok(())
}
