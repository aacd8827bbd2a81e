use std::io::{ErrorKind, IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use whisper_core::codec::Codec;
use whisper_core::io::{PortableIo, VectoredIo};
use whisper_core::{
    AggregationMethod, ArchiveList, Duration, FileDump, Point, TimeSeries, Timestamp, Value,
    Whisper, WhisperConfig, WhisperError, ARCHIVE_ID_ALL,
};

/// A day boundary, so every archive step divides it
const NOW: u32 = 1_700_006_400;

fn now() -> Timestamp {
    Timestamp::new(NOW)
}

/// Counts write calls and forwards them to the portable backend
#[derive(Clone, Default)]
struct CountingIo {
    writes: Arc<AtomicUsize>,
}

impl VectoredIo for CountingIo {
    fn pwritev(
        &self,
        file: &std::fs::File,
        bufs: &[IoSlice<'_>],
        offset: u64,
    ) -> std::io::Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        PortableIo.pwritev(file, bufs, offset)
    }

    fn preadv(
        &self,
        file: &std::fs::File,
        bufs: &mut [IoSliceMut<'_>],
        offset: u64,
    ) -> std::io::Result<usize> {
        PortableIo.preadv(file, bufs, offset)
    }
}

#[test]
fn test_write_sync_reopen_fetch_every_archive() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("load.wsp");
    let config = WhisperConfig::default();
    let archives: ArchiveList = "1m:2h,1h:2d,1d:30d".parse()?;

    let mut w = Whisper::create(&path, archives.clone(), AggregationMethod::Average, 0.0, &config)?;
    w.update_point_for_archive(ARCHIVE_ID_ALL, now(), Value(42.0), now())?;
    w.sync()?;
    w.close()?;

    let w = Whisper::open(&path, &config)?;
    for (id, archive) in archives.iter().enumerate() {
        let step = archive.seconds_per_point();
        let points = w.fetch_from_archive(id as i32, now() - step, now(), now())?;
        assert_eq!(points, vec![Point::new(now(), 42.0)], "archive {id}");
    }
    w.close()?;
    Ok(())
}

#[test]
fn test_ring_wraparound_survives_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ring.wsp");
    let config = WhisperConfig::default();

    let mut w = Whisper::create(&path, "1s:5s".parse()?, AggregationMethod::Last, 0.0, &config)?;
    for t in 100..107u32 {
        w.update_point_for_archive(0, Timestamp::new(t), Value(t as f64), Timestamp::new(t))?;
    }
    w.sync()?;
    w.close()?;

    let w = Whisper::open(&path, &config)?;
    let series =
        w.fetch_time_series(0, Timestamp::new(101), Timestamp::new(106), Timestamp::new(106))?;
    let values: Vec<f64> = series.values().map(f64::from).collect();
    assert_eq!(values, vec![102.0, 103.0, 104.0, 105.0, 106.0]);
    assert_eq!(series.step, Duration::SECOND);
    w.close()?;
    Ok(())
}

#[test]
fn test_sync_without_changes_writes_nothing() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("idle.wsp");
    let io = CountingIo::default();
    let config = WhisperConfig::default();

    let mut w = Whisper::create_with_io(
        &path,
        "1m:2h,1h:2d".parse()?,
        AggregationMethod::Sum,
        0.5,
        &config,
        io.clone(),
    )?;
    let after_create = io.writes.load(Ordering::SeqCst);
    assert!(after_create >= 1);

    w.sync()?;
    assert_eq!(io.writes.load(Ordering::SeqCst), after_create);

    w.update_point_for_archive(ARCHIVE_ID_ALL, now(), Value(1.0), now())?;
    w.sync()?;
    let after_update = io.writes.load(Ordering::SeqCst);
    assert!(after_update > after_create);
    assert!(!w.is_dirty());

    w.sync()?;
    assert_eq!(io.writes.load(Ordering::SeqCst), after_update);
    w.close()?;
    Ok(())
}

#[test]
fn test_update_many_matches_single_updates() -> anyhow::Result<()> {
    let archives: ArchiveList = "1m:1h,10m:1d".parse()?;
    let points: Vec<Point> = (0..30u32)
        .map(|i| Point::new(NOW - 3000 + i * 60, i as f64))
        .collect();

    let mut batched = Whisper::in_memory(archives.clone(), AggregationMethod::Average, 0.0)?;
    batched.update_points_for_archive(ARCHIVE_ID_ALL, &points, now())?;

    let mut single = Whisper::in_memory(archives, AggregationMethod::Average, 0.0)?;
    for p in &points {
        single.update_point_for_archive(ARCHIVE_ID_ALL, p.time, p.value, now())?;
    }

    for id in [0, 1] {
        let from = now() - Duration::DAY;
        assert_eq!(
            batched.fetch_from_archive(id, from, now(), now())?,
            single.fetch_from_archive(id, from, now(), now())?,
            "archive {id}"
        );
    }
    Ok(())
}

#[test]
fn test_second_writer_is_locked_out() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.wsp");
    let config = WhisperConfig::default();

    let archives: ArchiveList = "1m:1h".parse().unwrap();
    let first = Whisper::create(&path, archives, AggregationMethod::Max, 0.5, &config).unwrap();
    let err = Whisper::open(&path, &config).unwrap_err();
    assert!(matches!(err, WhisperError::Io(_)));

    // readers do not take the lock
    let reader = Whisper::open(&path, &WhisperConfig::read_only()).unwrap();
    reader.close().unwrap();

    first.close().unwrap();
    Whisper::open(&path, &config).unwrap().close().unwrap();
}

#[test]
fn test_read_only_handle_refuses_to_sync_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.wsp");
    let archives: ArchiveList = "1m:1h".parse().unwrap();
    Whisper::create(&path, archives, AggregationMethod::Average, 0.5, &WhisperConfig::default())
        .unwrap()
        .close()
        .unwrap();

    let mut w = Whisper::open(&path, &WhisperConfig::read_only()).unwrap();
    w.sync().unwrap();
    w.update_point_for_archive(0, now(), Value(1.0), now()).unwrap();
    let err = w.sync().unwrap_err();
    assert!(matches!(err, WhisperError::Io(ref e) if e.kind() == ErrorKind::PermissionDenied));
}

#[test]
fn test_exclusive_create_refuses_existing_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("taken.wsp");
    std::fs::write(&path, b"occupied").unwrap();

    let config = WhisperConfig {
        exclusive: true,
        ..WhisperConfig::default()
    };
    let archives: ArchiveList = "1m:1h".parse().unwrap();
    let err =
        Whisper::create(&path, archives, AggregationMethod::Average, 0.5, &config).unwrap_err();
    assert!(matches!(err, WhisperError::Io(ref e) if e.kind() == ErrorKind::AlreadyExists));
    assert_eq!(std::fs::read(&path).unwrap(), b"occupied");
}

#[test]
fn test_damaged_files_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("damaged.wsp");
    let config = WhisperConfig::read_only();

    let w = Whisper::in_memory("1m:1h,1h:1d".parse().unwrap(), AggregationMethod::Average, 0.5)
        .unwrap();
    let image = w.file_data().as_bytes().to_vec();

    // cut inside the descriptor table
    std::fs::write(&path, &image[..30]).unwrap();
    let err = Whisper::open(&path, &config).unwrap_err();
    assert_eq!(err.needed_bytes(), Some(10));

    // header intact, point data missing
    std::fs::write(&path, &image[..image.len() - 12]).unwrap();
    assert!(Whisper::open(&path, &config).unwrap_err().is_corruption());

    // trailing garbage
    let mut long = image.clone();
    long.extend_from_slice(&[0xFF; 3]);
    std::fs::write(&path, &long).unwrap();
    assert!(Whisper::open(&path, &config).unwrap_err().is_corruption());

    // unknown aggregation code
    let mut bad = image;
    bad[0..4].copy_from_slice(&42u32.to_be_bytes());
    std::fs::write(&path, &bad).unwrap();
    assert!(matches!(
        Whisper::open(&path, &config),
        Err(WhisperError::InvalidAggregationMethod(_))
    ));
}

#[test]
fn test_header_changes_persist() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("retune.wsp");
    let config = WhisperConfig::default();

    let archives: ArchiveList = "1m:1h,1h:1d".parse()?;
    let mut w = Whisper::create(&path, archives, AggregationMethod::Average, 0.5, &config)?;
    w.set_aggregation_method(AggregationMethod::Sum)?;
    w.set_x_files_factor(0.0)?;
    w.sync()?;
    w.close()?;

    let mut w = Whisper::open(&path, &config)?;
    assert_eq!(w.aggregation_method(), AggregationMethod::Sum);
    assert_eq!(w.x_files_factor(), 0.0);

    let base = NOW - 3600;
    w.update_points_for_archive(
        ARCHIVE_ID_ALL,
        &[Point::new(base, 2.0), Point::new(base + 60, 3.0)],
        now(),
    )?;
    let hour = w.fetch_from_archive(1, Timestamp::new(base - 1), Timestamp::new(base), now())?;
    assert_eq!(hour, vec![Point::new(base, 5.0)]);
    w.close()?;
    Ok(())
}

#[test]
fn test_dump_transport() -> anyhow::Result<()> {
    let mut w = Whisper::in_memory("1m:1h,1h:1d".parse()?, AggregationMethod::Max, 0.0)?;
    w.update_point_for_archive(ARCHIVE_ID_ALL, now() - Duration::MINUTE, Value(7.0), now())?;

    let dump = w.dump(now() - Duration::HOUR, now(), now())?;
    assert_eq!(dump.series.len(), 2);
    assert_eq!(dump.series[0].step, Duration::MINUTE);
    assert_eq!(dump.series[0].known().count(), 1);
    assert_eq!(dump.series[1].step, Duration::HOUR);

    let wire = dump.encode();
    let (rest, decoded) = FileDump::consume(&wire)?;
    assert!(rest.is_empty());
    assert_eq!(decoded, dump);

    let json = serde_json::to_string(&dump.series[0])?;
    assert!(json.contains("null"));
    let back: TimeSeries = serde_json::from_str(&json)?;
    assert_eq!(back, dump.series[0]);
    Ok(())
}

#[test]
fn test_all_raw_points_after_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("raw.wsp");
    let config = WhisperConfig::default();

    let archives: ArchiveList = "1m:5m,5m:25m".parse()?;
    let mut w = Whisper::create(&path, archives, AggregationMethod::Sum, 0.0, &config)?;
    w.update_point_for_archive(ARCHIVE_ID_ALL, now(), Value(1.0), now())?;
    w.sync()?;
    w.close()?;

    let w = Whisper::open(&path, &config)?;
    let raw = w.get_all_raw_unsorted_points(ARCHIVE_ID_ALL)?;
    assert_eq!(raw.len(), 10);
    let written: Vec<&Point> = raw.iter().filter(|p| !p.time.is_zero()).collect();
    assert_eq!(written, vec![&Point::new(now(), 1.0), &Point::new(now(), 1.0)]);
    assert!(matches!(
        w.get_all_raw_unsorted_points(5),
        Err(WhisperError::ArchiveIdOutOfRange { id: 5, count: 2 })
    ));
    w.close()?;
    Ok(())
}
