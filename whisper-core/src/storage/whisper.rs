//! File handle tying a [`FileData`] image to a file on disk

use super::{FileData, WhisperConfig};
use crate::archive::ArchiveList;
use crate::codec::Codec;
use crate::format::{AggregationMethod, Header, Meta, ARCHIVE_INFO_SIZE, HEADER_SIZE};
use crate::io::{
    default_pool, preadv_full, pwritev_full, BufferPool, FileWriter, NativeIo, VectoredIo,
};
use crate::transport::{FileDump, TimeSeries};
use crate::{Point, Result, Timestamp, Value, WhisperError};
use fs2::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An open Whisper file.
///
/// The whole file is held in memory. Updates modify the image and mark pages
/// dirty; [`sync`](Self::sync) writes the dirty pages back.
pub struct Whisper<I: VectoredIo = NativeIo> {
    data: FileData,
    file: Option<File>,
    path: Option<PathBuf>,
    locked: bool,
    read_only: bool,
    io: I,
}

impl<I: VectoredIo> fmt::Debug for Whisper<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Whisper")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("locked", &self.locked)
            .field("header", self.data.header())
            .finish()
    }
}

impl Whisper<NativeIo> {
    /// Create a new file with the given layout
    pub fn create(
        path: impl AsRef<Path>,
        archives: ArchiveList,
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
        config: &WhisperConfig,
    ) -> Result<Self> {
        Self::create_with_io(
            path,
            archives,
            aggregation_method,
            x_files_factor,
            config,
            NativeIo::default(),
        )
    }

    /// Create a file from a complete raw image
    pub fn create_with_data(
        path: impl AsRef<Path>,
        data: Vec<u8>,
        config: &WhisperConfig,
    ) -> Result<Self> {
        Self::create_with_data_and_io(path, data, config, NativeIo::default())
    }

    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, config: &WhisperConfig) -> Result<Self> {
        Self::open_with_io(path, config, NativeIo::default())
    }

    /// A handle with no backing file
    pub fn in_memory(
        archives: ArchiveList,
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Self> {
        Self::create(
            "",
            archives,
            aggregation_method,
            x_files_factor,
            &WhisperConfig::in_memory(),
        )
    }
}

impl<I: VectoredIo> Whisper<I> {
    pub fn create_with_io(
        path: impl AsRef<Path>,
        archives: ArchiveList,
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
        config: &WhisperConfig,
        io: I,
    ) -> Result<Self> {
        config.validate()?;
        let data = FileData::create(
            archives,
            aggregation_method,
            x_files_factor,
            config.page_size,
        )?;
        Self::adopt(path.as_ref(), data, config, io)
    }

    pub fn create_with_data_and_io(
        path: impl AsRef<Path>,
        data: Vec<u8>,
        config: &WhisperConfig,
        io: I,
    ) -> Result<Self> {
        config.validate()?;
        let data = FileData::from_bytes(data, config.page_size)?;
        Self::adopt(path.as_ref(), data, config, io)
    }

    /// Write a fresh image to `path`, or keep it in memory
    fn adopt(path: &Path, data: FileData, config: &WhisperConfig, io: I) -> Result<Self> {
        if config.in_memory {
            return Ok(Self {
                data,
                file: None,
                path: None,
                locked: false,
                read_only: false,
                io,
            });
        }
        if config.read_only {
            return Err(WhisperError::Config(
                "cannot create a file in read-only mode".into(),
            ));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if config.exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        let file = options.open(path)?;

        if config.flock {
            file.try_lock_exclusive()?;
        }

        let image = data.as_bytes();
        file.set_len(image.len() as u64)?;
        let slices: Vec<&[u8]> = image.chunks(config.page_size).collect();
        pwritev_full(&io, &file, &slices, 0)?;

        info!(
            "Created whisper file {} ({}, {} bytes)",
            path.display(),
            data.archives(),
            image.len()
        );

        Ok(Self {
            data,
            file: Some(file),
            path: Some(path.to_path_buf()),
            locked: config.flock,
            read_only: false,
            io,
        })
    }

    pub fn open_with_io(path: impl AsRef<Path>, config: &WhisperConfig, io: I) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        if config.in_memory {
            return Err(WhisperError::Config(
                "in-memory handles are created, not opened".into(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path)?;

        let locked = config.flock && !config.read_only;
        if locked {
            file.try_lock_exclusive()?;
        }

        let file_len = usize::try_from(file.metadata()?.len()).map_err(|_| {
            WhisperError::Corruption(format!("{} is too large to load", path.display()))
        })?;
        let pool = config.buffer_pool.clone().unwrap_or_else(default_pool);
        let image = read_image(&io, &file, file_len, &pool, config.page_size)?;
        let data = FileData::from_bytes(image, config.page_size)?;

        info!(
            "Opened whisper file {} ({}{})",
            path.display(),
            data.archives(),
            if config.read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            data,
            file: Some(file),
            path: Some(path.to_path_buf()),
            locked,
            read_only: config.read_only,
            io,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> &Header {
        self.data.header()
    }

    pub fn archives(&self) -> &ArchiveList {
        self.data.archives()
    }

    pub fn aggregation_method(&self) -> AggregationMethod {
        self.data.aggregation_method()
    }

    pub fn x_files_factor(&self) -> f32 {
        self.data.x_files_factor()
    }

    /// The in-memory image
    pub fn file_data(&self) -> &FileData {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.data.is_dirty()
    }

    pub fn fetch_from_archive(
        &self,
        archive_id: i32,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Point>> {
        self.data.fetch_from_archive(archive_id, from, until, now)
    }

    pub fn fetch_time_series(
        &self,
        archive_id: i32,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<TimeSeries> {
        self.data.fetch_time_series(archive_id, from, until, now)
    }

    pub fn get_all_raw_unsorted_points(&self, archive_id: i32) -> Result<Vec<Point>> {
        self.data.get_all_raw_unsorted_points(archive_id)
    }

    pub fn dump(&self, from: Timestamp, until: Timestamp, now: Timestamp) -> Result<FileDump> {
        self.data.dump(from, until, now)
    }

    pub fn update_point_for_archive(
        &mut self,
        archive_id: i32,
        time: Timestamp,
        value: Value,
        now: Timestamp,
    ) -> Result<()> {
        self.data
            .update_point_for_archive(archive_id, time, value, now)
    }

    pub fn update_points_for_archive(
        &mut self,
        archive_id: i32,
        points: &[Point],
        now: Timestamp,
    ) -> Result<()> {
        self.data.update_points_for_archive(archive_id, points, now)
    }

    pub fn set_aggregation_method(&mut self, method: AggregationMethod) -> Result<()> {
        self.data.set_aggregation_method(method)
    }

    pub fn set_x_files_factor(&mut self, x_files_factor: f32) -> Result<()> {
        self.data.set_x_files_factor(x_files_factor)
    }

    /// Write dirty pages back and flush the file to stable storage
    pub fn sync(&mut self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if self.read_only {
            if self.data.is_dirty() {
                return Err(WhisperError::Io(io::Error::new(
                    ErrorKind::PermissionDenied,
                    "file was opened read-only",
                )));
            }
            return Ok(());
        }

        let mut writer = FileWriter::new(file, &self.io);
        let ranges = self.data.flush(&mut writer)?;
        file.sync_all()?;

        debug!("Synced {} dirty ranges", ranges);
        Ok(())
    }

    /// Release the lock and close the file; unsynced changes are discarded
    pub fn close(self) -> Result<()> {
        if let Some(file) = self.file {
            if self.locked {
                fs2::FileExt::unlock(&file)?;
            }
            drop(file);
            if let Some(path) = &self.path {
                info!("Closed whisper file {}", path.display());
            }
        }
        Ok(())
    }
}

/// Load a whole file, staging the first page through `pool`
fn read_image<I: VectoredIo>(
    io: &I,
    file: &File,
    file_len: usize,
    pool: &BufferPool,
    page_size: usize,
) -> Result<Vec<u8>> {
    let mut staging = pool.get();
    let want = staging.len().min(file_len);
    let staged = preadv_full(io, file, &mut [&mut staging[..want]], 0);
    let prefix = staged.map(|n| staging[..n].to_vec());
    pool.put(staging)?;
    let mut prefix = prefix?;

    // staging buffers smaller than the header need further reads
    fill_prefix(io, file, &mut prefix, HEADER_SIZE.min(file_len))?;
    let (_, meta) = Meta::consume(&prefix)?;
    let header_len = HEADER_SIZE + meta.archive_count as usize * ARCHIVE_INFO_SIZE;
    fill_prefix(io, file, &mut prefix, header_len.min(file_len))?;

    let (_, header) = Header::consume(&prefix)?;
    let expected = header.archives.file_size();
    if file_len != expected {
        return Err(WhisperError::Corruption(format!(
            "file is {} bytes but its header describes {}",
            file_len, expected
        )));
    }

    let mut image = vec![0u8; expected];
    let staged_len = prefix.len();
    image[..staged_len].copy_from_slice(&prefix);

    let wanted = expected - staged_len;
    let mut slices: Vec<&mut [u8]> = image[staged_len..].chunks_mut(page_size).collect();
    let n = preadv_full(io, file, &mut slices, staged_len as u64)?;
    if n < wanted {
        return Err(WhisperError::Corruption(format!(
            "file shrank while loading: read {} of {} bytes",
            staged_len + n,
            expected
        )));
    }

    Ok(image)
}

/// Extend `prefix` to `len` bytes read from the start of `file`
fn fill_prefix<I: VectoredIo>(
    io: &I,
    file: &File,
    prefix: &mut Vec<u8>,
    len: usize,
) -> io::Result<()> {
    let start = prefix.len();
    if start >= len {
        return Ok(());
    }
    prefix.resize(len, 0);
    let n = preadv_full(io, file, &mut [&mut prefix[start..]], start as u64)?;
    prefix.truncate(start + n);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PortableIo;
    use crate::ARCHIVE_ID_ALL;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn archives() -> ArchiveList {
        "1m:2h,1h:2d".parse().unwrap()
    }

    #[test]
    fn test_in_memory_handle() {
        let mut w = Whisper::in_memory(archives(), AggregationMethod::Average, 0.0).unwrap();
        assert!(w.path().is_none());

        let now = Timestamp::new(1_000_000);
        w.update_point_for_archive(ARCHIVE_ID_ALL, now, Value(3.0), now)
            .unwrap();
        w.sync().unwrap();
        // nothing to write to, so the pages stay dirty
        assert!(w.is_dirty());
        w.close().unwrap();
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metric.wsp");
        let config = WhisperConfig::default();

        let w = Whisper::create(&path, archives(), AggregationMethod::Sum, 0.25, &config).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            w.file_data().file_size()
        );
        w.close().unwrap();

        let w = Whisper::open(&path, &config).unwrap();
        assert_eq!(w.aggregation_method(), AggregationMethod::Sum);
        assert_eq!(w.x_files_factor(), 0.25);
        assert_eq!(w.archives(), &archives());
        w.close().unwrap();
    }

    #[test]
    fn test_open_with_small_staging_pool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.wsp");
        let pool = Arc::new(BufferPool::new(20));
        let config = WhisperConfig::default()
            .with_page_size(64)
            .with_buffer_pool(pool.clone());

        let mut w = Whisper::create_with_io(
            &path,
            archives(),
            AggregationMethod::Max,
            0.0,
            &config,
            PortableIo,
        )
        .unwrap();
        let now = Timestamp::new(1_000_000);
        w.update_point_for_archive(0, now, Value(8.0), now).unwrap();
        w.sync().unwrap();
        w.close().unwrap();

        let w = Whisper::open_with_io(&path, &config, PortableIo).unwrap();
        let points = w
            .fetch_from_archive(0, now - crate::Duration::MINUTE, now, now)
            .unwrap();
        assert_eq!(points.last().map(|p| p.value), Some(Value(8.0)));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_create_with_data_copies_image() {
        let dir = tempdir().unwrap();
        let source = Whisper::in_memory(archives(), AggregationMethod::Min, 0.5).unwrap();
        let bytes = source.file_data().as_bytes().to_vec();

        let path = dir.path().join("copy.wsp");
        let config = WhisperConfig::default();
        let w = Whisper::create_with_data(&path, bytes.clone(), &config).unwrap();
        w.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        assert!(Whisper::create_with_data(&path, bytes[..20].to_vec(), &config).is_err());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.wsp");
        let err = Whisper::open(path, &WhisperConfig::default()).unwrap_err();
        assert!(matches!(err, WhisperError::Io(ref e) if e.kind() == ErrorKind::NotFound));
    }

    #[test]
    fn test_open_with_staging_smaller_than_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.wsp");
        Whisper::create(
            &path,
            "1m:1h".parse().unwrap(),
            AggregationMethod::Average,
            0.5,
            &WhisperConfig::default(),
        )
        .unwrap()
        .close()
        .unwrap();

        let pool = Arc::new(BufferPool::new(8));
        let config = WhisperConfig::default().with_buffer_pool(pool.clone());
        let w = Whisper::open(&path, &config).unwrap();
        assert_eq!(w.archives().len(), 1);
        assert_eq!(w.aggregation_method(), AggregationMethod::Average);
        w.close().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_debug_shows_path_and_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shown.wsp");
        let config = WhisperConfig::default();
        let w = Whisper::create(&path, archives(), AggregationMethod::Sum, 0.5, &config).unwrap();

        let shown = format!("{w:?}");
        assert!(shown.starts_with("Whisper {"));
        assert!(shown.contains("shown.wsp"));
        assert!(shown.contains("locked: true"));
        assert!(shown.contains("Sum"));
        w.close().unwrap();
    }
}
