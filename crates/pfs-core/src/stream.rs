//! Streaming adapters: pump whole files into and out of the store.
//!
//! `DataSource` and `DataSink` are capability sets, not class
//! hierarchies: anything that can hand out byte batches can feed
//! [`write_stream`], anything that can swallow them can drain
//! [`read_stream`]. Both sides can keep a running CRC32 so callers can
//! compare end-to-end checksums without buffering the file.

use crate::fs::Filesystem;
use crate::vfile::Vfile;
use pfs_error::{PfsError, Result};
use rand::RngCore;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// CRC-32/IEEE, used for data checksums end to end.
static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Producer side: hands out byte batches until exhausted.
pub trait DataSource {
    /// The next batch, or `None` at end of stream.
    fn provide(&mut self) -> Result<Option<&[u8]>>;

    /// Finish and return the CRC32 of everything provided (0 if checksums
    /// were not requested).
    fn close(&mut self) -> Result<u32>;
}

/// Consumer side: receives the file's metadata, then its bytes.
pub trait DataSink {
    fn on_meta(&mut self, name: &str, key: &str, ext: &[u8]) -> Result<()>;
    fn consume(&mut self, data: &[u8]) -> Result<()>;

    /// Finish and return the CRC32 of everything consumed (0 if checksums
    /// were not requested).
    fn close(&mut self) -> Result<u32>;
}

type RollingCrc = Option<crc::Digest<'static, u32>>;

fn finish(crc: &mut RollingCrc) -> u32 {
    crc.take().map_or(0, |d| d.finalize())
}

// ── Sources ─────────────────────────────────────────────────────────────────

/// Produces `total_size` random bytes in fixed-size batches.
pub struct RandomDataSource {
    data: Vec<u8>,
    total_size: u64,
    offset: u64,
    regen_each_batch: bool,
    crc: RollingCrc,
}

impl RandomDataSource {
    #[must_use]
    pub fn new(batch_size: usize, total_size: u64, regen_each_batch: bool, with_crc: bool) -> Self {
        let mut data = vec![0u8; batch_size];
        rand::thread_rng().fill_bytes(&mut data);
        Self {
            data,
            total_size,
            offset: 0,
            regen_each_batch,
            crc: with_crc.then(|| CRC32.digest()),
        }
    }
}

impl DataSource for RandomDataSource {
    fn provide(&mut self) -> Result<Option<&[u8]>> {
        if self.offset >= self.total_size {
            return Ok(None);
        }
        if self.regen_each_batch && self.offset != 0 {
            rand::thread_rng().fill_bytes(&mut self.data);
        }
        let n = (self.data.len() as u64).min(self.total_size - self.offset) as usize;
        self.offset += n as u64;
        if let Some(crc) = &mut self.crc {
            crc.update(&self.data[..n]);
        }
        Ok(Some(&self.data[..n]))
    }

    fn close(&mut self) -> Result<u32> {
        Ok(finish(&mut self.crc))
    }
}

/// Streams an existing host file in batches.
pub struct FileDataSource {
    file: File,
    data: Vec<u8>,
    crc: RollingCrc,
}

impl FileDataSource {
    pub fn open(path: impl AsRef<Path>, batch_size: usize, with_crc: bool) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            data: vec![0u8; batch_size],
            crc: with_crc.then(|| CRC32.digest()),
        })
    }
}

impl DataSource for FileDataSource {
    fn provide(&mut self) -> Result<Option<&[u8]>> {
        let n = self.file.read(&mut self.data)?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(crc) = &mut self.crc {
            crc.update(&self.data[..n]);
        }
        Ok(Some(&self.data[..n]))
    }

    fn close(&mut self) -> Result<u32> {
        Ok(finish(&mut self.crc))
    }
}

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Discards the bytes, keeping only the checksum and metadata.
#[derive(Default)]
pub struct NullDataSink {
    pub name: String,
    pub meta: Vec<u8>,
    crc: RollingCrc,
}

impl NullDataSink {
    #[must_use]
    pub fn new(with_crc: bool) -> Self {
        Self {
            name: String::new(),
            meta: Vec::new(),
            crc: with_crc.then(|| CRC32.digest()),
        }
    }
}

impl DataSink for NullDataSink {
    fn on_meta(&mut self, name: &str, _key: &str, ext: &[u8]) -> Result<()> {
        self.name = name.to_owned();
        self.meta = ext.to_vec();
        Ok(())
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        if let Some(crc) = &mut self.crc {
            crc.update(data);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<u32> {
        Ok(finish(&mut self.crc))
    }
}

/// Writes the stream into a host file under `dir`, named by the file's
/// stored name (or its key when the name is empty).
pub struct FileDataSink {
    dir: PathBuf,
    name_override: Option<String>,
    file: Option<File>,
    crc: RollingCrc,
}

impl FileDataSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, name_override: Option<String>, with_crc: bool) -> Self {
        Self {
            dir: dir.into(),
            name_override,
            file: None,
            crc: with_crc.then(|| CRC32.digest()),
        }
    }
}

impl DataSink for FileDataSink {
    fn on_meta(&mut self, name: &str, key: &str, _ext: &[u8]) -> Result<()> {
        let leaf = self
            .name_override
            .clone()
            .unwrap_or_else(|| if name.is_empty() { key.to_owned() } else { name.to_owned() });
        let path = self.dir.join(leaf);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.file = Some(File::create(path)?);
        Ok(())
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        if let Some(crc) = &mut self.crc {
            crc.update(data);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| PfsError::Corrupt("sink consumed before on_meta".to_owned()))?;
        file.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<u32> {
        self.file = None;
        Ok(finish(&mut self.crc))
    }
}

// ── Drivers ─────────────────────────────────────────────────────────────────

/// Pump an entire source into a new file. Returns the UID, the byte
/// count, the source's checksum, and the still-open handle.
pub fn write_stream(
    fs: &mut Filesystem,
    source: &mut dyn DataSource,
    name: &str,
    ext_meta: &[u8],
) -> Result<(String, u64, u32, Vfile)> {
    let (mut vfile, key) = fs.create_file(name, ext_meta)?;
    let mut written = 0u64;
    loop {
        let Some(batch) = source.provide()? else {
            break;
        };
        let wtn = vfile.write(fs, batch)?;
        if wtn != batch.len() {
            return Err(PfsError::Corrupt(format!(
                "short write: {wtn} of {} bytes",
                batch.len()
            )));
        }
        written += wtn as u64;
    }
    let crc = source.close()?;
    debug!(name, key = %key, written, "stream written");
    Ok((key, written, crc, vfile))
}

/// Drain an entire file into a sink in `batch_limit`-byte reads.
/// Returns the byte count, the sink's checksum, and the handle.
pub fn read_stream(
    fs: &mut Filesystem,
    uid: &str,
    sink: &mut dyn DataSink,
    batch_limit: usize,
) -> Result<(u64, u32, Vfile)> {
    let mut vfile = fs.open_file(uid)?;
    sink.on_meta(&vfile.meta.name, uid, &vfile.meta.ext)?;
    let mut buf = vec![0u8; batch_limit];
    let mut total = 0u64;
    while total < vfile.inode.file_size {
        let want = batch_limit.min((vfile.inode.file_size - total) as usize);
        let read = vfile.read(fs, &mut buf[..want])?;
        if read == 0 {
            return Err(PfsError::Corrupt(
                "read stalled before end of file".to_owned(),
            ));
        }
        sink.consume(&buf[..read])?;
        total += read as u64;
    }
    let crc = sink.close()?;
    debug!(uid, total, "stream read");
    Ok((total, crc, vfile))
}
