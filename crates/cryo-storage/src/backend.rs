use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{Result, StorageError, PAGE_SIZE, SECTOR_SIZE};

/// Random-access byte storage, the substrate every block device sits on.
pub trait StorageBackend {
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fixed-size in-memory backend. Reads and writes past the end are
/// rejected, mirroring a real partition.
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new(len: u64) -> Self {
        Self {
            data: vec![0u8; len as usize],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let offset: usize = offset
            .try_into()
            .map_err(|_| StorageError::OffsetOverflow)?;
        let end = offset.checked_add(len).ok_or(StorageError::OffsetOverflow)?;
        if end > self.data.len() {
            return Err(StorageError::OutOfBounds {
                offset: offset as u64,
                len,
                device_len: self.data.len() as u64,
            });
        }
        Ok(offset)
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset = self.check(offset, buf.len())?;
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// File-backed storage for hibernation-to-regular-file setups. Writes past
/// the current end extend the file; the gap reads back as zeros.
pub struct FileBackend {
    file: File,
    writable: bool,
}

impl FileBackend {
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            writable: false,
        })
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let device_len = self.len()?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(StorageError::OffsetOverflow)?;
        if end > device_len {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
                device_len,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(StorageError::Unsupported("backend is read-only"));
        }
        offset
            .checked_add(buf.len() as u64)
            .ok_or(StorageError::OffsetOverflow)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Transfer direction for [`page_io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// The host block-I/O primitive: move one page to or from a sector address.
pub fn page_io(
    dir: IoDir,
    dev: &mut dyn StorageBackend,
    sector: u64,
    buf: &mut [u8; PAGE_SIZE],
) -> Result<()> {
    let offset = sector
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(StorageError::OffsetOverflow)?;
    match dir {
        IoDir::Read => dev.read_at(offset, buf),
        IoDir::Write => dev.write_at(offset, buf),
    }
}
