//! Timestamp authorities.
//!
//! Every ordering decision in the branching model is made by comparing
//! timestamps issued by a single [`TimestampAuthority`]. Two implementations
//! are provided: an in-memory atomic counter and a file-backed authority that
//! survives restarts without ever re-issuing a value.

use crate::error::{BranchError, Result};
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Magic bytes for the authority file.
const AUTHORITY_MAGIC: &[u8; 4] = b"TSA\0";

/// Current authority file format version.
const AUTHORITY_VERSION: u8 = 1;

/// Default number of timestamps reserved per disk write.
pub const DEFAULT_RESERVE_BLOCK: i64 = 1000;

/// Source of strictly increasing timestamps.
pub trait TimestampAuthority: Send + Sync {
    /// Returns a value greater than any value previously returned to any caller.
    fn get_timestamp(&self) -> Result<Timestamp>;
}

/// Lock-free counter, suitable for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct AtomicTimestampAuthority {
    next: AtomicI64,
}

impl AtomicTimestampAuthority {
    /// Authority whose first timestamp is `0`.
    pub fn new() -> Self {
        Self::starting_at(Timestamp::ZERO)
    }

    /// Authority whose first timestamp is `first`.
    pub fn starting_at(first: Timestamp) -> Self {
        Self {
            next: AtomicI64::new(first.0),
        }
    }
}

impl TimestampAuthority for AtomicTimestampAuthority {
    fn get_timestamp(&self) -> Result<Timestamp> {
        Ok(Timestamp(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}

struct Reservation {
    /// Next value to hand out.
    next: i64,
    /// Highest value covered by the persisted high-water mark.
    reserved_until: i64,
}

/// File-backed authority.
///
/// Timestamps are reserved in blocks: before a value past the persisted
/// high-water mark is issued, the end of the next block is written and
/// synced. After a restart the authority resumes above the persisted mark,
/// and above the wall clock, so issued values stay close to real time.
pub struct DurableTimestampAuthority {
    path: PathBuf,
    block: i64,
    state: Mutex<Reservation>,
}

impl DurableTimestampAuthority {
    /// Open the authority at `path`, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_block(path, DEFAULT_RESERVE_BLOCK)
    }

    pub fn open_with_block(path: impl AsRef<Path>, block: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let block = block.max(1);

        let high_water = if path.exists() {
            Self::read_high_water(&path)?
        } else {
            -1
        };

        let next = (high_water + 1).max(Timestamp::now().0);
        debug!(path = %path.display(), next, "opened timestamp authority");

        Ok(Self {
            path,
            block,
            state: Mutex::new(Reservation {
                next,
                reserved_until: high_water,
            }),
        })
    }

    /// Highest value that may have been issued before a crash.
    pub fn high_water(&self) -> Timestamp {
        Timestamp(self.state.lock().reserved_until)
    }

    fn read_high_water(path: &Path) -> Result<i64> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != AUTHORITY_MAGIC {
            return Err(BranchError::InvalidFormat(
                "Invalid timestamp authority magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != AUTHORITY_VERSION {
            return Err(BranchError::InvalidFormat(format!(
                "Unsupported timestamp authority version: {}",
                version[0]
            )));
        }

        let mut value = [0u8; 8];
        file.read_exact(&mut value)?;

        let mut checksum = [0u8; 4];
        file.read_exact(&mut checksum)?;
        let expected = u32::from_le_bytes(checksum);
        let got = crc32fast::hash(&value);
        if expected != got {
            return Err(BranchError::ChecksumMismatch { expected, got });
        }

        Ok(i64::from_le_bytes(value))
    }

    fn write_high_water(&self, value: i64) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        let bytes = value.to_le_bytes();
        file.write_all(AUTHORITY_MAGIC)?;
        file.write_all(&[AUTHORITY_VERSION])?;
        file.write_all(&bytes)?;
        file.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl TimestampAuthority for DurableTimestampAuthority {
    fn get_timestamp(&self) -> Result<Timestamp> {
        let mut state = self.state.lock();

        if state.next > state.reserved_until {
            let reserved_until = state.next + self.block - 1;
            self.write_high_water(reserved_until)?;
            state.reserved_until = reserved_until;
        }

        let issued = state.next;
        state.next += 1;
        Ok(Timestamp(issued))
    }
}
