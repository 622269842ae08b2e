//! FAT volume access on top of a [`BlockStream`].

use std::io::{self, Read, Seek, SeekFrom};

use fscommon::{BufStream, StreamSlice};
use sdhost_hw::specs::transfer::BLOCK_LENGTH;
use tracing::{debug, info};

use crate::card::BlockStream;
use crate::error::SdhcError;
use crate::host::SdhcProtocol;

const BLOCK_BYTES: usize = BLOCK_LENGTH as usize;
const PARTITION_TABLE: usize = 0x1be;
const PARTITION_ENTRY: usize = 16;

/// Partition types holding a FAT filesystem
const FAT_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0b, 0x0c, 0x0e];

/// Mounted FAT filesystem of a card, borrowing its block stream
pub type Volume<'a, H> = fatfs::FileSystem<BufStream<StreamSlice<&'a mut BlockStream<H>>>>;

/// MBR partition entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub kind: u8,
    pub start_lba: u64,
    pub blocks: u64,
}

/// Finds the first FAT partition of an MBR sector. `None` when the sector is
/// a FAT boot sector itself or carries no usable partition.
pub fn find_fat_partition(sector: &[u8]) -> Option<Partition> {
    if sector.len() < BLOCK_BYTES || sector[510..512] != [0x55, 0xaa] {
        return None;
    }

    // Unpartitioned media start with a jump over the BPB, which declares
    // 512-byte sectors
    let jump = matches!(sector[0], 0xeb | 0xe9);
    if jump && u16::from_le_bytes([sector[11], sector[12]]) == BLOCK_LENGTH as u16 {
        return None;
    }

    sector[PARTITION_TABLE..PARTITION_TABLE + 4 * PARTITION_ENTRY]
        .chunks_exact(PARTITION_ENTRY)
        .map(|entry| Partition {
            kind: entry[4],
            start_lba: u64::from(u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]])),
            blocks: u64::from(u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]])),
        })
        .find(|partition| FAT_TYPES.contains(&partition.kind) && partition.blocks > 0)
}

/// Mounts the first FAT partition of the card, or the whole card when it is
/// not partitioned. The stream is usable again once the volume is unmounted.
pub fn mount<H: SdhcProtocol>(stream: &mut BlockStream<H>) -> io::Result<Volume<'_, H>> {
    let mut sector = [0u8; BLOCK_BYTES];
    stream.seek(SeekFrom::Start(0))?;
    stream.read_exact(&mut sector)?;

    let (start, end) = match find_fat_partition(&sector) {
        Some(partition) => {
            info!(
                "FAT partition type {:#04X} at block {} ({} blocks)",
                partition.kind, partition.start_lba, partition.blocks
            );
            if partition.start_lba >= stream.len() / BLOCK_BYTES as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "partition starts at block {}, past the end of the card",
                        partition.start_lba
                    ),
                ));
            }
            let start = partition.start_lba * BLOCK_BYTES as u64;
            let end = partition
                .blocks
                .saturating_mul(BLOCK_BYTES as u64)
                .saturating_add(start);
            (start, end.min(stream.len()))
        }
        None => {
            debug!("No partition table, mounting the whole card");
            (0, stream.len())
        }
    };

    let slice = StreamSlice::new(stream, start, end)?;
    fatfs::FileSystem::new(BufStream::new(slice), fatfs::FsOptions::new())
}

/// Entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
}

pub fn list_root<H: SdhcProtocol>(volume: &Volume<'_, H>) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in volume.root_dir().iter() {
        let entry = entry?;
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        entries.push(Entry {
            name,
            is_dir: entry.is_dir(),
            len: entry.len(),
        });
    }
    Ok(entries)
}

/// Reads a whole file, `path` is relative to the root directory
pub fn read_file<H: SdhcProtocol>(volume: &Volume<'_, H>, path: &str) -> io::Result<Vec<u8>> {
    let mut file = volume.root_dir().open_file(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut contents = Vec::new();
    usize::try_from(len)
        .ok()
        .and_then(|len| contents.try_reserve_exact(len).ok())
        .ok_or(SdhcError::OutOfResources("file buffer"))?;
    file.read_to_end(&mut contents)?;
    info!("Read {} bytes from {}", contents.len(), path);
    Ok(contents)
}
