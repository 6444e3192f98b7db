//! FAT32 filesystem backend
//!
//! Reads the BPB to derive geometry, walks cluster chains through the
//! FAT, and translates 8.3 directory entries into VFS nodes. All
//! mutating operations keep the primary FAT coherent and mirror updates
//! to the second FAT when the volume carries one.
//!
//! Every file owns at least one cluster, so a node's identity (its first
//! cluster) is stable across truncation; `rename` moves directory
//! entries without touching the chain, preserving identity as well.

use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use super::{blockdev::BlockDevice, DirEntry, NodeKind, VfsNode};
use crate::error::FsError;

bitflags! {
    /// FAT directory entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// Long-filename entries carry all four low attribute bits.
const ATTR_LFN: u8 = 0x0F;

/// Size of an on-disk directory entry.
const DIR_ENTRY_SIZE: usize = 32;

/// Marker byte for deleted entries.
const ENTRY_DELETED: u8 = 0xE5;

/// End-of-chain marker written into the FAT.
const FAT_EOC: u32 = 0x0FFF_FFFF;

/// Number of node-cache slots.
const NODE_CACHE_SIZE: usize = 32;

fn is_end_of_chain(cluster: u32) -> bool {
    cluster >= 0x0FFF_FFF8
}

// ---------------------------------------------------------------------------
// Raw directory entries
// ---------------------------------------------------------------------------

/// Where a directory entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryLoc {
    /// Cluster containing the entry.
    cluster: u32,
    /// Byte offset of the entry within that cluster.
    offset: u32,
}

/// Decoded 32-byte directory entry (the fields the kernel uses).
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    name: [u8; 11],
    attr: u8,
    first_cluster: u32,
    size: u32,
}

impl RawEntry {
    fn parse(bytes: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&bytes[0..11]);
        let high = u16::from_le_bytes([bytes[20], bytes[21]]) as u32;
        let low = u16::from_le_bytes([bytes[26], bytes[27]]) as u32;
        Self {
            name,
            attr: bytes[11],
            first_cluster: (high << 16) | low,
            size: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
        }
    }

    fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut bytes = [0u8; DIR_ENTRY_SIZE];
        bytes[0..11].copy_from_slice(&self.name);
        bytes[11] = self.attr;
        bytes[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        bytes[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        bytes[28..32].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    fn is_directory(&self) -> bool {
        self.attr & FatAttributes::DIRECTORY.bits() != 0
    }

    /// Entries `readdir` must not surface: deleted, LFN parts, volume
    /// labels, hidden files, and the `.`/`..` links.
    fn is_visible(&self) -> bool {
        if self.name[0] == ENTRY_DELETED || self.name[0] == b'.' {
            return false;
        }
        if self.attr & ATTR_LFN == ATTR_LFN {
            return false;
        }
        let attrs = FatAttributes::from_bits_truncate(self.attr);
        !attrs.intersects(FatAttributes::VOLUME_ID | FatAttributes::HIDDEN)
    }
}

// ---------------------------------------------------------------------------
// 8.3 names
// ---------------------------------------------------------------------------

/// Convert a path component to the padded, upper-case 8.3 form used for
/// on-disk comparison.
fn name_to_83(name: &str) -> Result<[u8; 11], FsError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(FsError::InvalidPath);
    }
    let mut out = [b' '; 11];
    let bytes = name.as_bytes();
    let mut i = 0;
    let mut j = 0;
    while i < bytes.len() && bytes[i] != b'.' && j < 8 {
        out[j] = bytes[i].to_ascii_uppercase();
        i += 1;
        j += 1;
    }
    // Skip to the extension
    while i < bytes.len() && bytes[i] != b'.' {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
    }
    j = 8;
    while i < bytes.len() && j < 11 {
        out[j] = bytes[i].to_ascii_uppercase();
        i += 1;
        j += 1;
    }
    Ok(out)
}

/// Convert a padded 8.3 name to its lower-case dotted form.
fn name_from_83(raw: &[u8; 11]) -> String {
    let mut out = String::with_capacity(12);
    for &b in raw[0..8].iter() {
        if b == b' ' {
            break;
        }
        out.push(b.to_ascii_lowercase() as char);
    }
    if raw[8] != b' ' {
        out.push('.');
        for &b in raw[8..11].iter() {
            if b == b' ' {
                break;
            }
            out.push(b.to_ascii_lowercase() as char);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Node cache
// ---------------------------------------------------------------------------

/// Fixed cache of live nodes, keyed by inode (first cluster). Two nodes
/// for the same inode must never coexist; lookups unify on the cached
/// instance. Slots whose node is referenced only by the cache itself may
/// be evicted when the cache fills up.
struct NodeCache {
    slots: [Option<Arc<Fat32Node>>; NODE_CACHE_SIZE],
    /// The root's inode; the root is pinned and never evicted.
    root_inode: u32,
}

impl NodeCache {
    fn new(root_inode: u32) -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            root_inode,
        }
    }

    fn get(&self, inode: u32) -> Option<Arc<Fat32Node>> {
        self.slots
            .iter()
            .flatten()
            .find(|n| n.inode == inode)
            .cloned()
    }

    fn insert(&mut self, node: Arc<Fat32Node>) -> Result<(), FsError> {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(node);
            return Ok(());
        }
        // Evict a node nobody else holds
        let root_inode = self.root_inode;
        if let Some(slot) = self.slots.iter_mut().find(|s| {
            s.as_ref()
                .is_some_and(|n| Arc::strong_count(n) == 1 && n.inode != root_inode)
        }) {
            *slot = Some(node);
            return Ok(());
        }
        Err(FsError::NodeCacheFull)
    }

    fn remove(&mut self, inode: u32) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|n| n.inode == inode) {
                *slot = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Geometry derived from the BPB at mount time.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    num_fats: u32,
    fat_size: u32,
    fat_start_lba: u32,
    cluster_start_lba: u32,
    root_cluster: u32,
    total_clusters: u32,
}

/// A mounted FAT32 volume.
pub struct Fat32Volume {
    dev: Mutex<Box<dyn BlockDevice>>,
    geom: Geometry,
    cache: Mutex<NodeCache>,
}

impl Fat32Volume {
    /// Read the BPB from `partition_lba` and mount the volume. Volumes
    /// whose `fat_size_16 != 0` or `fat_size_32 == 0` are rejected as
    /// non-FAT32.
    pub fn mount(
        mut dev: Box<dyn BlockDevice>,
        partition_lba: u32,
    ) -> Result<Arc<Fat32Volume>, FsError> {
        let block_size = dev.block_size();
        let mut sector = vec![0u8; block_size];
        dev.read_blocks(partition_lba as u64, &mut sector)?;

        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]) as u32;
        let sectors_per_cluster = sector[13] as u32;
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]) as u32;
        let num_fats = sector[16] as u32;
        let total_sectors_16 = u16::from_le_bytes([sector[19], sector[20]]) as u32;
        let fat_size_16 = u16::from_le_bytes([sector[22], sector[23]]) as u32;
        let total_sectors_32 = u32::from_le_bytes([sector[32], sector[33], sector[34], sector[35]]);
        let fat_size_32 = u32::from_le_bytes([sector[36], sector[37], sector[38], sector[39]]);
        let root_cluster = u32::from_le_bytes([sector[44], sector[45], sector[46], sector[47]]);

        if fat_size_16 != 0 || fat_size_32 == 0 {
            return Err(FsError::NotFat32);
        }
        if bytes_per_sector as usize != block_size || sectors_per_cluster == 0 {
            return Err(FsError::NotFat32);
        }

        let total_sectors = if total_sectors_32 != 0 {
            total_sectors_32
        } else {
            total_sectors_16
        };
        let fat_start_lba = partition_lba + reserved_sectors;
        let cluster_start_lba = fat_start_lba + num_fats * fat_size_32;
        let data_sectors = total_sectors.saturating_sub(reserved_sectors + num_fats * fat_size_32);

        let geom = Geometry {
            bytes_per_sector,
            sectors_per_cluster,
            bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
            num_fats,
            fat_size: fat_size_32,
            fat_start_lba,
            cluster_start_lba,
            root_cluster,
            total_clusters: data_sectors / sectors_per_cluster,
        };

        let volume = Arc::new(Fat32Volume {
            dev: Mutex::new(dev),
            geom,
            cache: Mutex::new(NodeCache::new(geom.root_cluster)),
        });

        let root = Arc::new(Fat32Node {
            volume: volume.clone(),
            name: RwLock::new(String::from("/")),
            kind: NodeKind::Directory,
            inode: geom.root_cluster,
            size: RwLock::new(0),
            dir_loc: RwLock::new(None),
        });
        volume.cache.lock().insert(root)?;

        Ok(volume)
    }

    /// The root directory node.
    pub fn root_node(&self) -> Result<Arc<dyn VfsNode>, FsError> {
        self.cache
            .lock()
            .get(self.geom.root_cluster)
            .map(|n| n as Arc<dyn VfsNode>)
            .ok_or(FsError::NoRootFs)
    }

    // -- sector and cluster I/O --------------------------------------------

    fn cluster_to_lba(&self, cluster: u32) -> u32 {
        self.geom.cluster_start_lba + (cluster - 2) * self.geom.sectors_per_cluster
    }

    fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.dev.lock().read_blocks(lba as u64, buf)
    }

    fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<(), FsError> {
        self.dev.lock().write_blocks(lba as u64, buf)
    }

    fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>, FsError> {
        let mut buf = vec![0u8; self.geom.bytes_per_cluster as usize];
        self.dev
            .lock()
            .read_blocks(self.cluster_to_lba(cluster) as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        self.dev
            .lock()
            .write_blocks(self.cluster_to_lba(cluster) as u64, buf)
    }

    // -- FAT access --------------------------------------------------------

    fn fat_entry(&self, cluster: u32) -> Result<u32, FsError> {
        let offset = cluster * 4;
        let sector = self.geom.fat_start_lba + offset / self.geom.bytes_per_sector;
        let within = (offset % self.geom.bytes_per_sector) as usize;
        let mut buf = vec![0u8; self.geom.bytes_per_sector as usize];
        self.read_sector(sector, &mut buf)?;
        let raw = u32::from_le_bytes([buf[within], buf[within + 1], buf[within + 2], buf[within + 3]]);
        Ok(raw & 0x0FFF_FFFF)
    }

    /// Read-modify-write a FAT entry, preserving the reserved high bits,
    /// and mirror the sector into every additional FAT copy.
    fn set_fat_entry(&self, cluster: u32, value: u32) -> Result<(), FsError> {
        let offset = cluster * 4;
        let sector_index = offset / self.geom.bytes_per_sector;
        let within = (offset % self.geom.bytes_per_sector) as usize;
        let mut buf = vec![0u8; self.geom.bytes_per_sector as usize];
        let primary = self.geom.fat_start_lba + sector_index;
        self.read_sector(primary, &mut buf)?;
        let old = u32::from_le_bytes([buf[within], buf[within + 1], buf[within + 2], buf[within + 3]]);
        let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
        buf[within..within + 4].copy_from_slice(&new.to_le_bytes());
        self.write_sector(primary, &buf)?;
        for copy in 1..self.geom.num_fats {
            let mirror = self.geom.fat_start_lba + copy * self.geom.fat_size + sector_index;
            self.write_sector(mirror, &buf)?;
        }
        Ok(())
    }

    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>, FsError> {
        let next = self.fat_entry(cluster)?;
        Ok((!is_end_of_chain(next) && next != 0).then_some(next))
    }

    /// Allocate a zeroed cluster and mark it end-of-chain.
    fn alloc_cluster(&self) -> Result<u32, FsError> {
        for cluster in 2..(2 + self.geom.total_clusters) {
            if self.fat_entry(cluster)? == 0 {
                self.set_fat_entry(cluster, FAT_EOC)?;
                let zeros = vec![0u8; self.geom.bytes_per_cluster as usize];
                self.write_cluster(cluster, &zeros)?;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Free the whole chain starting at `cluster`.
    fn free_chain(&self, mut cluster: u32) -> Result<(), FsError> {
        while cluster >= 2 && !is_end_of_chain(cluster) {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            if next == 0 {
                break;
            }
            cluster = next;
        }
        Ok(())
    }

    /// Follow the chain one step, appending a fresh cluster at the end.
    fn next_or_extend(&self, cluster: u32) -> Result<u32, FsError> {
        if let Some(next) = self.next_cluster(cluster)? {
            return Ok(next);
        }
        let new = self.alloc_cluster()?;
        self.set_fat_entry(cluster, new)?;
        Ok(new)
    }

    #[cfg(test)]
    fn chain_len(&self, mut cluster: u32) -> Result<u32, FsError> {
        let mut len = 0;
        while cluster >= 2 && !is_end_of_chain(cluster) {
            len += 1;
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(len)
    }

    // -- directory scanning ------------------------------------------------

    /// Visit every 32-byte slot of a directory chain until the callback
    /// yields a value.
    fn scan_dir<T>(
        &self,
        dir: u32,
        mut f: impl FnMut(EntryLoc, &[u8; DIR_ENTRY_SIZE]) -> Result<Option<T>, FsError>,
    ) -> Result<Option<T>, FsError> {
        let mut cluster = dir;
        loop {
            let buf = self.read_cluster(cluster)?;
            for i in 0..(self.geom.bytes_per_cluster as usize / DIR_ENTRY_SIZE) {
                let off = i * DIR_ENTRY_SIZE;
                let mut raw = [0u8; DIR_ENTRY_SIZE];
                raw.copy_from_slice(&buf[off..off + DIR_ENTRY_SIZE]);
                let loc = EntryLoc {
                    cluster,
                    offset: off as u32,
                };
                if let Some(value) = f(loc, &raw)? {
                    return Ok(Some(value));
                }
            }
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
    }

    fn find_entry(&self, dir: u32, name83: &[u8; 11]) -> Result<Option<(EntryLoc, RawEntry)>, FsError> {
        self.scan_dir(dir, |loc, raw| {
            if raw[0] == 0x00 {
                return Ok(Some(None)); // end of directory
            }
            let entry = RawEntry::parse(raw);
            if raw[0] != ENTRY_DELETED && entry.attr & ATTR_LFN != ATTR_LFN && entry.name == *name83
            {
                return Ok(Some(Some((loc, entry))));
            }
            Ok(None)
        })
        .map(Option::flatten)
    }

    /// The i-th visible entry, in on-disk order.
    fn visible_entry_at(&self, dir: u32, index: usize) -> Result<Option<RawEntry>, FsError> {
        let mut seen = 0usize;
        self.scan_dir(dir, |_loc, raw| {
            if raw[0] == 0x00 {
                return Ok(Some(None));
            }
            let entry = RawEntry::parse(raw);
            if entry.is_visible() {
                if seen == index {
                    return Ok(Some(Some(entry)));
                }
                seen += 1;
            }
            Ok(None)
        })
        .map(Option::flatten)
    }

    /// First reusable slot (deleted or terminator), extending the
    /// directory with a fresh cluster when it is full.
    fn find_free_slot(&self, dir: u32) -> Result<EntryLoc, FsError> {
        if let Some(loc) = self.scan_dir(dir, |loc, raw| {
            Ok((raw[0] == 0x00 || raw[0] == ENTRY_DELETED).then_some(loc))
        })? {
            return Ok(loc);
        }
        let mut last = dir;
        while let Some(next) = self.next_cluster(last)? {
            last = next;
        }
        let new = self.alloc_cluster()?;
        self.set_fat_entry(last, new)?;
        Ok(EntryLoc {
            cluster: new,
            offset: 0,
        })
    }

    fn write_entry_at(&self, loc: EntryLoc, bytes: &[u8; DIR_ENTRY_SIZE]) -> Result<(), FsError> {
        let mut buf = self.read_cluster(loc.cluster)?;
        let off = loc.offset as usize;
        buf[off..off + DIR_ENTRY_SIZE].copy_from_slice(bytes);
        self.write_cluster(loc.cluster, &buf)
    }

    /// Overwrite only the size field of a directory entry.
    fn patch_entry_size(&self, loc: EntryLoc, size: u32) -> Result<(), FsError> {
        let mut buf = self.read_cluster(loc.cluster)?;
        let off = loc.offset as usize;
        buf[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
        self.write_cluster(loc.cluster, &buf)
    }

    fn is_dir_empty(&self, dir: u32) -> Result<bool, FsError> {
        let occupied = self.scan_dir(dir, |_loc, raw| {
            if raw[0] == 0x00 {
                return Ok(Some(false)); // reached the end: nothing found
            }
            if raw[0] == ENTRY_DELETED || raw[0] == b'.' {
                return Ok(None);
            }
            let entry = RawEntry::parse(raw);
            if entry.attr & ATTR_LFN == ATTR_LFN
                || entry.attr & FatAttributes::VOLUME_ID.bits() != 0
            {
                return Ok(None);
            }
            Ok(Some(true))
        })?;
        Ok(!occupied.unwrap_or(false))
    }

    // -- node construction -------------------------------------------------

    /// Build (or fetch from the cache) the node for a directory entry.
    fn node_from_entry(
        self: &Arc<Self>,
        entry: &RawEntry,
        loc: EntryLoc,
    ) -> Result<Arc<dyn VfsNode>, FsError> {
        let mut entry = *entry;
        // Foreign images may carry zero-cluster empty files; give them a
        // chain so the inode is meaningful and unique.
        if entry.first_cluster == 0 {
            let cluster = self.alloc_cluster()?;
            entry.first_cluster = cluster;
            let mut bytes = entry.encode();
            let mut buf = self.read_cluster(loc.cluster)?;
            let off = loc.offset as usize;
            // Preserve the timestamp bytes we do not model
            bytes[12..20].copy_from_slice(&buf[off + 12..off + 20]);
            buf[off..off + DIR_ENTRY_SIZE].copy_from_slice(&bytes);
            self.write_cluster(loc.cluster, &buf)?;
        }

        let mut cache = self.cache.lock();
        if let Some(node) = cache.get(entry.first_cluster) {
            return Ok(node);
        }
        let node = Arc::new(Fat32Node {
            volume: self.clone(),
            name: RwLock::new(name_from_83(&entry.name)),
            kind: if entry.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            inode: entry.first_cluster,
            size: RwLock::new(entry.size),
            dir_loc: RwLock::new(Some(loc)),
        });
        cache.insert(node.clone())?;
        Ok(node)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A file or directory on a FAT32 volume.
pub struct Fat32Node {
    volume: Arc<Fat32Volume>,
    name: RwLock<String>,
    kind: NodeKind,
    /// First cluster; stable for the node's lifetime.
    inode: u32,
    size: RwLock<u32>,
    /// Location of our directory entry (`None` for the root).
    dir_loc: RwLock<Option<EntryLoc>>,
}

impl Fat32Node {
    fn require_dir(&self) -> Result<(), FsError> {
        if self.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    fn require_file(&self) -> Result<(), FsError> {
        if self.kind != NodeKind::File {
            return Err(FsError::NotAFile);
        }
        Ok(())
    }

    fn set_size(&self, size: u32) -> Result<(), FsError> {
        *self.size.write() = size;
        if let Some(loc) = *self.dir_loc.read() {
            self.volume.patch_entry_size(loc, size)?;
        }
        Ok(())
    }

    /// Write bytes at `offset` into the chain, extending it as needed.
    /// Does not update the recorded file size.
    fn raw_write(&self, offset: u32, data: &[u8]) -> Result<(), FsError> {
        let fs = &self.volume;
        let bpc = fs.geom.bytes_per_cluster;
        let mut cluster = self.inode;
        let mut file_pos = 0u32;
        while file_pos + bpc <= offset {
            cluster = fs.next_or_extend(cluster)?;
            file_pos += bpc;
        }
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u32;
            let cluster_off = (pos - file_pos) as usize;
            let n = core::cmp::min(bpc as usize - cluster_off, data.len() - written);
            if n == bpc as usize {
                fs.write_cluster(cluster, &data[written..written + n])?;
            } else {
                let mut buf = fs.read_cluster(cluster)?;
                buf[cluster_off..cluster_off + n].copy_from_slice(&data[written..written + n]);
                fs.write_cluster(cluster, &buf)?;
            }
            written += n;
            if written < data.len() {
                cluster = fs.next_or_extend(cluster)?;
                file_pos += bpc;
            }
        }
        Ok(())
    }

    /// Zero-fill `[start, end)` (used when a truncate grows the file).
    fn zero_range(&self, start: u32, end: u32) -> Result<(), FsError> {
        if end <= start {
            return Ok(());
        }
        let zeros = vec![0u8; self.volume.geom.bytes_per_cluster as usize];
        let mut pos = start;
        while pos < end {
            let n = core::cmp::min(zeros.len() as u32, end - pos);
            self.raw_write(pos, &zeros[..n as usize])?;
            pos += n;
        }
        Ok(())
    }
}

impl VfsNode for Fat32Node {
    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn inode(&self) -> u32 {
        self.inode
    }

    fn size(&self) -> u32 {
        *self.size.read()
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.require_file()?;
        let fs = &self.volume;
        let size = *self.size.read();
        if offset >= size {
            return Ok(0);
        }
        let want = core::cmp::min(buf.len(), (size - offset) as usize);
        let bpc = fs.geom.bytes_per_cluster;

        // Skip whole clusters until the one containing `offset`
        let mut cluster = self.inode;
        let mut file_pos = 0u32;
        while file_pos + bpc <= offset {
            match fs.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(0),
            }
            file_pos += bpc;
        }

        let mut copied = 0usize;
        while copied < want {
            let data = fs.read_cluster(cluster)?;
            let pos = offset + copied as u32;
            let cluster_off = (pos - file_pos) as usize;
            let n = core::cmp::min(bpc as usize - cluster_off, want - copied);
            buf[copied..copied + n].copy_from_slice(&data[cluster_off..cluster_off + n]);
            copied += n;
            if copied < want {
                match fs.next_cluster(cluster)? {
                    Some(next) => cluster = next,
                    None => break,
                }
                file_pos += bpc;
            }
        }
        Ok(copied)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<usize, FsError> {
        self.require_file()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.raw_write(offset, data)?;
        let end = offset + data.len() as u32;
        if end > *self.size.read() {
            self.set_size(end)?;
        }
        Ok(data.len())
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        self.require_dir()?;
        let Some(entry) = self.volume.visible_entry_at(self.inode, index)? else {
            return Ok(None);
        };
        Ok(Some(DirEntry {
            name: name_from_83(&entry.name),
            kind: if entry.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            inode: entry.first_cluster,
        }))
    }

    fn finddir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.require_dir()?;
        let name83 = name_to_83(name)?;
        let (loc, entry) = self
            .volume
            .find_entry(self.inode, &name83)?
            .ok_or(FsError::NotFound)?;
        self.volume.node_from_entry(&entry, loc)
    }

    fn create_file(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.require_dir()?;
        let name83 = name_to_83(name)?;
        if self.volume.find_entry(self.inode, &name83)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let cluster = self.volume.alloc_cluster()?;
        let entry = RawEntry {
            name: name83,
            attr: FatAttributes::ARCHIVE.bits(),
            first_cluster: cluster,
            size: 0,
        };
        let loc = self.volume.find_free_slot(self.inode)?;
        self.volume.write_entry_at(loc, &entry.encode())?;
        self.volume.node_from_entry(&entry, loc)
    }

    fn mkdir(&self, name: &str) -> Result<Arc<dyn VfsNode>, FsError> {
        self.require_dir()?;
        let name83 = name_to_83(name)?;
        if self.volume.find_entry(self.inode, &name83)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let cluster = self.volume.alloc_cluster()?;

        // Conventional "." and ".." links; readdir never surfaces them.
        let mut dot = [b' '; 11];
        dot[0] = b'.';
        let mut dotdot = [b' '; 11];
        dotdot[0] = b'.';
        dotdot[1] = b'.';
        let parent_cluster = if self.dir_loc.read().is_none() {
            0 // ".." of a first-level directory points at the root marker
        } else {
            self.inode
        };
        let mut data = vec![0u8; self.volume.geom.bytes_per_cluster as usize];
        let dot_entry = RawEntry {
            name: dot,
            attr: FatAttributes::DIRECTORY.bits(),
            first_cluster: cluster,
            size: 0,
        };
        let dotdot_entry = RawEntry {
            name: dotdot,
            attr: FatAttributes::DIRECTORY.bits(),
            first_cluster: parent_cluster,
            size: 0,
        };
        data[0..DIR_ENTRY_SIZE].copy_from_slice(&dot_entry.encode());
        data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot_entry.encode());
        self.volume.write_cluster(cluster, &data)?;

        let entry = RawEntry {
            name: name83,
            attr: FatAttributes::DIRECTORY.bits(),
            first_cluster: cluster,
            size: 0,
        };
        let loc = self.volume.find_free_slot(self.inode)?;
        self.volume.write_entry_at(loc, &entry.encode())?;
        self.volume.node_from_entry(&entry, loc)
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        self.require_dir()?;
        let name83 = name_to_83(name)?;
        let (loc, entry) = self
            .volume
            .find_entry(self.inode, &name83)?
            .ok_or(FsError::NotFound)?;
        if entry.is_directory() {
            return Err(FsError::NotAFile);
        }
        if entry.first_cluster != 0 {
            self.volume.free_chain(entry.first_cluster)?;
        }
        let mut bytes = entry.encode();
        bytes[0] = ENTRY_DELETED;
        self.volume.write_entry_at(loc, &bytes)?;
        self.volume.cache.lock().remove(entry.first_cluster);
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<(), FsError> {
        self.require_dir()?;
        let name83 = name_to_83(name)?;
        let (loc, entry) = self
            .volume
            .find_entry(self.inode, &name83)?
            .ok_or(FsError::NotFound)?;
        if !entry.is_directory() {
            return Err(FsError::NotADirectory);
        }
        if !self.volume.is_dir_empty(entry.first_cluster)? {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.volume.free_chain(entry.first_cluster)?;
        let mut bytes = entry.encode();
        bytes[0] = ENTRY_DELETED;
        self.volume.write_entry_at(loc, &bytes)?;
        self.volume.cache.lock().remove(entry.first_cluster);
        Ok(())
    }

    fn rename(
        &self,
        old_name: &str,
        new_parent_inode: u32,
        new_name: &str,
    ) -> Result<(), FsError> {
        self.require_dir()?;
        let old83 = name_to_83(old_name)?;
        let new83 = name_to_83(new_name)?;
        let (old_loc, entry) = self
            .volume
            .find_entry(self.inode, &old83)?
            .ok_or(FsError::NotFound)?;
        if self.volume.find_entry(new_parent_inode, &new83)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let moved = RawEntry {
            name: new83,
            ..entry
        };
        let new_loc = self.volume.find_free_slot(new_parent_inode)?;
        self.volume.write_entry_at(new_loc, &moved.encode())?;
        let mut bytes = entry.encode();
        bytes[0] = ENTRY_DELETED;
        self.volume.write_entry_at(old_loc, &bytes)?;

        // Keep any cached node coherent with its new entry
        if let Some(node) = self.volume.cache.lock().get(entry.first_cluster) {
            *node.name.write() = name_from_83(&new83);
            *node.dir_loc.write() = Some(new_loc);
        }
        Ok(())
    }

    fn truncate(&self, size: u32) -> Result<(), FsError> {
        self.require_file()?;
        let fs = &self.volume;
        let bpc = fs.geom.bytes_per_cluster;
        let old_size = *self.size.read();
        let keep = core::cmp::max(1, size.div_ceil(bpc));

        // Walk to the last kept cluster, extending when growing
        let mut cluster = self.inode;
        for _ in 1..keep {
            cluster = fs.next_or_extend(cluster)?;
        }
        // Drop the tail beyond it
        if let Some(tail) = fs.next_cluster(cluster)? {
            fs.free_chain(tail)?;
        }
        fs.set_fat_entry(cluster, FAT_EOC)?;

        if size > old_size {
            self.zero_range(old_size, size)?;
        }
        self.set_size(size)
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::fs::{
        blockdev::RamDisk, ensure_path_exists_from, list_dir, resolve_path_from, split_path,
    };

    const SECTOR: usize = 512;

    /// Build a minimal FAT32 image: one reserved region, two FATs, and a
    /// root directory occupying cluster 2.
    fn mkfs(data_clusters: u32) -> RamDisk {
        let reserved: u32 = 32;
        let num_fats: u32 = 2;
        let entries_per_sector = (SECTOR / 4) as u32;
        let fat_size = (data_clusters + 2).div_ceil(entries_per_sector);
        let total_sectors = reserved + num_fats * fat_size + data_clusters;
        let mut image = vec![0u8; total_sectors as usize * SECTOR];

        image[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        image[13] = 1; // sectors per cluster
        image[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        image[16] = num_fats as u8;
        image[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        image[36..40].copy_from_slice(&fat_size.to_le_bytes());
        image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        image[510] = 0x55;
        image[511] = 0xAA;

        for fat in 0..num_fats {
            let base = ((reserved + fat * fat_size) as usize) * SECTOR;
            image[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            // Root directory: single end-of-chain cluster
            image[base + 8..base + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }

        RamDisk::from_image("fat32-test".to_string(), SECTOR, image)
    }

    fn mount() -> Arc<Fat32Volume> {
        Fat32Volume::mount(Box::new(mkfs(256)), 0).unwrap()
    }

    fn root(volume: &Arc<Fat32Volume>) -> Arc<dyn VfsNode> {
        volume.root_node().unwrap()
    }

    #[test]
    fn test_mount_geometry() {
        let volume = mount();
        assert_eq!(volume.geom.bytes_per_cluster, 512);
        assert_eq!(volume.geom.root_cluster, 2);
        let root = root(&volume);
        assert_eq!(root.kind(), NodeKind::Directory);
        assert_eq!(root.inode(), 2);
    }

    #[test]
    fn test_mount_rejects_non_fat32() {
        let mut disk = mkfs(64);
        // Pretend it is FAT16: fat_size_16 set, fat_size_32 zero
        let mut sector = [0u8; SECTOR];
        disk.read_blocks(0, &mut sector).unwrap();
        sector[22..24].copy_from_slice(&8u16.to_le_bytes());
        sector[36..40].copy_from_slice(&0u32.to_le_bytes());
        disk.write_blocks(0, &sector).unwrap();
        assert!(matches!(
            Fat32Volume::mount(Box::new(disk), 0),
            Err(FsError::NotFat32)
        ));
    }

    #[test]
    fn test_name_round_trip() {
        assert_eq!(name_to_83("cat").unwrap(), *b"CAT        ");
        assert_eq!(name_to_83("kernel.bin").unwrap(), *b"KERNEL  BIN");
        assert_eq!(name_from_83(b"CAT        "), "cat");
        assert_eq!(name_from_83(b"KERNEL  BIN"), "kernel.bin");
    }

    #[test]
    fn test_name_truncates_to_8_3() {
        assert_eq!(name_to_83("verylongname.text").unwrap(), *b"VERYLONGTEX");
    }

    #[test]
    fn test_name_rejects_bad_components() {
        assert!(name_to_83("").is_err());
        assert!(name_to_83(".").is_err());
        assert!(name_to_83("..").is_err());
        assert!(name_to_83("a/b").is_err());
    }

    #[test]
    fn test_create_write_read_round_trip() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("x").unwrap();
        assert_eq!(file.write(0, b"abc").unwrap(), 3);
        assert_eq!(file.size(), 3);
        let mut buf = [0u8; 8];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn test_write_across_cluster_boundary() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("big").unwrap();
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write(0, &data).unwrap(), 1500);
        assert_eq!(file.size(), 1500);
        let mut buf = vec![0u8; 1500];
        assert_eq!(file.read(0, &mut buf).unwrap(), 1500);
        assert_eq!(buf, data);
        // Chain bound: ceil(size / bpc) + 1
        let len = volume.chain_len(file.inode()).unwrap();
        assert!(len <= 1500u32.div_ceil(512) + 1);
    }

    #[test]
    fn test_read_at_offset() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("off").unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        file.write(0, &data).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(file.read(600, &mut buf).unwrap(), 100);
        assert_eq!(buf[..], data[600..700]);
    }

    #[test]
    fn test_read_at_eof_returns_zero() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("eof").unwrap();
        file.write(0, b"data").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(4, &mut buf).unwrap(), 0);
        assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_create_unlink_resolve_fails() {
        let volume = mount();
        let root = root(&volume);
        root.create_file("a").unwrap();
        assert!(resolve_path_from(&root, "/a").is_ok());
        root.unlink("a").unwrap();
        assert!(matches!(
            resolve_path_from(&root, "/a"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_unlink_frees_clusters() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("fat").unwrap();
        let inode = file.inode();
        file.write(0, &vec![7u8; 2048]).unwrap();
        drop(file);
        root.unlink("fat").unwrap();
        assert_eq!(volume.fat_entry(inode).unwrap(), 0);
    }

    #[test]
    fn test_ensure_path_exists_nested() {
        let volume = mount();
        let root = root(&volume);
        ensure_path_exists_from(&root, "/x/y/z").unwrap();
        for path in ["/x", "/x/y", "/x/y/z"] {
            let node = resolve_path_from(&root, path).unwrap();
            assert_eq!(node.kind(), NodeKind::Directory, "{} not a directory", path);
        }
        // Idempotent
        ensure_path_exists_from(&root, "/x/y/z").unwrap();
    }

    #[test]
    fn test_ensure_path_fails_through_file() {
        let volume = mount();
        let root = root(&volume);
        root.create_file("f").unwrap();
        assert!(matches!(
            ensure_path_exists_from(&root, "/f/sub"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn test_rename_preserves_inode() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("a").unwrap();
        file.write(0, b"payload").unwrap();
        let inode = file.inode();
        drop(file);

        root.rename("a", root.inode(), "b").unwrap();
        assert!(matches!(
            resolve_path_from(&root, "/a"),
            Err(FsError::NotFound)
        ));
        let renamed = resolve_path_from(&root, "/b").unwrap();
        assert_eq!(renamed.inode(), inode);
        let mut buf = [0u8; 7];
        assert_eq!(renamed.read(0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_rename_to_existing_fails() {
        let volume = mount();
        let root = root(&volume);
        root.create_file("a").unwrap();
        root.create_file("b").unwrap();
        assert!(matches!(
            root.rename("a", root.inode(), "b"),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn test_rename_across_directories() {
        let volume = mount();
        let root = root(&volume);
        let dir = root.mkdir("dst").unwrap();
        let file = root.create_file("a").unwrap();
        file.write(0, b"move me").unwrap();
        drop(file);

        root.rename("a", dir.inode(), "a").unwrap();
        assert!(resolve_path_from(&root, "/a").is_err());
        let moved = resolve_path_from(&root, "/dst/a").unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(moved.read(0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"move me");
    }

    #[test]
    fn test_rmdir_refuses_non_empty() {
        let volume = mount();
        let root = root(&volume);
        let dir = root.mkdir("d").unwrap();
        dir.create_file("child").unwrap();
        assert!(matches!(root.rmdir("d"), Err(FsError::DirectoryNotEmpty)));
        dir.unlink("child").unwrap();
        root.rmdir("d").unwrap();
        assert!(resolve_path_from(&root, "/d").is_err());
    }

    #[test]
    fn test_readdir_skips_deleted_and_dots() {
        let volume = mount();
        let root = root(&volume);
        let dir = root.mkdir("d").unwrap();
        dir.create_file("one").unwrap();
        dir.create_file("two").unwrap();
        dir.create_file("three").unwrap();
        dir.unlink("two").unwrap();

        let names: Vec<String> = list_dir(&dir).unwrap().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["one", "three"]);
    }

    #[test]
    fn test_readdir_on_file_fails() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("f").unwrap();
        assert!(matches!(file.readdir(0), Err(FsError::NotADirectory)));
    }

    #[test]
    fn test_truncate_shrink_and_grow() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("t").unwrap();
        file.write(0, b"abcdef").unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.size(), 3);
        let mut buf = [0u8; 8];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");

        file.truncate(6).unwrap();
        assert_eq!(file.size(), 6);
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc\0\0\0");
    }

    #[test]
    fn test_truncate_shrink_frees_tail() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("t2").unwrap();
        file.write(0, &vec![1u8; 4 * 512]).unwrap();
        assert_eq!(volume.chain_len(file.inode()).unwrap(), 4);
        file.truncate(100).unwrap();
        assert_eq!(volume.chain_len(file.inode()).unwrap(), 1);
    }

    #[test]
    fn test_node_cache_unifies_lookups() {
        let volume = mount();
        let root = root(&volume);
        root.create_file("same").unwrap();
        let a = root.finddir("same").unwrap();
        let b = root.finddir("same").unwrap();
        assert_eq!(a.inode(), b.inode());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_create_existing_fails() {
        let volume = mount();
        let root = root(&volume);
        root.create_file("dup").unwrap();
        assert!(matches!(
            root.create_file("dup"),
            Err(FsError::AlreadyExists)
        ));
        assert!(matches!(root.mkdir("dup"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_fat_mirroring() {
        let volume = mount();
        let root = root(&volume);
        let file = root.create_file("m").unwrap();
        let inode = file.inode();
        // The allocation must be visible in both FAT copies
        let geom = volume.geom;
        let offset = inode * 4;
        let sector_index = offset / geom.bytes_per_sector;
        let within = (offset % geom.bytes_per_sector) as usize;
        for fat in 0..geom.num_fats {
            let lba = geom.fat_start_lba + fat * geom.fat_size + sector_index;
            let mut buf = vec![0u8; geom.bytes_per_sector as usize];
            volume.read_sector(lba, &mut buf).unwrap();
            let value = u32::from_le_bytes([buf[within], buf[within + 1], buf[within + 2], buf[within + 3]])
                & 0x0FFF_FFFF;
            assert!(is_end_of_chain(value), "FAT copy {} not updated", fat);
        }
    }

    #[test]
    fn test_split_path_matches_backend_expectations() {
        let volume = mount();
        let root = root(&volume);
        ensure_path_exists_from(&root, "/apps").unwrap();
        let (parent, name) = split_path("/apps/cat").unwrap();
        let parent_node = resolve_path_from(&root, parent).unwrap();
        parent_node.create_file(name).unwrap();
        assert!(resolve_path_from(&root, "/apps/cat").is_ok());
    }
}
