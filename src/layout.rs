//! On-disk layout of a ListFS volume.
//!
//! A volume is an array of fixed-size blocks. Block 0 holds the superblock,
//! followed by the free-space bitmap, followed by node headers, block-list
//! pages and data blocks wherever the allocator placed them. Every record is
//! little-endian and packed; the structures below match the disk format
//! byte for byte.

use crate::util::reinterpret;
use bitflags::bitflags;
use std::fmt;
use std::mem::size_of;
use std::ptr;

/// The superblock's magic number (`LIST` in little-endian).
pub const MAGIC: u32 = 0x5453494c;
/// The node header's magic number (`NODE` in little-endian).
pub const NODE_MAGIC: u32 = 0x45444f4e;

/// The format's major version.
pub const VERSION_MAJOR: u8 = 1;
/// The format's minor version.
pub const VERSION_MINOR: u8 = 0;
/// The on-disk version field, `MAJOR << 8 | MINOR`.
pub const VERSION: u16 = (VERSION_MAJOR as u16) << 8 | VERSION_MINOR as u16;

/// The minimum size of a block in bytes.
///
/// This is also the size of the probe buffer used to read the superblock
/// before the volume's actual block size is known.
pub const MIN_BLOCK_SIZE: usize = 512;

/// The size of a node's name field in bytes.
pub const NAME_LEN: usize = 256;

/// The size of the superblock record in bytes.
pub const SUPERBLOCK_SIZE: usize = size_of::<Superblock>();
/// The size of a node header record in bytes.
pub const NODE_HEADER_SIZE: usize = size_of::<NodeHeader>();

/// The index of a block on the volume.
///
/// All links in the filesystem (parent/sibling pointers, file data) are
/// expressed as block indices; a node is identified by the index of the
/// block holding its header. The all-ones value is reserved and means
/// "none"; it is written to disk as-is.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockIndex(u64);

impl BlockIndex {
    /// The "no block" sentinel.
    pub const NONE: Self = Self(u64::MAX);

    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Tells whether this is the "no block" sentinel.
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    pub const fn is_some(self) -> bool {
        !self.is_none()
    }
}

impl From<u64> for BlockIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(fmt, "-1")
        } else {
            write!(fmt, "{}", self.0)
        }
    }
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, fmt)
    }
}

bitflags! {
    /// A node's flags field.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// The node is a directory; its data points to its first child.
        const DIRECTORY = 1;
    }
}

/// The superblock, stored at block 0 and padded to one block.
///
/// The remainder of block 0 is reserved and may hold boot code.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Superblock {
    /// Reserved for a bootstrap jump instruction.
    pub jump: [u8; 4],
    /// The filesystem's magic number.
    pub magic: u32,
    /// Byte offset added to every block-index-to-byte-offset translation.
    pub base: u64,
    /// Total number of blocks on the volume.
    pub size: u64,
    /// The first block of the free-space bitmap.
    pub map_base: BlockIndex,
    /// The number of blocks of the free-space bitmap.
    pub map_size: u64,
    /// The first top-level node, if any.
    pub root_dir: BlockIndex,
    /// The size of a block in bytes.
    pub block_size: u16,
    /// The format version.
    pub version: u16,
    /// The number of allocated blocks, including the superblock and the
    /// bitmap itself.
    pub used_blocks: u64,
}

impl Superblock {
    /// Reads the record back from the beginning of a block buffer.
    ///
    /// `block` may be as small as [`MIN_BLOCK_SIZE`], which is enough to
    /// cover the record regardless of the volume's block size.
    pub fn decode(block: &[u8]) -> Self {
        assert!(block.len() >= SUPERBLOCK_SIZE);
        unsafe { ptr::read_unaligned(block.as_ptr() as *const Self) }
    }

    /// Writes the record over the beginning of a block buffer, leaving the
    /// rest of the buffer untouched.
    pub fn encode(&self, block: &mut [u8]) {
        block[..SUPERBLOCK_SIZE].copy_from_slice(reinterpret(self));
    }

    /// Returns the size of a block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Returns the number of slots in a block-list page.
    pub fn block_list_len(&self) -> usize {
        self.block_size as usize / size_of::<u64>()
    }
}

/// A node's header, one per block; the block index is the node's identity.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct NodeHeader {
    /// The node's name, zero-padded. A name filling the whole field is not
    /// NUL-terminated.
    pub name: [u8; NAME_LEN],
    /// The parent directory, or none for a top-level node.
    pub parent: BlockIndex,
    /// The next sibling under the same parent.
    pub next: BlockIndex,
    /// The previous sibling under the same parent.
    pub prev: BlockIndex,
    /// For a directory, the first child node; for a file, the head
    /// block-list page.
    pub data: BlockIndex,
    /// The node magic number.
    pub magic: u32,
    /// The node's flags.
    pub flags: u32,
    /// File length in bytes; 0 for directories.
    pub size: u64,
    /// Creation time, in Unix seconds.
    pub create_time: u64,
    /// Last content modification time, in Unix seconds.
    pub modify_time: u64,
    /// Last access time, in Unix seconds.
    pub access_time: u64,
}

impl NodeHeader {
    /// Creates a header for a fresh node with no data and no links yet.
    pub fn new(name: &str, flags: NodeFlags, timestamp: u64) -> Self {
        Self {
            name: pack_name(name.as_bytes()),
            parent: BlockIndex::NONE,
            next: BlockIndex::NONE,
            prev: BlockIndex::NONE,
            data: BlockIndex::NONE,
            magic: NODE_MAGIC,
            flags: flags.bits(),
            size: 0,
            create_time: timestamp,
            modify_time: timestamp,
            access_time: timestamp,
        }
    }

    /// Reads the record back from the beginning of a block buffer.
    pub fn decode(block: &[u8]) -> Self {
        assert!(block.len() >= NODE_HEADER_SIZE);
        unsafe { ptr::read_unaligned(block.as_ptr() as *const Self) }
    }

    /// Writes the record over the beginning of a block buffer.
    pub fn encode(&self, block: &mut [u8]) {
        block[..NODE_HEADER_SIZE].copy_from_slice(reinterpret(self));
    }

    /// Returns the node's flags.
    pub fn flags(&self) -> NodeFlags {
        let flags = self.flags;
        NodeFlags::from_bits_truncate(flags)
    }

    /// Tells whether the node is a directory.
    pub fn is_directory(&self) -> bool {
        self.flags().contains(NodeFlags::DIRECTORY)
    }

    /// Returns the node's name with the zero padding stripped.
    pub fn name(&self) -> String {
        let name = self.name;
        let len = name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&name[..len]).into_owned()
    }
}

/// Packs a name into its on-disk form: truncated to [`NAME_LEN`] bytes and
/// zero-padded.
pub fn pack_name(name: &[u8]) -> [u8; NAME_LEN] {
    let mut buf = [0; NAME_LEN];
    let len = name.len().min(NAME_LEN);
    buf[..len].copy_from_slice(&name[..len]);
    buf
}

/// One page of a file's block list.
///
/// A page is one block interpreted as an array of `block_size / 8` indices.
/// Slot 0 points to the previous page and the last slot to the next page;
/// the slots in between hold the file's data blocks in order. Unused slots
/// hold the "none" sentinel.
#[derive(Clone)]
pub struct BlockList {
    slots: Vec<BlockIndex>,
}

impl BlockList {
    /// Creates an empty page with `len` slots, all set to none.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![BlockIndex::NONE; len],
        }
    }

    /// Decodes a page from a block buffer.
    pub fn decode(block: &[u8]) -> Self {
        let slots = block
            .chunks_exact(size_of::<u64>())
            .map(|chunk| BlockIndex::new(u64::from_le_bytes(chunk.try_into().unwrap())))
            .collect();
        Self { slots }
    }

    /// Encodes the page into a block buffer.
    pub fn encode(&self, block: &mut [u8]) {
        for (chunk, slot) in block.chunks_exact_mut(size_of::<u64>()).zip(&self.slots) {
            chunk.copy_from_slice(&slot.get().to_le_bytes());
        }
    }

    /// The number of slots in the page.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The previous page in the chain.
    pub fn prev(&self) -> BlockIndex {
        self.slots[0]
    }

    pub fn set_prev(&mut self, block: BlockIndex) {
        self.slots[0] = block;
    }

    /// The next page in the chain.
    pub fn next(&self) -> BlockIndex {
        self.slots[self.slots.len() - 1]
    }

    pub fn set_next(&mut self, block: BlockIndex) {
        let last = self.slots.len() - 1;
        self.slots[last] = block;
    }

    /// The content of the given slot.
    pub fn slot(&self, i: usize) -> BlockIndex {
        self.slots[i]
    }

    pub fn set_slot(&mut self, i: usize, block: BlockIndex) {
        self.slots[i] = block;
    }

    /// Resets every slot to none.
    pub fn fill_none(&mut self) {
        self.slots.fill(BlockIndex::NONE);
    }

    /// The data blocks recorded in the page, in file order, stopping at the
    /// first unused slot.
    pub fn data_blocks(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.slots[1..self.slots.len() - 1]
            .iter()
            .copied()
            .take_while(|block| block.is_some())
    }
}
