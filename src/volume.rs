//! Volume lifecycle: creation, opening, closing.
//!
//! [`ListFs`] is the handle every operation goes through. It owns the block
//! device adapter, the in-memory superblock and free-space bitmap, and the
//! open-file registry. The superblock and the bitmap are mutated in memory
//! and written back when the volume is closed; a volume opened after a
//! clean close observes the state left by that close.

use crate::bitmap::Bitmap;
use crate::device::BlockDevice;
use crate::layout::BlockIndex;
use crate::layout::BlockList;
use crate::layout::NodeHeader;
use crate::layout::Superblock;
use crate::layout::MAGIC;
use crate::layout::MIN_BLOCK_SIZE;
use crate::layout::SUPERBLOCK_SIZE;
use crate::layout::VERSION;
use crate::util::ceil_division;
use crate::util::get_timestamp;
use crate::Error;
use std::cell::RefCell;
use std::cmp::max;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// An injected log sink; receives one formatted message per engine event.
pub type LogFn = Box<dyn FnMut(fmt::Arguments<'_>)>;

/// An injected time source, returning Unix seconds.
pub type ClockFn = Box<dyn Fn() -> u64>;

/// A ListFS volume bound to a block device adapter.
///
/// The handle is single-threaded by design: open files share state through
/// reference counting and operations must be externally serialized.
pub struct ListFs<D: BlockDevice> {
    dev: D,
    log: RefCell<Option<LogFn>>,
    clock: ClockFn,
    /// In-memory superblock; present while the volume is open.
    sb: Option<Superblock>,
    /// The whole of block 0, so that closing the volume does not clobber
    /// boot code stored after the superblock record.
    block0: Vec<u8>,
    map: Bitmap,
    /// Open-file registry: node block index to shared open state.
    pub(crate) files: HashMap<u64, Rc<RefCell<crate::file::FileState>>>,
}

impl<D: BlockDevice> ListFs<D> {
    /// Binds a handle to a block device adapter. No I/O happens until the
    /// volume is created or opened.
    pub fn init(dev: D) -> Self {
        Self {
            dev,
            log: RefCell::new(None),
            clock: Box::new(|| get_timestamp().as_secs()),
            sb: None,
            block0: Vec::new(),
            map: Bitmap::new(0),
            files: HashMap::new(),
        }
    }

    /// Installs a log sink receiving a message per engine event.
    pub fn with_log(self, log: impl FnMut(fmt::Arguments<'_>) + 'static) -> Self {
        *self.log.borrow_mut() = Some(Box::new(log));
        self
    }

    /// Replaces the time source used to stamp nodes. The default is the
    /// system clock; a source returning 0 effectively disables timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Returns the device adapter.
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Returns the volume's superblock.
    ///
    /// Panics when the volume has not been created or opened.
    pub fn superblock(&self) -> &Superblock {
        self.sb.as_ref().expect("volume is not open")
    }

    pub(crate) fn superblock_mut(&mut self) -> &mut Superblock {
        self.sb.as_mut().expect("volume is not open")
    }

    pub(crate) fn log(&self, args: fmt::Arguments<'_>) {
        if let Some(f) = self.log.borrow_mut().as_mut() {
            f(args);
        }
    }

    /// The current time in Unix seconds, from the injected clock.
    pub(crate) fn now(&self) -> u64 {
        (self.clock)()
    }

    pub(crate) fn block_size(&self) -> usize {
        self.superblock().block_size()
    }

    pub(crate) fn block_list_len(&self) -> usize {
        self.superblock().block_list_len()
    }

    pub(crate) fn root_dir(&self) -> BlockIndex {
        self.superblock().root_dir
    }

    pub(crate) fn set_root_dir(&mut self, node: BlockIndex) {
        self.superblock_mut().root_dir = node;
    }

    // Block I/O

    pub(crate) fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) {
        self.log(format_args!("[read_block] index = {index}"));
        self.dev.read_block(index.get(), buf);
    }

    pub(crate) fn write_block(&mut self, index: BlockIndex, buf: &[u8]) {
        self.log(format_args!("[write_block] index = {index}"));
        self.dev.write_block(index.get(), buf);
    }

    pub(crate) fn read_node_header(&mut self, node: BlockIndex) -> NodeHeader {
        let mut buf = vec![0; self.block_size()];
        self.read_block(node, &mut buf);
        NodeHeader::decode(&buf)
    }

    /// Writes a node header, zero-padding the rest of its block.
    pub(crate) fn write_node_header(&mut self, node: BlockIndex, header: &NodeHeader) {
        let mut buf = vec![0; self.block_size()];
        header.encode(&mut buf);
        self.write_block(node, &buf);
    }

    pub(crate) fn read_list(&mut self, block: BlockIndex) -> BlockList {
        let mut buf = vec![0; self.block_size()];
        self.read_block(block, &mut buf);
        BlockList::decode(&buf)
    }

    pub(crate) fn write_list(&mut self, block: BlockIndex, list: &BlockList) {
        let mut buf = vec![0; self.block_size()];
        list.encode(&mut buf);
        self.write_block(block, &buf);
    }

    // Allocation; `used_blocks` mirrors the bitmap at all times

    /// Finds and claims a free block with the bitmap's rotating first-fit
    /// scan. Returns none when the volume is full.
    pub(crate) fn alloc_block(&mut self) -> Option<BlockIndex> {
        self.log(format_args!("[alloc_block]"));
        let size = self.superblock().size;
        match self.map.alloc(size) {
            Some(index) => {
                self.superblock_mut().used_blocks += 1;
                self.log(format_args!("[alloc_block] found free block {index}"));
                Some(BlockIndex::new(index))
            }
            None => {
                self.log(format_args!("[alloc_block] free block not found"));
                None
            }
        }
    }

    pub(crate) fn mark_used(&mut self, index: BlockIndex, count: u64) {
        self.log(format_args!("[mark_used] index = {index}, count = {count}"));
        self.map.mark_used(index.get(), count);
        self.superblock_mut().used_blocks += count;
    }

    pub(crate) fn mark_free(&mut self, index: BlockIndex, count: u64) {
        self.log(format_args!("[mark_free] index = {index}, count = {count}"));
        self.map.mark_free(index.get(), count);
        self.superblock_mut().used_blocks -= count;
    }

    /// Counts the set bits of the in-memory bitmap.
    pub fn map_popcount(&self) -> u64 {
        self.map.popcount()
    }

    // Lifecycle

    /// Formats the volume: writes a fresh superblock, an optional
    /// bootloader overlay, a zeroed bitmap claiming the metadata region,
    /// and sizes the backing container by writing its last block.
    ///
    /// `size` is the total block count, `block_size` the bytes per block
    /// (at least [`MIN_BLOCK_SIZE`]). The first 4 bootloader bytes land in
    /// the superblock's jump field; the rest fills the front of the volume
    /// around the superblock record.
    pub fn create(&mut self, size: u64, block_size: u16, bootloader: &[u8]) {
        assert!(block_size as usize >= MIN_BLOCK_SIZE, "block size too small");
        assert!(size >= 2, "volume size too small");
        self.log(format_args!(
            "[create] size = {size}, block_size = {block_size}"
        ));

        let bs = block_size as usize;
        let map_base = ceil_division(max(bootloader.len() as u64, SUPERBLOCK_SIZE as u64), bs as u64);
        let map_size = ceil_division(ceil_division(size, 8), bs as u64);

        let mut sb = Superblock {
            jump: [0; 4],
            magic: MAGIC,
            base: 0,
            size,
            map_base: BlockIndex::new(map_base),
            map_size,
            root_dir: BlockIndex::NONE,
            block_size,
            version: VERSION,
            used_blocks: 0,
        };
        if bootloader.len() >= 4 {
            sb.jump.copy_from_slice(&bootloader[..4]);
        }

        // Block 0 is the front of the bootloader with the superblock record
        // overlaid on it
        let mut block0 = vec![0; bs];
        let head = bootloader.len().min(bs);
        block0[..head].copy_from_slice(&bootloader[..head]);

        self.sb = Some(sb);
        self.block0 = block0;
        self.map = Bitmap::new((map_size as usize) * bs);
        self.files.clear();
        self.mark_used(BlockIndex::new(0), map_base + map_size);

        // Remaining bootloader bytes fill the blocks before the bitmap
        for i in 1..map_base {
            let mut buf = vec![0; bs];
            let start = i as usize * bs;
            if start < bootloader.len() {
                let len = bs.min(bootloader.len() - start);
                buf[..len].copy_from_slice(&bootloader[start..start + len]);
            }
            self.write_block(BlockIndex::new(i), &buf);
        }

        self.flush_superblock();
        self.flush_map();

        // Size the backing container
        let zero = vec![0; bs];
        self.write_block(BlockIndex::new(size - 1), &zero);
    }

    /// Opens an existing volume: probes the superblock, then loads the
    /// bitmap. Fails without touching any state when the magic number does
    /// not match.
    pub fn open(&mut self) -> Result<(), Error> {
        self.log(format_args!("[open]"));
        let mut probe = vec![0; MIN_BLOCK_SIZE];
        self.read_block(BlockIndex::new(0), &mut probe);
        let sb = Superblock::decode(&probe);
        if { sb.magic } != MAGIC {
            self.log(format_args!("[open] this is not ListFS!"));
            return Err(Error::NotListFs);
        }

        // Reread block 0 at the volume's actual block size
        let bs = sb.block_size();
        let mut block0 = vec![0; bs];
        self.read_block(BlockIndex::new(0), &mut block0);
        let sb = Superblock::decode(&block0);

        let map_base = sb.map_base;
        let map_size = sb.map_size;
        let mut bytes = vec![0; map_size as usize * bs];
        for i in 0..map_size {
            let start = i as usize * bs;
            self.read_block(
                BlockIndex::new(map_base.get() + i),
                &mut bytes[start..start + bs],
            );
        }

        self.sb = Some(sb);
        self.block0 = block0;
        self.map = Bitmap::from_bytes(bytes);
        self.files.clear();
        Ok(())
    }

    /// Persists the superblock and the bitmap and releases the volume's
    /// buffers. A no-op when the volume is not open.
    pub fn close(&mut self) {
        self.log(format_args!("[close]"));
        if self.sb.is_none() {
            return;
        }
        self.flush_superblock();
        self.flush_map();
        self.sb = None;
        self.block0 = Vec::new();
        self.map = Bitmap::new(0);
        self.files.clear();
    }

    fn flush_superblock(&mut self) {
        let sb = *self.superblock();
        let mut block0 = mem::take(&mut self.block0);
        sb.encode(&mut block0);
        self.write_block(BlockIndex::new(0), &block0);
        self.block0 = block0;
    }

    fn flush_map(&mut self) {
        let map_base = self.superblock().map_base;
        let map_size = self.superblock().map_size;
        let bs = self.block_size();
        let map = mem::replace(&mut self.map, Bitmap::new(0));
        for i in 0..map_size {
            let start = i as usize * bs;
            let chunk = &map.as_bytes()[start..start + bs];
            self.write_block(BlockIndex::new(map_base.get() + i), chunk);
        }
        self.map = map;
    }
}
