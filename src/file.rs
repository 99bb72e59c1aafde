//! Open files and the file data layer.
//!
//! A file's content lives in data blocks recorded by a doubly-linked chain
//! of block-list pages. An open file carries a cursor: the currently loaded
//! page, a slot within it, a byte offset inside the slot's data block and
//! the absolute position. Slot 0 and the last slot are the page's prev/next
//! pointers; the cursor uses them as transition states which
//! `touch_cur_block` resolves by hopping to the neighbor page (allocating
//! it first when writing).
//!
//! Opens of the same node are coalesced: the registry hands out handles
//! sharing one state, so all handles see one cursor. The state is dropped
//! when the last handle is closed.

use crate::device::BlockDevice;
use crate::layout::BlockIndex;
use crate::layout::BlockList;
use crate::layout::NodeHeader;
use crate::layout::NODE_MAGIC;
use crate::volume::ListFs;
use crate::Error;
use std::cell::RefCell;
use std::cmp::min;
use std::rc::Rc;

/// The shared state of one open node.
pub(crate) struct FileState {
    /// The node this state belongs to.
    node: BlockIndex,
    /// In-memory copy of the node's header.
    header: NodeHeader,
    /// The currently loaded block-list page, or none before the first
    /// write of an empty file.
    cur_list_block: BlockIndex,
    /// Decoded copy of the current page.
    cur_list: BlockList,
    /// Slot of the current data block within the page.
    cur_slot: usize,
    /// Byte offset within the current data block.
    cur_byte: usize,
    /// Absolute byte offset in the file.
    cur_global: u64,
    /// Number of handles sharing this state.
    link_count: u32,
}

/// A handle to an open file.
///
/// Handles returned for the same node share one cursor; a second handle is
/// another reference, not an independent view.
pub struct OpenFile {
    state: Rc<RefCell<FileState>>,
}

impl OpenFile {
    /// The node this handle refers to.
    pub fn node(&self) -> BlockIndex {
        self.state.borrow().node
    }

    /// The file's size in bytes, as of the last operation.
    pub fn size(&self) -> u64 {
        let header = self.state.borrow().header;
        header.size
    }

    /// The cursor's absolute byte position.
    pub fn position(&self) -> u64 {
        self.state.borrow().cur_global
    }
}

impl<D: BlockDevice> ListFs<D> {
    /// Opens the file `node`, coalescing with any open state already
    /// registered for it.
    ///
    /// Fails with [`Error::NotAFile`] when the block does not hold a node
    /// header or the node is a directory.
    pub fn open_file(&mut self, node: BlockIndex) -> Result<OpenFile, Error> {
        self.log(format_args!("[open_file] node = {node}"));
        if node.is_none() {
            return Err(Error::NonePath);
        }
        if let Some(state) = self.files.get(&node.get()) {
            let state = state.clone();
            state.borrow_mut().link_count += 1;
            self.log(format_args!("[open_file] this file is already open"));
            return Ok(OpenFile { state });
        }

        let header = self.read_node_header(node);
        let magic = header.magic;
        if magic != NODE_MAGIC || header.is_directory() {
            self.log(format_args!("[open_file] node {node} is not a file"));
            return Err(Error::NotAFile);
        }

        let data = header.data;
        let cur_list = if data.is_some() {
            self.read_list(data)
        } else {
            BlockList::new(self.block_list_len())
        };
        let state = Rc::new(RefCell::new(FileState {
            node,
            header,
            cur_list_block: data,
            cur_list,
            cur_slot: 1,
            cur_byte: 0,
            cur_global: 0,
            link_count: 1,
        }));
        self.files.insert(node.get(), state.clone());
        Ok(OpenFile { state })
    }

    /// Releases a handle; the shared state goes away with the last one.
    pub fn close_file(&mut self, file: OpenFile) {
        let (node, remaining) = {
            let mut state = file.state.borrow_mut();
            state.link_count -= 1;
            (state.node, state.link_count)
        };
        self.log(format_args!(
            "[close_file] node = {node}, link count = {remaining}"
        ));
        if remaining == 0 {
            self.files.remove(&node.get());
        }
    }

    /// Moves the cursor to `offset`, walking the page chain block by block.
    ///
    /// With `write` set, every block position crossed on the way is
    /// materialized, and a target beyond the end of the file extends the
    /// file's size at once.
    pub fn file_seek(&mut self, file: &OpenFile, offset: u64, write: bool) {
        self.log(format_args!("[file_seek] offset = {offset}, write = {write}"));
        let mut guard = file.state.borrow_mut();
        let state = &mut *guard;
        let bs = self.block_size() as u64;
        while state.cur_global / bs > offset / bs {
            if !self.switch_cur_block(state, true, write) {
                break;
            }
        }
        while state.cur_global / bs < offset / bs {
            if !self.switch_cur_block(state, false, write) {
                break;
            }
        }
        state.cur_byte = (offset % bs) as usize;
        state.cur_global = offset;
        let size = state.header.size;
        if write && state.cur_global > size {
            state.header.size = state.cur_global;
            let header = state.header;
            self.write_node_header(state.node, &header);
        }
    }

    /// Reads from the cursor into `buf`, clamped to the end of the file.
    /// Returns the number of bytes copied; a hole below the file's size
    /// ends the read early.
    pub fn file_read(&mut self, file: &OpenFile, buf: &mut [u8]) -> usize {
        self.log(format_args!("[file_read] length = {}", buf.len()));
        let mut guard = file.state.borrow_mut();
        let state = &mut *guard;
        let bs = self.block_size();
        let size = state.header.size;
        let mut remaining = min(buf.len() as u64, size.saturating_sub(state.cur_global)) as usize;
        let mut count = 0;
        let mut tmp = vec![0; bs];
        while remaining > 0 {
            if !self.touch_cur_block(state, false) {
                break;
            }
            let block = state.cur_list.slot(state.cur_slot);
            self.read_block(block, &mut tmp);
            let c = min(bs - state.cur_byte, remaining);
            buf[count..count + c].copy_from_slice(&tmp[state.cur_byte..state.cur_byte + c]);
            count += c;
            remaining -= c;
            state.cur_byte += c;
            state.cur_global += c as u64;
            if state.cur_byte >= bs {
                state.cur_slot += 1;
                state.cur_byte = 0;
            }
        }
        count
    }

    /// Writes `buf` at the cursor, allocating pages and data blocks on
    /// demand. Returns the number of bytes written, which falls short of
    /// `buf.len()` only when the volume runs out of blocks.
    pub fn file_write(&mut self, file: &OpenFile, buf: &[u8]) -> usize {
        self.log(format_args!("[file_write] length = {}", buf.len()));
        let mut guard = file.state.borrow_mut();
        let state = &mut *guard;
        let bs = self.block_size();
        let mut count = 0;
        let mut remaining = buf.len();
        let mut tmp = vec![0; bs];
        while remaining > 0 {
            if !self.touch_cur_block(state, true) {
                break;
            }
            let block = state.cur_list.slot(state.cur_slot);
            // A write that does not cover the whole block keeps the rest of
            // its current content
            if state.cur_byte > 0 || remaining < bs {
                self.read_block(block, &mut tmp);
            }
            let c = min(bs - state.cur_byte, remaining);
            tmp[state.cur_byte..state.cur_byte + c].copy_from_slice(&buf[count..count + c]);
            self.write_block(block, &tmp);
            count += c;
            remaining -= c;
            state.cur_byte += c;
            state.cur_global += c as u64;
            if state.cur_byte >= bs {
                state.cur_slot += 1;
                state.cur_byte = 0;
            }
        }
        let size = state.header.size;
        if state.cur_global > size {
            state.header.size = state.cur_global;
            state.header.modify_time = self.now();
            let header = state.header;
            self.write_node_header(state.node, &header);
        }
        count
    }

    /// Discards all file content at and after the cursor's position.
    ///
    /// Walks the chain from the current page, freeing every recorded data
    /// block; a page left without any data is freed too and unlinked from
    /// its predecessor (or from the node when it was the head). The file's
    /// size becomes the cursor position.
    ///
    /// When the head page itself goes away, the cursor has no page to
    /// point at; reads and writes before the next seek are unspecified.
    pub fn file_truncate(&mut self, file: &OpenFile) {
        self.log(format_args!("[file_truncate]"));
        let mut guard = file.state.borrow_mut();
        let state = &mut *guard;
        if state.cur_list_block.is_none() {
            return;
        }
        let len = self.block_list_len();
        let mut cur_list_block = state.cur_list_block;
        let mut slot = state.cur_slot + usize::from(state.cur_byte > 0);
        let mut list = self.read_list(cur_list_block);
        // Data slots visited on the current page; the page can be freed
        // only when every one of its data slots was visited
        let mut visited = 0;
        loop {
            if slot == len - 1 {
                let next = list.next();
                if visited == len - 2 {
                    self.mark_free(cur_list_block, 1);
                    let prev = list.prev();
                    if prev.is_none() {
                        // The head is gone; the file has no data left
                        state.header.data = BlockIndex::NONE;
                        state.cur_list_block = BlockIndex::NONE;
                        let header = state.header;
                        self.write_node_header(state.node, &header);
                    } else {
                        let mut prev_list = self.read_list(prev);
                        prev_list.set_next(BlockIndex::NONE);
                        self.write_list(prev, &prev_list);
                    }
                } else {
                    self.write_list(cur_list_block, &list);
                }
                if next.is_none() {
                    break;
                }
                cur_list_block = next;
                list = self.read_list(next);
                slot = 1;
                visited = 0;
            } else {
                let block = list.slot(slot);
                if block.is_some() {
                    self.mark_free(block, 1);
                    list.set_slot(slot, BlockIndex::NONE);
                }
                visited += 1;
                slot += 1;
            }
        }
        state.header.size = state.cur_global;
        state.header.modify_time = self.now();
        let header = state.header;
        self.write_node_header(state.node, &header);
        if state.cur_list_block.is_some() {
            state.cur_list = self.read_list(state.cur_list_block);
        }
    }

    /// Reads one block-list page, for chain inspection.
    pub fn fetch_list(&mut self, block: BlockIndex) -> Option<BlockList> {
        if block.is_none() {
            return None;
        }
        Some(self.read_list(block))
    }

    /// Makes the cursor's slot hold a usable data block, resolving the
    /// page-transition slots first.
    ///
    /// Returns whether the cursor now points at an existing data block;
    /// with `write` set, missing pages and data blocks are allocated on
    /// the way and a false return means the volume is full.
    fn touch_cur_block(&mut self, state: &mut FileState, write: bool) -> bool {
        self.log(format_args!("[touch_cur_block] write = {write}"));
        let len = self.block_list_len();

        // A file with no pages yet grows its head on the first write
        if state.cur_list_block.is_none() {
            if !write {
                return false;
            }
            let Some(block) = self.alloc_block() else {
                return false;
            };
            state.cur_list_block = block;
            state.header.data = block;
            let header = state.header;
            self.write_node_header(state.node, &header);
            state.cur_list.fill_none();
            self.write_list(block, &state.cur_list);
        }

        if state.cur_slot == 0 {
            // Stepped backward off the page
            let prev = state.cur_list.prev();
            if prev.is_none() {
                state.cur_slot = 1;
            } else {
                state.cur_list_block = prev;
                state.cur_list = self.read_list(prev);
                state.cur_slot = len - 2;
            }
        } else if state.cur_slot == len - 1 {
            // About to cross to the next page
            let next = state.cur_list.next();
            if next.is_none() {
                if !write {
                    return false;
                }
                let Some(block) = self.alloc_block() else {
                    return false;
                };
                state.cur_list.set_next(block);
                self.write_list(state.cur_list_block, &state.cur_list);
                let prev = state.cur_list_block;
                state.cur_list_block = block;
                state.cur_list.fill_none();
                state.cur_list.set_prev(prev);
                self.write_list(block, &state.cur_list);
                state.cur_slot = 1;
            } else {
                state.cur_list_block = next;
                state.cur_list = self.read_list(next);
                state.cur_slot = 1;
            }
        }

        if state.cur_slot == 0 || state.cur_slot >= len - 1 {
            return false;
        }
        if state.cur_list.slot(state.cur_slot).is_none() {
            if !write {
                return false;
            }
            let Some(block) = self.alloc_block() else {
                return false;
            };
            state.cur_list.set_slot(state.cur_slot, block);
            self.write_list(state.cur_list_block, &state.cur_list);
        }
        true
    }

    /// Steps the cursor one block backward or forward and touches the new
    /// position, adjusting the absolute offset on success.
    fn switch_cur_block(&mut self, state: &mut FileState, backward: bool, write: bool) -> bool {
        self.log(format_args!(
            "[switch_cur_block] backward = {backward}, write = {write}"
        ));
        let len = self.block_list_len();
        let bs = self.block_size() as u64;
        if backward {
            if state.cur_slot > 0 {
                state.cur_slot -= 1;
            }
        } else if state.cur_slot < len {
            state.cur_slot += 1;
        }
        let result = self.touch_cur_block(state, write);
        if result {
            if backward {
                if state.cur_global >= bs {
                    state.cur_global -= bs;
                }
            } else {
                state.cur_global += bs;
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::MemDisk;
    use crate::layout::NodeFlags;

    const README: &[u8] = b"This is first file on your ListFS!\n";

    fn volume() -> ListFs<MemDisk> {
        let mut fs = ListFs::init(MemDisk::new()).with_clock(|| 1700000000);
        fs.create(4096, 512, &[]);
        fs
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn readme_scenario() {
        let mut fs = volume();
        let node = fs
            .create_node("README", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        assert_eq!(node, BlockIndex::new(2));
        assert_eq!({ fs.superblock().root_dir }, node);

        let file = fs.open_file(node).unwrap();
        assert_eq!(fs.file_write(&file, README), README.len());
        assert_eq!(file.size(), 35);
        assert_eq!({ fs.superblock().used_blocks }, 5);

        // The header points at a single page holding a single data block
        let header = fs.fetch_node(node).unwrap();
        assert_eq!({ header.size }, 35);
        assert_eq!({ header.data }, BlockIndex::new(3));
        let list = fs.fetch_list(BlockIndex::new(3)).unwrap();
        assert!(list.prev().is_none());
        assert!(list.next().is_none());
        assert_eq!(list.slot(1), BlockIndex::new(4));
        assert!(list.slot(2).is_none());

        // A read larger than the file clamps to its size
        fs.file_seek(&file, 0, false);
        let mut buf = [0u8; 100];
        assert_eq!(fs.file_read(&file, &mut buf), 35);
        assert_eq!(&buf[..35], README);
        fs.close_file(file);
    }

    #[test]
    fn delete_refuses_file_with_content() {
        let mut fs = volume();
        let node = fs
            .create_node("README", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();
        fs.file_write(&file, README);
        fs.close_file(file);

        let used = { fs.superblock().used_blocks };
        assert!(matches!(fs.delete_node(node), Err(Error::NotEmpty)));
        assert_eq!({ fs.superblock().used_blocks }, used);
    }

    #[test]
    fn truncate_to_zero_then_delete() {
        let mut fs = volume();
        let node = fs
            .create_node("README", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();
        fs.file_write(&file, README);

        fs.file_seek(&file, 0, true);
        fs.file_truncate(&file);
        let header = fs.fetch_node(node).unwrap();
        assert!(header.data.is_none());
        assert_eq!({ header.size }, 0);
        assert_eq!({ fs.superblock().used_blocks }, 3);
        fs.close_file(file);

        fs.delete_node(node).unwrap();
        assert_eq!({ fs.superblock().used_blocks }, 2);
        assert!(fs.superblock().root_dir.is_none());
        assert_eq!(fs.map_popcount(), 2);
    }

    #[test]
    fn truncate_mid_file_keeps_prefix() {
        let mut fs = volume();
        let node = fs
            .create_node("f", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();
        let data = pattern(2000);
        assert_eq!(fs.file_write(&file, &data), 2000);
        let used = { fs.superblock().used_blocks };

        fs.file_seek(&file, 1000, false);
        fs.file_truncate(&file);

        // 2000 bytes spanned four data blocks; the cut at 1000 keeps two
        let header = fs.fetch_node(node).unwrap();
        assert_eq!({ header.size }, 1000);
        assert_eq!({ fs.superblock().used_blocks }, used - 2);
        let list = fs.fetch_list({ header.data }).unwrap();
        assert!(list.slot(1).is_some());
        assert!(list.slot(2).is_some());
        assert!(list.slot(3).is_none());
        assert!(list.slot(4).is_none());

        fs.file_seek(&file, 0, false);
        let mut buf = vec![0u8; 2000];
        assert_eq!(fs.file_read(&file, &mut buf), 1000);
        assert_eq!(&buf[..1000], &data[..1000]);
        fs.close_file(file);
    }

    #[test]
    fn write_crosses_page_boundary() {
        let mut fs = volume();
        let node = fs
            .create_node("big", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();

        // One page records 62 data blocks (31744 bytes); this write needs
        // a second page
        let data = pattern(40000);
        assert_eq!(fs.file_write(&file, &data), 40000);

        let header = fs.fetch_node(node).unwrap();
        assert_eq!({ header.size }, 40000);
        let head = { header.data };
        let first = fs.fetch_list(head).unwrap();
        assert!(first.prev().is_none());
        assert_eq!(first.data_blocks().count(), 62);
        let second_block = first.next();
        assert!(second_block.is_some());
        let second = fs.fetch_list(second_block).unwrap();
        assert_eq!(second.prev(), head);
        assert!(second.next().is_none());
        assert_eq!(second.data_blocks().count(), 17);

        fs.file_seek(&file, 0, false);
        let mut buf = vec![0u8; 40000];
        assert_eq!(fs.file_read(&file, &mut buf), 40000);
        assert_eq!(buf, data);

        // A read at the page boundary comes entirely out of the second
        // page's first data block
        fs.file_seek(&file, 31744, false);
        let mut tail = [0u8; 256];
        assert_eq!(fs.file_read(&file, &mut tail), 256);
        assert_eq!(&tail[..], &data[31744..32000]);
        fs.close_file(file);
    }

    #[test]
    fn open_coalesces_handles() {
        let mut fs = volume();
        let node = fs
            .create_node("shared", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();

        let a = fs.open_file(node).unwrap();
        let b = fs.open_file(node).unwrap();
        assert_eq!(fs.files.len(), 1);

        // The cursor is shared: a write through one handle moves it for
        // the other
        fs.file_write(&a, b"abc");
        assert_eq!(b.position(), 3);
        let mut buf = [0u8; 3];
        assert_eq!(fs.file_read(&b, &mut buf), 0);
        fs.file_seek(&b, 0, false);
        assert_eq!(fs.file_read(&a, &mut buf), 3);
        assert_eq!(&buf, b"abc");

        fs.close_file(a);
        assert_eq!(fs.files.len(), 1);
        fs.close_file(b);
        assert_eq!(fs.files.len(), 0);
    }

    #[test]
    fn open_rejects_non_files() {
        let mut fs = volume();
        assert!(matches!(
            fs.open_file(BlockIndex::NONE),
            Err(Error::NonePath)
        ));

        let dir = fs
            .create_node("d", NodeFlags::DIRECTORY, BlockIndex::NONE)
            .unwrap();
        assert!(matches!(fs.open_file(dir), Err(Error::NotAFile)));
        assert_eq!(fs.files.len(), 0);

        // A block that holds no node header has the wrong magic
        let file = fs
            .create_node("f", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let handle = fs.open_file(file).unwrap();
        fs.file_write(&handle, b"x");
        let header = fs.fetch_node(file).unwrap();
        let data_page = { header.data };
        assert!(matches!(fs.open_file(data_page), Err(Error::NotAFile)));
        fs.close_file(handle);
    }

    #[test]
    fn seek_past_end_extends_size() {
        let mut fs = volume();
        let node = fs
            .create_node("sparse", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();

        fs.file_seek(&file, 1000, true);
        assert_eq!(file.size(), 1000);

        // The first block position was skipped over, not materialized;
        // reading from the start stops at the hole
        fs.file_seek(&file, 0, false);
        let mut buf = [0u8; 16];
        assert_eq!(fs.file_read(&file, &mut buf), 0);
        fs.close_file(file);
    }

    #[test]
    fn write_returns_partial_count_when_full() {
        let mut fs = ListFs::init(MemDisk::new()).with_clock(|| 0);
        // 8 blocks: superblock, bitmap, node, page and 4 data blocks
        fs.create(8, 512, &[]);
        let node = fs
            .create_node("f", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();

        let data = pattern(3000);
        assert_eq!(fs.file_write(&file, &data), 2048);
        assert_eq!(file.size(), 2048);
        assert_eq!({ fs.superblock().used_blocks }, 8);
        assert_eq!(fs.map_popcount(), 8);

        // Everything that was reported written is readable
        fs.file_seek(&file, 0, false);
        let mut buf = vec![0u8; 3000];
        assert_eq!(fs.file_read(&file, &mut buf), 2048);
        assert_eq!(&buf[..2048], &data[..2048]);
        fs.close_file(file);
    }

    #[test]
    fn overwrite_preserves_rest_of_block() {
        let mut fs = volume();
        let node = fs
            .create_node("f", NodeFlags::empty(), BlockIndex::NONE)
            .unwrap();
        let file = fs.open_file(node).unwrap();
        let data = pattern(600);
        fs.file_write(&file, &data);

        fs.file_seek(&file, 100, true);
        fs.file_write(&file, b"XYZ");
        assert_eq!(file.size(), 600);

        fs.file_seek(&file, 0, false);
        let mut buf = vec![0u8; 600];
        assert_eq!(fs.file_read(&file, &mut buf), 600);
        assert_eq!(&buf[..100], &data[..100]);
        assert_eq!(&buf[100..103], b"XYZ");
        assert_eq!(&buf[103..], &data[103..]);
        fs.close_file(file);
    }
}
