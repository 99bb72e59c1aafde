//! ListFS: a small list-structured filesystem over a block device.
//!
//! The volume is an array of fixed-size blocks: a superblock at block 0, a
//! bit-packed free-space map, one header block per file or directory, and
//! per-file chains of block-list pages recording the data blocks. Nodes
//! sharing a parent form a doubly-linked sibling list, which makes the
//! whole tree a list of lists.
//!
//! All I/O goes through a caller-supplied [`BlockDevice`] adapter, so a
//! volume can live in a regular file, on a raw device, or in memory. The
//! engine is strictly single-threaded; multiple opens of the same file
//! share one cursor.
//!
//! ```no_run
//! use listfs::{BlockIndex, FileDisk, ListFs, NodeFlags};
//!
//! let file = std::fs::File::options()
//!     .read(true)
//!     .write(true)
//!     .open("volume.img")
//!     .unwrap();
//! let mut fs = ListFs::init(FileDisk::new(file));
//! fs.create(4096, 512, &[]);
//! let node = fs
//!     .create_node("README", NodeFlags::empty(), BlockIndex::NONE)
//!     .unwrap();
//! let handle = fs.open_file(node).unwrap();
//! fs.file_write(&handle, b"hello\n");
//! fs.close_file(handle);
//! fs.close();
//! ```

pub mod bitmap;
pub mod device;
pub mod disk;
pub mod file;
pub mod layout;
pub mod node;
pub mod util;
pub mod volume;

pub use device::BlockDevice;
pub use device::FileDisk;
pub use device::MemDisk;
pub use file::OpenFile;
pub use layout::BlockIndex;
pub use layout::BlockList;
pub use layout::NodeFlags;
pub use layout::NodeHeader;
pub use layout::Superblock;
pub use node::Nodes;
pub use volume::ListFs;

use std::fmt;

/// Engine failures surfaced to callers.
///
/// I/O errors of the device adapter are deliberately absent: adapters that
/// can fail must retry or abort on their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A referenced index was the "none" sentinel; nothing happened.
    NonePath,
    /// The superblock magic did not match on open.
    NotListFs,
    /// The bitmap has no free block left.
    NoSpace,
    /// Open of a directory, or of a block that holds no node header.
    NotAFile,
    /// Delete of a node that still owns data.
    NotEmpty,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonePath => "no such node",
            Self::NotListFs => "bad magic number in superblock",
            Self::NoSpace => "no space left on volume",
            Self::NotAFile => "not a file",
            Self::NotEmpty => "node is not empty",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

impl std::error::Error for Error {}
