//! The node store.
//!
//! A node is one block holding a [`NodeHeader`]; the block index is the
//! node's identity. Children of a directory form a doubly-linked sibling
//! list; the parent's data field (or the superblock's root pointer for
//! top-level nodes) designates the head of the list. Insertion always
//! happens at the head, so a freshly created node is its parent's first
//! child.

use crate::device::BlockDevice;
use crate::layout::pack_name;
use crate::layout::BlockIndex;
use crate::layout::NodeFlags;
use crate::layout::NodeHeader;
use crate::volume::ListFs;
use crate::Error;

impl<D: BlockDevice> ListFs<D> {
    /// Creates a node under `parent` (or at the top level when `parent` is
    /// none) and returns its block index.
    ///
    /// The name is truncated to the on-disk field size. The node starts
    /// with no data and is inserted at the head of its sibling list.
    pub fn create_node(
        &mut self,
        name: &str,
        flags: NodeFlags,
        parent: BlockIndex,
    ) -> Result<BlockIndex, Error> {
        self.log(format_args!(
            "[create_node] name = '{name}', flags = {flags:?}, parent = {parent}"
        ));
        let node = self.alloc_block().ok_or(Error::NoSpace)?;
        let header = NodeHeader::new(name, flags, self.now());
        self.write_node_header(node, &header);
        self.insert_node(node, parent);
        Ok(node)
    }

    /// Splices `node` in at the head of `parent`'s child list, updating the
    /// former head's back link.
    pub(crate) fn insert_node(&mut self, node: BlockIndex, parent: BlockIndex) {
        if node.is_none() {
            return;
        }
        self.log(format_args!(
            "[insert_node] node = {node}, parent = {parent}"
        ));
        let mut header = self.read_node_header(node);
        header.parent = parent;
        header.prev = BlockIndex::NONE;
        if parent.is_none() {
            header.next = self.root_dir();
            self.set_root_dir(node);
        } else {
            let mut parent_header = self.read_node_header(parent);
            header.next = parent_header.data;
            parent_header.data = node;
            self.write_node_header(parent, &parent_header);
        }
        let next = header.next;
        if next.is_some() {
            let mut next_header = self.read_node_header(next);
            next_header.prev = node;
            self.write_node_header(next, &next_header);
        }
        self.write_node_header(node, &header);
    }

    /// Splices `node` out of its sibling list. The node's own links are
    /// left stale and its storage is not freed.
    pub(crate) fn remove_node(&mut self, node: BlockIndex) {
        if node.is_none() {
            return;
        }
        self.log(format_args!("[remove_node] node = {node}"));
        let header = self.read_node_header(node);
        let next = header.next;
        let prev = header.prev;
        let parent = header.parent;
        if next.is_some() {
            let mut next_header = self.read_node_header(next);
            next_header.prev = prev;
            self.write_node_header(next, &next_header);
        }
        if prev.is_some() {
            let mut prev_header = self.read_node_header(prev);
            prev_header.next = next;
            self.write_node_header(prev, &prev_header);
        } else if parent.is_some() {
            let mut parent_header = self.read_node_header(parent);
            parent_header.data = next;
            self.write_node_header(parent, &parent_header);
        } else {
            self.set_root_dir(next);
        }
    }

    /// Deletes a node that owns no data: a truncated-to-zero file or an
    /// empty directory. Refuses with [`Error::NotEmpty`] otherwise.
    pub fn delete_node(&mut self, node: BlockIndex) -> Result<(), Error> {
        if node.is_none() {
            return Err(Error::NonePath);
        }
        self.log(format_args!("[delete_node] node = {node}"));
        let header = self.read_node_header(node);
        if header.data.is_some() {
            self.log(format_args!("[delete_node] node has data!"));
            return Err(Error::NotEmpty);
        }
        self.remove_node(node);
        self.mark_free(node, 1);
        Ok(())
    }

    /// Moves a node under a new parent (or to the top level).
    ///
    /// No descendant check is performed: moving a directory into its own
    /// subtree creates a cycle, and avoiding that is the caller's job.
    pub fn move_node(&mut self, node: BlockIndex, new_parent: BlockIndex) {
        if node.is_none() {
            return;
        }
        self.log(format_args!(
            "[move_node] node = {node}, new_parent = {new_parent}"
        ));
        self.remove_node(node);
        self.insert_node(node, new_parent);
    }

    /// Rewrites a node's name.
    pub fn rename_node(&mut self, node: BlockIndex, name: &str) {
        if node.is_none() {
            return;
        }
        self.log(format_args!("[rename_node] node = {node}, name = '{name}'"));
        let mut header = self.read_node_header(node);
        header.name = pack_name(name.as_bytes());
        self.write_node_header(node, &header);
    }

    /// Reads a copy of a node's header.
    pub fn fetch_node(&mut self, node: BlockIndex) -> Option<NodeHeader> {
        if node.is_none() {
            return None;
        }
        self.log(format_args!("[fetch_node] node = {node}"));
        Some(self.read_node_header(node))
    }

    /// Iterates a sibling list starting at `first`, yielding each node's
    /// index and header. Stopping early is just not pulling further.
    pub fn nodes(&mut self, first: BlockIndex) -> Nodes<'_, D> {
        Nodes {
            fs: self,
            cur: first,
        }
    }

    /// Iterates the children of `parent`, or the top-level nodes when
    /// `parent` is none. A file has no children.
    pub fn children(&mut self, parent: BlockIndex) -> Nodes<'_, D> {
        let first = if parent.is_none() {
            self.root_dir()
        } else {
            let header = self.read_node_header(parent);
            if header.is_directory() {
                header.data
            } else {
                BlockIndex::NONE
            }
        };
        self.nodes(first)
    }

    /// Resolves a `/`-separated path among the siblings rooted at `first`,
    /// descending into directories segment by segment.
    ///
    /// Name matching compares the packed 256-byte form. A trailing slash
    /// resolves to the node matched so far; a path that descends into a
    /// file resolves to nothing.
    pub fn search_node(&mut self, path: &str, first: BlockIndex) -> Option<BlockIndex> {
        self.log(format_args!(
            "[search_node] path = '{path}', first = {first}"
        ));
        let mut first = first;
        let mut path = path;
        loop {
            let (segment, rest) = match path.split_once('/') {
                Some((segment, rest)) => (segment, Some(rest)),
                None => (path, None),
            };
            let target = pack_name(segment.as_bytes());

            let mut found = None;
            for (node, header) in self.nodes(first) {
                let name = header.name;
                if name == target {
                    found = Some((node, header));
                    break;
                }
            }
            let Some((node, header)) = found else {
                self.log(format_args!("[search_node] node '{segment}' not found"));
                return None;
            };

            match rest {
                None | Some("") => {
                    self.log(format_args!("[search_node] found node {node}"));
                    return Some(node);
                }
                Some(rest) if header.is_directory() => {
                    first = header.data;
                    path = rest;
                }
                Some(_) => {
                    self.log(format_args!(
                        "[search_node] '{segment}' is not a directory"
                    ));
                    return None;
                }
            }
        }
    }
}

/// Pull-style iterator over a sibling list.
pub struct Nodes<'a, D: BlockDevice> {
    fs: &'a mut ListFs<D>,
    cur: BlockIndex,
}

impl<D: BlockDevice> Iterator for Nodes<'_, D> {
    type Item = (BlockIndex, NodeHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_none() {
            return None;
        }
        let node = self.cur;
        let header = self.fs.read_node_header(node);
        self.cur = header.next;
        Some((node, header))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::MemDisk;

    fn volume() -> ListFs<MemDisk> {
        let mut fs = ListFs::init(MemDisk::new()).with_clock(|| 1700000000);
        fs.create(4096, 512, &[]);
        fs
    }

    fn dir() -> NodeFlags {
        NodeFlags::DIRECTORY
    }

    #[test]
    fn create_inserts_at_head() {
        let mut fs = volume();
        let a = fs.create_node("a", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        let b = fs.create_node("b", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        let c = fs.create_node("c", NodeFlags::empty(), BlockIndex::NONE).unwrap();

        assert_eq!({ fs.superblock().root_dir }, c);
        let names: Vec<String> = fs
            .nodes(c)
            .map(|(_, header)| header.name())
            .collect();
        assert_eq!(names, ["c", "b", "a"]);

        // Sibling links are reciprocal
        let hc = fs.fetch_node(c).unwrap();
        let hb = fs.fetch_node(b).unwrap();
        let ha = fs.fetch_node(a).unwrap();
        assert!(hc.prev.is_none());
        assert_eq!({ hc.next }, b);
        assert_eq!({ hb.prev }, c);
        assert_eq!({ hb.next }, a);
        assert_eq!({ ha.prev }, b);
        assert!(ha.next.is_none());
        assert_eq!({ ha.create_time }, 1700000000);
    }

    #[test]
    fn create_in_directory_updates_parent() {
        let mut fs = volume();
        let d = fs.create_node("d", dir(), BlockIndex::NONE).unwrap();
        let f = fs.create_node("f", NodeFlags::empty(), d).unwrap();

        let hd = fs.fetch_node(d).unwrap();
        assert_eq!({ hd.data }, f);
        let hf = fs.fetch_node(f).unwrap();
        assert_eq!({ hf.parent }, d);

        let children: Vec<BlockIndex> = fs.children(d).map(|(node, _)| node).collect();
        assert_eq!(children, [f]);
    }

    #[test]
    fn remove_splices_middle_node() {
        let mut fs = volume();
        let a = fs.create_node("a", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        let b = fs.create_node("b", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        let c = fs.create_node("c", NodeFlags::empty(), BlockIndex::NONE).unwrap();

        // List is c -> b -> a; delete the middle node
        fs.delete_node(b).unwrap();
        let hc = fs.fetch_node(c).unwrap();
        let ha = fs.fetch_node(a).unwrap();
        assert_eq!({ hc.next }, a);
        assert_eq!({ ha.prev }, c);
        assert_eq!({ fs.superblock().root_dir }, c);
    }

    #[test]
    fn delete_head_moves_root() {
        let mut fs = volume();
        let a = fs.create_node("a", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        let b = fs.create_node("b", NodeFlags::empty(), BlockIndex::NONE).unwrap();

        let used = { fs.superblock().used_blocks };
        fs.delete_node(b).unwrap();
        assert_eq!({ fs.superblock().root_dir }, a);
        assert!(fs.fetch_node(a).unwrap().prev.is_none());
        assert_eq!({ fs.superblock().used_blocks }, used - 1);
        assert_eq!(fs.map_popcount(), used - 1);
    }

    #[test]
    fn delete_refuses_node_with_data() {
        let mut fs = volume();
        let d = fs.create_node("d", dir(), BlockIndex::NONE).unwrap();
        fs.create_node("f", NodeFlags::empty(), d).unwrap();

        let used = { fs.superblock().used_blocks };
        assert!(matches!(fs.delete_node(d), Err(Error::NotEmpty)));
        assert_eq!({ fs.superblock().used_blocks }, used);

        assert!(matches!(
            fs.delete_node(BlockIndex::NONE),
            Err(Error::NonePath)
        ));
    }

    #[test]
    fn move_node_reparents() {
        let mut fs = volume();
        let d = fs.create_node("d", dir(), BlockIndex::NONE).unwrap();
        let f = fs.create_node("f", NodeFlags::empty(), BlockIndex::NONE).unwrap();

        fs.move_node(f, d);
        assert_eq!({ fs.superblock().root_dir }, d);
        let hf = fs.fetch_node(f).unwrap();
        assert_eq!({ hf.parent }, d);
        let children: Vec<BlockIndex> = fs.children(d).map(|(node, _)| node).collect();
        assert_eq!(children, [f]);
    }

    #[test]
    fn rename_search_round_trip() {
        let mut fs = volume();
        let f = fs.create_node("old", NodeFlags::empty(), BlockIndex::NONE).unwrap();

        let root = fs.superblock().root_dir;
        assert_eq!(fs.search_node("old", root), Some(f));

        fs.rename_node(f, "new");
        let root = fs.superblock().root_dir;
        assert_eq!(fs.search_node("old", root), None);
        assert_eq!(fs.search_node("new", root), Some(f));
    }

    #[test]
    fn search_walks_paths() {
        let mut fs = volume();
        let a = fs.create_node("a", dir(), BlockIndex::NONE).unwrap();
        let b = fs.create_node("b", dir(), a).unwrap();
        let c = fs.create_node("c", NodeFlags::empty(), b).unwrap();

        let root = fs.superblock().root_dir;
        assert_eq!(fs.search_node("a/b/c", root), Some(c));
        assert_eq!(fs.search_node("a/b", root), Some(b));
        assert_eq!(fs.search_node("a/b/", root), Some(b));
        assert_eq!(fs.search_node("a/c", root), None);
        // c is not a directory, so the path cannot descend through it
        assert_eq!(fs.search_node("a/b/c/x", root), None);
    }

    #[test]
    fn search_compares_packed_names() {
        let mut fs = volume();
        let long = "x".repeat(300);
        let f = fs.create_node(&long, NodeFlags::empty(), BlockIndex::NONE).unwrap();

        // Both names exceed the field and collapse to the same 256 bytes
        let root = fs.superblock().root_dir;
        let other = "x".repeat(256);
        assert_eq!(fs.search_node(&other, root), Some(f));
        assert_eq!(fs.search_node("x", root), None);
    }

    #[test]
    fn children_of_file_is_empty() {
        let mut fs = volume();
        let f = fs.create_node("f", NodeFlags::empty(), BlockIndex::NONE).unwrap();
        assert_eq!(fs.children(f).count(), 0);
    }
}
