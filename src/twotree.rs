//! Best-fit free-region index backed by twin AVL trees.
//!
//! Enabled by the `twotree` feature in place of the default treap variant;
//! the exported [`FreeIndex`] contract is identical. One AVL tree orders the
//! free intervals by `(size, start)` so a best-fit lookup is a plain lower
//! bound; the other orders by `start` for constant-direction adjacency
//! lookups when coalescing. Every node carries both sets of links, so one
//! interval occupies exactly one arena slot.

/// Sentinel for an absent arena link.
const NIL: u32 = u32::MAX;

const SIZE_TREE: usize = 0;
const OFFSET_TREE: usize = 1;

#[derive(Debug, Clone, Copy)]
struct Link {
    left: u32,
    right: u32,
    height: i32,
}

const LEAF: Link = Link {
    left: NIL,
    right: NIL,
    height: 1,
};

#[derive(Debug, Clone, Copy)]
struct Node {
    start: usize,
    end: usize,
    links: [Link; 2],
}

/// Best-fit index over the free intervals of a `[0, size)` byte range.
///
/// Invariants maintained after every public operation:
///
/// - free intervals are pairwise disjoint and never adjacent
/// - [`free_size`](Self::free_size) plus all outstanding allocations equals
///   [`size`](Self::size)
/// - [`allocate`](Self::allocate) returns `None` exactly when no free
///   interval is large enough
///
/// The index itself never touches memory; it only hands out offsets.
/// [`Region`](crate::Region) pairs it with an actual byte slab.
pub struct FreeIndex {
    nodes: Vec<Node>,
    roots: [u32; 2],
    /// Detached nodes, chained through their size-tree `left` link.
    spare: u32,
    size: usize,
    free_total: usize,
}

impl FreeIndex {
    /// Creates an index with one free interval covering `[0, size)`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let mut index = Self {
            nodes: Vec::new(),
            roots: [NIL; 2],
            spare: NIL,
            size: 0,
            free_total: 0,
        };
        index.init(size);
        index
    }

    /// Resets the index to a single free interval `[0, size)`.
    pub fn init(&mut self, size: usize) {
        if self.roots[OFFSET_TREE] != NIL {
            self.recycle();
        }
        self.size = size;
        self.free_total = size;
        if size > 0 {
            let id = self.alloc_node(0, size);
            self.insert(id);
        }
    }

    /// Total byte range managed by the index.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Sum of all free intervals.
    #[must_use]
    pub const fn free_size(&self) -> usize {
        self.free_total
    }

    /// Reserves `n` bytes and returns the chosen offset.
    ///
    /// Selection is best-fit: the smallest free interval of size at least
    /// `n` wins, with ties broken by the smallest start offset. A larger
    /// interval is split and its remainder stays indexed.
    ///
    /// Returns `None` when no interval is large enough, or when `n == 0`.
    pub fn allocate(&mut self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let id = self.best(n);
        if id == NIL {
            return None;
        }
        let offset = self.nodes[id as usize].start;
        self.remove(id);
        if self.nodes[id as usize].end - offset == n {
            self.release_node(id);
        } else {
            self.nodes[id as usize].start = offset + n;
            self.insert(id);
        }
        self.free_total -= n;
        Some(offset)
    }

    /// Like [`allocate`](Self::allocate) but without reserving anything.
    ///
    /// The returned offset is only meaningful until the next mutation.
    #[must_use]
    pub fn find(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let id = self.best(n);
        if id == NIL {
            None
        } else {
            Some(self.nodes[id as usize].start)
        }
    }

    /// Returns `[offset, offset + n)` to the free pool, merging with an
    /// adjacent free interval on either side.
    ///
    /// Returns `false` without mutating anything when the interval exceeds
    /// the managed range. Freeing bytes that are already free is a caller
    /// contract violation; debug builds assert against it.
    pub fn free(&mut self, offset: usize, n: usize) -> bool {
        let Some(end) = offset.checked_add(n) else {
            return false;
        };
        if end > self.size {
            return false;
        }
        if n == 0 {
            return true;
        }
        #[cfg(debug_assertions)]
        self.assert_disjoint(offset, end);

        let left = self.left_adjacent(offset);
        let right = self.right_adjacent(end);
        match (left != NIL, right != NIL) {
            (true, true) => {
                self.remove(right);
                self.remove_in_tree(SIZE_TREE, left);
                self.nodes[left as usize].end = self.nodes[right as usize].end;
                self.insert_in_tree(SIZE_TREE, left);
                self.release_node(right);
            }
            (true, false) => {
                // The start offset is unchanged, so only the size tree
                // needs reindexing.
                self.remove_in_tree(SIZE_TREE, left);
                self.nodes[left as usize].end = end;
                self.insert_in_tree(SIZE_TREE, left);
            }
            (false, true) => {
                self.remove(right);
                self.nodes[right as usize].start = offset;
                self.insert(right);
            }
            (false, false) => {
                let id = self.alloc_node(offset, end);
                self.insert(id);
            }
        }
        self.free_total += n;
        true
    }

    /// All free intervals as `(start, end)` pairs in offset order.
    #[must_use]
    pub fn blocks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        self.walk(self.roots[OFFSET_TREE], &mut |start, end| {
            out.push((start, end));
        });
        out
    }

    /// Detaches every node onto the internal free-list and empties both
    /// trees.
    pub fn recycle(&mut self) {
        let mut ids = Vec::new();
        self.collect(self.roots[OFFSET_TREE], &mut ids);
        for id in ids {
            self.release_node(id);
        }
        self.roots = [NIL; 2];
        self.free_total = 0;
    }

    fn len_of(&self, id: u32) -> usize {
        let node = &self.nodes[id as usize];
        node.end - node.start
    }

    /// Strict key ordering for one of the trees. Keys are unique: the size
    /// tree falls back to the start offset, and start offsets never repeat.
    fn before(&self, tree: usize, a: u32, b: u32) -> bool {
        let (na, nb) = (&self.nodes[a as usize], &self.nodes[b as usize]);
        if tree == SIZE_TREE {
            let (sa, sb) = (na.end - na.start, nb.end - nb.start);
            if sa != sb {
                return sa < sb;
            }
        }
        na.start < nb.start
    }

    fn alloc_node(&mut self, start: usize, end: usize) -> u32 {
        if self.spare == NIL {
            self.nodes.push(Node {
                start,
                end,
                links: [LEAF; 2],
            });
            u32::try_from(self.nodes.len() - 1).expect("node arena overflow")
        } else {
            let id = self.spare;
            let node = &mut self.nodes[id as usize];
            self.spare = node.links[SIZE_TREE].left;
            node.start = start;
            node.end = end;
            node.links = [LEAF; 2];
            id
        }
    }

    fn release_node(&mut self, id: u32) {
        let node = &mut self.nodes[id as usize];
        node.links = [LEAF; 2];
        node.links[SIZE_TREE].left = self.spare;
        self.spare = id;
    }

    fn insert(&mut self, id: u32) {
        self.insert_in_tree(SIZE_TREE, id);
        self.insert_in_tree(OFFSET_TREE, id);
    }

    fn remove(&mut self, id: u32) {
        self.remove_in_tree(SIZE_TREE, id);
        self.remove_in_tree(OFFSET_TREE, id);
    }

    fn insert_in_tree(&mut self, tree: usize, id: u32) {
        self.nodes[id as usize].links[tree] = LEAF;
        self.roots[tree] = self.insert_at(tree, self.roots[tree], id);
    }

    fn remove_in_tree(&mut self, tree: usize, id: u32) {
        self.roots[tree] = self.remove_at(tree, self.roots[tree], id);
    }

    fn height(&self, tree: usize, id: u32) -> i32 {
        if id == NIL {
            0
        } else {
            self.nodes[id as usize].links[tree].height
        }
    }

    fn update_height(&mut self, tree: usize, id: u32) {
        let link = self.nodes[id as usize].links[tree];
        let h = 1 + self.height(tree, link.left).max(self.height(tree, link.right));
        self.nodes[id as usize].links[tree].height = h;
    }

    fn rotate_left(&mut self, tree: usize, id: u32) -> u32 {
        let top = self.nodes[id as usize].links[tree].right;
        self.nodes[id as usize].links[tree].right = self.nodes[top as usize].links[tree].left;
        self.nodes[top as usize].links[tree].left = id;
        self.update_height(tree, id);
        self.update_height(tree, top);
        top
    }

    fn rotate_right(&mut self, tree: usize, id: u32) -> u32 {
        let top = self.nodes[id as usize].links[tree].left;
        self.nodes[id as usize].links[tree].left = self.nodes[top as usize].links[tree].right;
        self.nodes[top as usize].links[tree].right = id;
        self.update_height(tree, id);
        self.update_height(tree, top);
        top
    }

    fn rebalance(&mut self, tree: usize, id: u32) -> u32 {
        self.update_height(tree, id);
        let link = self.nodes[id as usize].links[tree];
        let balance = self.height(tree, link.left) - self.height(tree, link.right);
        if balance > 1 {
            let left = link.left;
            let left_link = self.nodes[left as usize].links[tree];
            if self.height(tree, left_link.right) > self.height(tree, left_link.left) {
                let rotated = self.rotate_left(tree, left);
                self.nodes[id as usize].links[tree].left = rotated;
            }
            return self.rotate_right(tree, id);
        }
        if balance < -1 {
            let right = link.right;
            let right_link = self.nodes[right as usize].links[tree];
            if self.height(tree, right_link.left) > self.height(tree, right_link.right) {
                let rotated = self.rotate_right(tree, right);
                self.nodes[id as usize].links[tree].right = rotated;
            }
            return self.rotate_left(tree, id);
        }
        id
    }

    fn insert_at(&mut self, tree: usize, node: u32, id: u32) -> u32 {
        if node == NIL {
            return id;
        }
        if self.before(tree, id, node) {
            let child = self.insert_at(tree, self.nodes[node as usize].links[tree].left, id);
            self.nodes[node as usize].links[tree].left = child;
        } else {
            let child = self.insert_at(tree, self.nodes[node as usize].links[tree].right, id);
            self.nodes[node as usize].links[tree].right = child;
        }
        self.rebalance(tree, node)
    }

    fn remove_at(&mut self, tree: usize, node: u32, target: u32) -> u32 {
        if node == NIL {
            return NIL;
        }
        if node == target {
            let link = self.nodes[node as usize].links[tree];
            if link.left == NIL {
                return link.right;
            }
            if link.right == NIL {
                return link.left;
            }
            let succ = self.min_in(tree, link.right);
            let right = self.remove_at(tree, link.right, succ);
            self.nodes[succ as usize].links[tree].left = link.left;
            self.nodes[succ as usize].links[tree].right = right;
            return self.rebalance(tree, succ);
        }
        if self.before(tree, target, node) {
            let child = self.remove_at(tree, self.nodes[node as usize].links[tree].left, target);
            self.nodes[node as usize].links[tree].left = child;
        } else {
            let child = self.remove_at(tree, self.nodes[node as usize].links[tree].right, target);
            self.nodes[node as usize].links[tree].right = child;
        }
        self.rebalance(tree, node)
    }

    fn min_in(&self, tree: usize, node: u32) -> u32 {
        let mut cur = node;
        loop {
            let left = self.nodes[cur as usize].links[tree].left;
            if left == NIL {
                return cur;
            }
            cur = left;
        }
    }

    /// Lower bound in the size tree: the smallest `(size, start)` key whose
    /// size is at least `want`.
    fn best(&self, want: usize) -> u32 {
        let mut cur = self.roots[SIZE_TREE];
        let mut candidate = NIL;
        while cur != NIL {
            if self.len_of(cur) >= want {
                candidate = cur;
                cur = self.nodes[cur as usize].links[SIZE_TREE].left;
            } else {
                cur = self.nodes[cur as usize].links[SIZE_TREE].right;
            }
        }
        candidate
    }

    /// Locates the free interval ending exactly at `offset`, if any.
    ///
    /// Intervals are disjoint and non-adjacent, so ordering by end matches
    /// the offset tree's ordering by start.
    fn left_adjacent(&self, offset: usize) -> u32 {
        let mut cur = self.roots[OFFSET_TREE];
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if node.end == offset {
                return cur;
            }
            cur = if node.end > offset {
                node.links[OFFSET_TREE].left
            } else {
                node.links[OFFSET_TREE].right
            };
        }
        NIL
    }

    /// Locates the free interval starting exactly at `offset`, if any.
    fn right_adjacent(&self, offset: usize) -> u32 {
        let mut cur = self.roots[OFFSET_TREE];
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if node.start == offset {
                return cur;
            }
            cur = if node.start < offset {
                node.links[OFFSET_TREE].right
            } else {
                node.links[OFFSET_TREE].left
            };
        }
        NIL
    }

    fn walk(&self, node: u32, f: &mut impl FnMut(usize, usize)) {
        if node == NIL {
            return;
        }
        self.walk(self.nodes[node as usize].links[OFFSET_TREE].left, f);
        f(self.nodes[node as usize].start, self.nodes[node as usize].end);
        self.walk(self.nodes[node as usize].links[OFFSET_TREE].right, f);
    }

    fn collect(&self, node: u32, out: &mut Vec<u32>) {
        if node == NIL {
            return;
        }
        self.collect(self.nodes[node as usize].links[OFFSET_TREE].left, out);
        out.push(node);
        self.collect(self.nodes[node as usize].links[OFFSET_TREE].right, out);
    }

    #[cfg(debug_assertions)]
    fn assert_disjoint(&self, start: usize, end: usize) {
        self.walk(self.roots[OFFSET_TREE], &mut |s, e| {
            debug_assert!(
                end <= s || e <= start,
                "free of [{start}, {end}) overlaps free interval [{s}, {e})"
            );
        });
    }
}

impl std::fmt::Debug for FreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeIndex")
            .field("size", &self.size)
            .field("free_size", &self.free_total)
            .field("blocks", &self.blocks())
            .finish()
    }
}
