//! Chunk store: the preprocessor's output unit.
//!
//! A chunk binds a slice of produced text to its provenance: an optional
//! human-readable origin ("from macro \"X\""), the path of the originating
//! file, the byte offset and 1-based line number within that file. Chunks
//! form circular doubly-linked rings; all appends, duplications and splices
//! are O(1).
//!
//! Rings are represented as an arena of chunks indexed by `ChunkId` with
//! `prev`/`next` indices. Exactly one head handle owns each ring; the links
//! are navigation only.

use std::path::PathBuf;

/// An opaque reference to a chunk in a [`ChunkStore`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ChunkId(u32);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous run of preprocessed bytes with a single provenance.
#[derive(Debug)]
pub struct Chunk {
    /// Explanation of where the text came from when it was not copied
    /// verbatim from a source file. `None` both for plain source text and
    /// for the substitution sentinel chunks of function-like macro
    /// arguments.
    pub origin: Option<String>,
    /// Path of the originating file. Empty for driver-synthesized text.
    pub path: PathBuf,
    /// Byte offset within the originating file.
    pub offset: usize,
    /// 1-based line number within the originating file.
    pub line: u32,
    /// The produced text. May be empty.
    pub content: String,
    /// Head of an included file's sub-ring, set on the last chunk of that
    /// ring when a file inclusion is attached.
    pub first: Option<ChunkId>,
    prev: ChunkId,
    next: ChunkId,
}

/// Arena owning every chunk of a preprocessing session.
#[derive(Default, Debug)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.index()]
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.chunks[id.index()]
    }

    pub fn next(&self, id: ChunkId) -> ChunkId {
        self.chunks[id.index()].next
    }

    pub fn prev(&self, id: ChunkId) -> ChunkId {
        self.chunks[id.index()].prev
    }

    /// The last chunk of a ring, i.e. the head's `prev`.
    pub fn last(&self, head: ChunkId) -> ChunkId {
        self.prev(head)
    }

    /// Allocate a fresh self-linked chunk.
    pub fn alloc(
        &mut self,
        origin: Option<String>,
        path: PathBuf,
        offset: usize,
        line: u32,
        content: String,
    ) -> ChunkId {
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(Chunk {
            origin,
            path,
            offset,
            line,
            content,
            first: None,
            prev: id,
            next: id,
        });
        id
    }

    /// Append a self-linked chunk at the bottom of the ring owned by
    /// `head`, making it the ring's last element.
    pub fn push_back(&mut self, head: &mut Option<ChunkId>, id: ChunkId) {
        debug_assert_eq!(self.next(id), id, "chunk must be self-linked");
        match *head {
            None => *head = Some(id),
            Some(h) => {
                let tail = self.prev(h);
                self.chunks[id.index()].prev = tail;
                self.chunks[id.index()].next = h;
                self.chunks[tail.index()].next = id;
                self.chunks[h.index()].prev = id;
            }
        }
    }

    /// Splice the entire ring headed by `sub` into the ring owned by
    /// `head`, immediately before `head`'s first element (i.e. at the
    /// bottom). If `head` is empty the sub-ring becomes the ring.
    pub fn attach(&mut self, head: &mut Option<ChunkId>, sub: ChunkId) {
        match *head {
            None => *head = Some(sub),
            Some(h) => {
                let tail = self.prev(h);
                let sub_tail = self.prev(sub);
                self.chunks[tail.index()].next = sub;
                self.chunks[sub.index()].prev = tail;
                self.chunks[sub_tail.index()].next = h;
                self.chunks[h.index()].prev = sub_tail;
            }
        }
    }

    /// Duplicate one chunk into a fresh self-linked chunk, provenance
    /// included.
    pub fn duplicate(&mut self, src: ChunkId) -> ChunkId {
        let c = self.chunk(src);
        let (origin, path, offset, line, content) = (
            c.origin.clone(),
            c.path.clone(),
            c.offset,
            c.line,
            c.content.clone(),
        );
        self.alloc(origin, path, offset, line, content)
    }

    /// Collect the ids of a ring in forward order starting at `head`.
    pub fn ring(&self, head: ChunkId) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut id = head;
        loop {
            out.push(id);
            id = self.next(id);
            if id == head {
                break;
            }
        }
        out
    }

    /// Fold a ring into the final source string, recording for each chunk
    /// the offset at which its content starts within the result. The
    /// concatenation of all contents in forward order is the preprocessed
    /// source.
    pub fn concatenate(&self, head: Option<ChunkId>) -> (String, Vec<(usize, ChunkId)>) {
        let mut source = String::new();
        let mut spans = Vec::new();
        if let Some(head) = head {
            for id in self.ring(head) {
                spans.push((source.len(), id));
                source.push_str(&self.chunk(id).content);
            }
        }
        (source, spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(store: &mut ChunkStore, s: &str) -> ChunkId {
        store.alloc(None, PathBuf::new(), 0, 1, s.to_owned())
    }

    #[test]
    fn push_back_keeps_order() {
        let mut store = ChunkStore::new();
        let mut head = None;
        for s in ["a", "b", "c"] {
            let id = text(&mut store, s);
            store.push_back(&mut head, id);
        }
        let (src, spans) = store.concatenate(head);
        assert_eq!(src, "abc");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].0, 1);
    }

    #[test]
    fn attach_splices_before_head() {
        let mut store = ChunkStore::new();
        let mut main = None;
        for s in ["1", "2"] {
            let id = text(&mut store, s);
            store.push_back(&mut main, id);
        }
        let mut sub = None;
        for s in ["x", "y"] {
            let id = text(&mut store, s);
            store.push_back(&mut sub, id);
        }
        // Attaching at the bottom preserves source order.
        store.attach(&mut main, sub.unwrap());
        let (src, _) = store.concatenate(main);
        assert_eq!(src, "12xy");
    }

    #[test]
    fn attach_into_empty_ring() {
        let mut store = ChunkStore::new();
        let mut main = None;
        let mut sub = None;
        let id = text(&mut store, "z");
        store.push_back(&mut sub, id);
        store.attach(&mut main, sub.unwrap());
        let (src, _) = store.concatenate(main);
        assert_eq!(src, "z");
    }

    #[test]
    fn duplicate_copies_provenance() {
        let mut store = ChunkStore::new();
        let id = store.alloc(
            Some("from macro \"M\"".into()),
            PathBuf::from("/p/a.lyc"),
            7,
            3,
            "body".into(),
        );
        let dup = store.duplicate(id);
        assert_ne!(id, dup);
        let d = store.chunk(dup);
        assert_eq!(d.origin.as_deref(), Some("from macro \"M\""));
        assert_eq!(d.offset, 7);
        assert_eq!(d.line, 3);
        assert_eq!(store.next(dup), dup);
    }
}
