//! Per-record bump arena for copied argument payloads.
//!
//! Update-buffer data, push-constant bytes and label strings are copied out
//! of the application's call into the arena of the record being built. The
//! arena hands out plain offsets instead of references, so the record can own
//! the arena and the commands that point into it side by side. Everything is
//! released at once when the record drops.

const PAGE_MIN_SIZE: usize = 256;
const PAGE_MAX_SIZE: usize = 64 * 1024;

/// Location of a byte range inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArenaSlice {
    page: u32,
    offset: u32,
    len: u32,
}

impl ArenaSlice {
    pub const EMPTY: ArenaSlice = ArenaSlice {
        page: 0,
        offset: 0,
        len: 0,
    };

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A UTF-8 string copied into an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArenaStr(ArenaSlice);

impl ArenaStr {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct Arena {
    pages: Vec<Vec<u8>>,
    next_page_size: usize,
    allocated: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_page_size(PAGE_MIN_SIZE)
    }

    /// Create an arena whose first page holds `page_size` bytes. Later pages
    /// double in size up to a fixed maximum.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            next_page_size: page_size.clamp(PAGE_MIN_SIZE, PAGE_MAX_SIZE),
            allocated: 0,
        }
    }

    /// Copy `data` into the arena.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> ArenaSlice {
        if data.is_empty() {
            return ArenaSlice::EMPTY;
        }

        let fits = self
            .pages
            .last()
            .is_some_and(|page| page.capacity() - page.len() >= data.len());
        if !fits {
            self.new_page(data.len());
        }

        let page_index = self.pages.len() - 1;
        let page = &mut self.pages[page_index];
        let offset = page.len();
        page.extend_from_slice(data);
        self.allocated += data.len();

        ArenaSlice {
            page: page_index as u32,
            offset: offset as u32,
            len: data.len() as u32,
        }
    }

    /// Copy `s` into the arena.
    pub fn alloc_str(&mut self, s: &str) -> ArenaStr {
        ArenaStr(self.alloc_bytes(s.as_bytes()))
    }

    pub fn bytes(&self, slice: ArenaSlice) -> &[u8] {
        if slice.is_empty() {
            return &[];
        }
        let start = slice.offset as usize;
        &self.pages[slice.page as usize][start..start + slice.len as usize]
    }

    pub fn str(&self, s: ArenaStr) -> &str {
        // Only ever filled from a `&str`, so this cannot fail.
        std::str::from_utf8(self.bytes(s.0)).unwrap_or_default()
    }

    /// Total payload bytes handed out so far.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn new_page(&mut self, min_size: usize) {
        // Oversized payloads get a dedicated page and leave the growth
        // schedule alone.
        let size = if min_size > PAGE_MAX_SIZE {
            min_size
        } else {
            let size = self.next_page_size.max(min_size);
            self.next_page_size = (self.next_page_size * 2).min(PAGE_MAX_SIZE);
            size
        };
        self.pages.push(Vec::with_capacity(size));
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("pages", &self.pages.len())
            .field("allocated", &self.allocated)
            .finish()
    }
}
