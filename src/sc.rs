//! Size class caches: slab allocation for fixed size objects.

use crate::*;

/// An intrusive, offset linked list of free objects inside one slab.
///
/// Allocated objects are opaque; a free object stores the offset of the next
/// free object in its first word. The list terminates with the null offset.
#[repr(C)]
pub(crate) struct ObjectList {
    pub(crate) head: Offset,
    pub(crate) count: usize,
}

/// A list of slabs belonging to one cache, linked through the `next` offset
/// in each slab's header.
#[repr(C)]
pub(crate) struct SlabList {
    pub(crate) head: Offset,
    pub(crate) count: usize,
}

/// Header of a slab: one page partitioned into fixed size object slots.
///
/// Objects are right aligned to the page end, so the slab base can be
/// recovered from any object offset by masking with the page mask.
#[repr(C)]
pub(crate) struct Slab {
    /// Offset of the cache this slab belongs to.
    pub(crate) cache: Offset,
    /// Offset of the slab list currently linking this slab (full, partial or
    /// free). Identifies where to unlink from without searching all three.
    pub(crate) list: Offset,
    /// Offset of the next slab on the same list.
    pub(crate) next: Offset,
    /// Offset where the object slots start.
    pub(crate) objects: Offset,
    pub(crate) free_objects: ObjectList,
}

/// Descriptor of one object size class.
#[repr(C)]
pub(crate) struct Cache {
    pub(crate) name: [u8; 16],
    pub(crate) full_slabs: SlabList,
    pub(crate) partial_slabs: SlabList,
    pub(crate) free_slabs: SlabList,
    /// Object size for the cache.
    pub(crate) object_size: u16,
    /// Boundary to align objects on, always a multiple of 8.
    pub(crate) alignment: u16,
    /// Object size rounded up to the alignment.
    pub(crate) aligned_size: usize,
    /// Number of objects that fit in one slab.
    pub(crate) object_count: usize,
}

const_assert!(mem::size_of::<Slab>() < BASE_PAGE_SIZE);
const_assert!(mem::size_of::<Slab>() % 8 == 0);

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let length = self.name.iter().position(|&byte| byte == 0).unwrap_or(self.name.len());
        f.debug_struct("Cache")
            .field("name", &core::str::from_utf8(&self.name[..length]).unwrap_or("?"))
            .field("object_size", &self.object_size)
            .field("alignment", &self.alignment)
            .field("aligned_size", &self.aligned_size)
            .field("object_count", &self.object_count)
            .finish()
    }
}

/// Fully free slabs a cache keeps around; beyond the reserve, drained slab
/// pages go back to the page pool.
const FREE_SLAB_RESERVE: usize = 1;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Full,
    Partial,
    Free,
}

/// Rounds `size` up to `align`. A zero alignment falls back to 8 bytes and
/// objects smaller than their alignment occupy a full alignment unit.
fn aligned_size(size: usize, align: usize) -> usize {
    let align = if align == 0 { 8 } else { align };
    if align > size {
        return align;
    }
    align * ((size + align - 1) / align)
}

impl Region {
    #[inline(always)]
    pub(crate) fn slab_ptr(&self, slab: Offset) -> *const Slab {
        debug_assert_eq!(slab.value() & !PAGE_MASK, 0);
        self.ptr_at(slab) as *const Slab
    }

    #[inline(always)]
    pub(crate) fn slab_mut(&mut self, slab: Offset) -> *mut Slab {
        debug_assert_eq!(slab.value() & !PAGE_MASK, 0);
        self.ptr_at_mut(slab) as *mut Slab
    }

    /// Offset of cache descriptor `index` inside the region header.
    pub(crate) fn cache_offset(&self, index: usize) -> Offset {
        self.field_offset(&self.caches.cache[index] as *const Cache)
    }

    fn slab_list_offset(&self, index: usize, kind: ListKind) -> Offset {
        let cache = &self.caches.cache[index];
        match kind {
            ListKind::Full => self.field_offset(&cache.full_slabs as *const SlabList),
            ListKind::Partial => self.field_offset(&cache.partial_slabs as *const SlabList),
            ListKind::Free => self.field_offset(&cache.free_slabs as *const SlabList),
        }
    }

    /// Cache index an object belongs to, recovered through its slab header.
    pub(crate) fn object_cache(&self, object: Offset) -> usize {
        let slab = self.slab_ptr(Offset::new(object.value() & PAGE_MASK));
        let cache = unsafe { (*slab).cache };
        let first = self.cache_offset(0);
        debug_assert!(cache.value() >= first.value());
        let index = (cache.value() - first.value()) / mem::size_of::<Cache>();
        debug_assert!(index < self.caches.count);
        index
    }

    /// Claims the next cache slot and fills in the descriptor. The name is
    /// stored truncated to 15 bytes, NUL padded.
    pub(crate) fn cache_init(&mut self, name: &str, size: usize, align: usize) -> usize {
        let id = self.caches.count;
        self.caches.count += 1;

        let aligned = aligned_size(size, align);
        let cache = &mut self.caches.cache[id];
        cache.name = [0; 16];
        let length = cmp::min(name.len(), cache.name.len() - 1);
        cache.name[..length].copy_from_slice(&name.as_bytes()[..length]);
        cache.full_slabs = SlabList { head: Offset::NULL, count: 0 };
        cache.partial_slabs = SlabList { head: Offset::NULL, count: 0 };
        cache.free_slabs = SlabList { head: Offset::NULL, count: 0 };
        cache.object_size = size as u16;
        cache.alignment = align as u16;
        cache.aligned_size = aligned;
        cache.object_count = (BASE_PAGE_SIZE - mem::size_of::<Slab>()) / aligned;
        id
    }

    /// Creates a named cache for caller defined objects.
    ///
    /// The cache lives inside the region and can only be used together with
    /// it. `align` must be a positive multiple of 8; alignments that divide
    /// the page size are honored exactly, anything else still yields 8 byte
    /// aligned objects. Fails when the cache directory is full, the objects
    /// do not fit in a slab, or the name is empty or already taken.
    pub fn cache_create(
        &mut self,
        name: &str,
        object_size: usize,
        align: usize,
    ) -> Result<CacheId, &'static str> {
        if self.caches.count >= MAX_CACHES {
            error!("no cache slot left for {}", name);
            return Err("no cache slot left");
        }
        if object_size == 0 {
            return Err("zero size objects");
        }
        if align == 0 || align % 8 != 0 {
            return Err("alignment is not a multiple of 8");
        }
        if aligned_size(object_size, align) > BASE_PAGE_SIZE - mem::size_of::<Slab>() {
            return Err("objects do not fit in a slab");
        }
        if name.is_empty() || self.cache_by_name(name).is_some() {
            return Err("cache name is empty or already taken");
        }
        Ok(CacheId(self.cache_init(name, object_size, align)))
    }

    fn cache_by_name(&self, name: &str) -> Option<usize> {
        let name = name.as_bytes();
        let length = cmp::min(name.len(), 15);
        (0..self.caches.count).find(|&index| {
            let stored = &self.caches.cache[index].name;
            stored[..length] == name[..length] && stored[length] == 0
        })
    }

    /// Allocates one object from a cache created with
    /// [`Region::cache_create`].
    pub fn cache_alloc(&mut self, cache: CacheId) -> Result<Offset, &'static str> {
        if cache.0 >= self.caches.count {
            return Err("invalid cache");
        }
        self.alloc_object(cache.0).ok_or("out of memory")
    }

    /// Returns `object` to the cache it was allocated from. Offsets outside
    /// the region, or objects of a different cache, are ignored.
    pub fn cache_free(&mut self, cache: CacheId, object: Offset) {
        if cache.0 >= self.caches.count {
            return;
        }
        let o = object.value();
        if o <= self.pages.value() || o >= self.size || o & 0x7 != 0 {
            return;
        }
        if !self.page_is(PageKind::Cache, o / BASE_PAGE_SIZE) {
            debug_assert!(false, "cache free of a non cache offset {:?}", object);
            return;
        }
        let index = self.object_cache(object);
        if index != cache.0 {
            debug_assert!(false, "object {:?} belongs to cache {}, not {}", object, index, cache.0);
            return;
        }
        self.free_object(index, object);
    }

    /// Allocates one object from size class `index`.
    ///
    /// Searches partial slabs first, then fully free slabs, and finally
    /// formats a fresh page. Returns `None` when no page is available.
    pub(crate) fn alloc_object(&mut self, index: usize) -> Option<Offset> {
        debug_assert!(index < self.caches.count);

        let slab_offset;
        if !self.caches.cache[index].partial_slabs.head.is_null() {
            slab_offset = self.caches.cache[index].partial_slabs.head;
            let remaining = unsafe { (*self.slab_ptr(slab_offset)).free_objects.count };
            // handing out the last object, move to the full list
            if remaining == 1 {
                self.unlink_slab(slab_offset);
                self.push_slab(index, ListKind::Full, slab_offset);
            }
        } else {
            if self.caches.cache[index].free_slabs.head.is_null() {
                self.allocate_slab(index)?;
            }
            slab_offset = self.caches.cache[index].free_slabs.head;
            self.unlink_slab(slab_offset);
            if self.caches.cache[index].object_count == 1 {
                self.push_slab(index, ListKind::Full, slab_offset);
            } else {
                self.push_slab(index, ListKind::Partial, slab_offset);
            }
        }

        let slab = self.slab_mut(slab_offset);
        unsafe {
            let object = (*slab).free_objects.head;
            debug_assert!(!object.is_null());
            (*slab).free_objects.head = *(self.ptr_at(object) as *const Offset);
            (*slab).free_objects.count -= 1;
            Some(object)
        }
    }

    /// Returns `object` to its slab and updates the slab's list membership.
    pub(crate) fn free_object(&mut self, index: usize, object: Offset) {
        let slab_offset = Offset::new(object.value() & PAGE_MASK);
        let slab = self.slab_mut(slab_offset);

        unsafe {
            debug_assert_eq!((*slab).cache, self.cache_offset(index));
            debug_assert!(object.value() >= (*slab).objects.value());

            if cfg!(debug_assertions) {
                // detect double free
                let mut cursor = (*slab).free_objects.head;
                while !cursor.is_null() {
                    assert_ne!(cursor, object, "double free of {:?}", object);
                    debug_assert!(cursor.value() < slab_offset.value() + BASE_PAGE_SIZE);
                    cursor = *(self.ptr_at(cursor) as *const Offset);
                }
            }

            *(self.ptr_at_mut(object) as *mut Offset) = (*slab).free_objects.head;
            (*slab).free_objects.head = object;
            (*slab).free_objects.count += 1;

            let free = (*slab).free_objects.count;
            let object_count = self.caches.cache[index].object_count;
            if free == object_count {
                // the slab drained completely; keep a reserve, release the rest
                self.unlink_slab(slab_offset);
                if self.caches.cache[index].free_slabs.count >= FREE_SLAB_RESERVE {
                    self.release_page(PageKind::Cache, slab_offset);
                } else {
                    self.push_slab(index, ListKind::Free, slab_offset);
                }
            } else if free == 1 {
                // first free object of a full slab
                self.unlink_slab(slab_offset);
                self.push_slab(index, ListKind::Partial, slab_offset);
            }
        }
    }

    /// Formats a fresh page as a slab for cache `index` and prepends it to
    /// the cache's free slab list.
    fn allocate_slab(&mut self, index: usize) -> Option<Offset> {
        let slab_offset = self.allocate_page()?;
        self.mark_page(PageKind::Cache, slab_offset.value() / BASE_PAGE_SIZE);

        let aligned_size = self.caches.cache[index].aligned_size;
        let object_count = self.caches.cache[index].object_count;
        // objects are right aligned so the last one ends on the page boundary
        let objects = Offset::new(slab_offset.value() + BASE_PAGE_SIZE - object_count * aligned_size);

        unsafe {
            ptr::write_bytes(self.ptr_at_mut(slab_offset), 0, BASE_PAGE_SIZE);

            let slab = self.slab_mut(slab_offset);
            (*slab).cache = self.cache_offset(index);
            (*slab).objects = objects;
            (*slab).free_objects = ObjectList { head: objects, count: object_count };

            // thread the free list back to front; the last slot terminates it
            let mut next = Offset::NULL;
            let mut object = Offset::new(objects.value() + (object_count - 1) * aligned_size);
            loop {
                *(self.ptr_at_mut(object) as *mut Offset) = next;
                if object == objects {
                    break;
                }
                next = object;
                object = Offset::new(object.value() - aligned_size);
            }
        }

        self.push_slab(index, ListKind::Free, slab_offset);
        trace!("formatted slab {:#x} for cache {}", slab_offset.value(), index);
        Some(slab_offset)
    }

    /// Unlinks a slab from whichever list holds it, found through the slab's
    /// `list` back offset.
    fn unlink_slab(&mut self, slab_offset: Offset) {
        unsafe {
            let slab = self.slab_ptr(slab_offset);
            let list = self.ptr_at_mut((*slab).list) as *mut SlabList;
            debug_assert!((*list).count > 0);

            if (*list).head == slab_offset {
                (*list).head = (*slab).next;
            } else {
                let mut cursor = self.slab_mut((*list).head);
                while (*cursor).next != slab_offset {
                    debug_assert!(!(*cursor).next.is_null());
                    cursor = self.slab_mut((*cursor).next);
                }
                (*cursor).next = (*slab).next;
            }
            (*list).count -= 1;
        }
    }

    /// Prepends a slab to one of the cache's lists and records the
    /// membership in the slab header.
    fn push_slab(&mut self, index: usize, kind: ListKind, slab_offset: Offset) {
        let list_offset = self.slab_list_offset(index, kind);
        unsafe {
            let list = self.ptr_at_mut(list_offset) as *mut SlabList;
            let slab = self.slab_mut(slab_offset);
            (*slab).list = list_offset;
            (*slab).next = (*list).head;
            (*list).head = slab_offset;
            (*list).count += 1;
        }
    }
}
