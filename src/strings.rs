// strings.rs - Interned string table with ref-counted lifetimes

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::Mutex;

/// Interns string literals and hands out stable indices. Each slot keeps a
/// reference count; the byte address of a slot is stable (NUL-terminated,
/// so generated code can print it directly) until the count drops to zero.
///
/// The table is shared between the tokenizer, the generator and the
/// runtime helpers, so the maps live behind a mutex.
pub struct StringTable {
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
}

struct Slot {
    text: CString,
    refs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringError {
    BadIndex(usize),
    FieldOutOfRange(usize),
    EmbeddedNul,
}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StringError::BadIndex(i) => write!(f, "no interned string at index {}", i),
            StringError::FieldOutOfRange(i) => write!(f, "field {} out of range", i),
            StringError::EmbeddedNul => write!(f, "string literal contains a NUL byte"),
        }
    }
}

impl std::error::Error for StringError {}

impl StringTable {
    pub fn new() -> StringTable {
        StringTable {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("string table lock")
    }

    /// Intern `text`, returning its index. An existing entry gains a
    /// reference; a new entry starts at refcount 1.
    pub fn intern(&self, text: &str) -> Result<usize, StringError> {
        let mut inner = self.lock();
        if let Some(&index) = inner.map.get(text) {
            if let Some(slot) = inner.slots[index].as_mut() {
                slot.refs += 1;
            }
            return Ok(index);
        }
        let c = CString::new(text).map_err(|_| StringError::EmbeddedNul)?;
        let slot = Slot { text: c, refs: 1 };
        let index = match inner.free.pop() {
            Some(i) => {
                inner.slots[i] = Some(slot);
                i
            }
            None => {
                inner.slots.push(Some(slot));
                inner.slots.len() - 1
            }
        };
        inner.map.insert(text.to_string(), index);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Result<String, StringError> {
        let inner = self.lock();
        match inner.slots.get(index).and_then(|s| s.as_ref()) {
            Some(slot) => Ok(slot.text.to_string_lossy().into_owned()),
            None => Err(StringError::BadIndex(index)),
        }
    }

    /// Stable NUL-terminated byte address, valid while the refcount is
    /// above zero. CString buffers live on the heap, so the address
    /// survives slot-vector growth.
    pub fn address(&self, index: usize) -> Result<*const u8, StringError> {
        let inner = self.lock();
        match inner.slots.get(index).and_then(|s| s.as_ref()) {
            Some(slot) => Ok(slot.text.as_ptr() as *const u8),
            None => Err(StringError::BadIndex(index)),
        }
    }

    pub fn inc(&self, index: usize) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get_mut(index).and_then(|s| s.as_mut()) {
            slot.refs += 1;
        }
    }

    /// Drop one reference; releasing the last one frees the slot, after
    /// which the index may be reused by a later intern.
    pub fn dec(&self, index: usize) {
        let mut inner = self.lock();
        let released = match inner.slots.get_mut(index).and_then(|s| s.as_mut()) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };
        if released {
            if let Some(slot) = inner.slots[index].take() {
                let key = slot.text.to_string_lossy().into_owned();
                inner.map.remove(&key);
            }
            inner.free.push(index);
        }
    }

    pub fn ref_count(&self, index: usize) -> usize {
        let inner = self.lock();
        inner
            .slots
            .get(index)
            .and_then(|s| s.as_ref())
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    pub fn concat(&self, a: usize, b: usize) -> Result<usize, StringError> {
        let joined = {
            let left = self.get(a)?;
            let right = self.get(b)?;
            left + &right
        };
        self.intern(&joined)
    }

    /// Split `src` on `delim` and intern the field at `field_idx`.
    pub fn split(&self, src: usize, delim: usize, field_idx: usize) -> Result<usize, StringError> {
        let text = self.get(src)?;
        let sep = self.get(delim)?;
        match text.split(sep.as_str()).nth(field_idx) {
            Some(field) => self.intern(&field.to_string()),
            None => Err(StringError::FieldOutOfRange(field_idx)),
        }
    }

    /// Byte position of `needle` within `hay`, -1 when absent.
    pub fn position(&self, needle: usize, hay: usize) -> Result<i64, StringError> {
        let hay = self.get(hay)?;
        let needle = self.get(needle)?;
        Ok(match hay.find(needle.as_str()) {
            Some(pos) => pos as i64,
            None => -1,
        })
    }

    pub fn count_fields(&self, src: usize, delim: usize) -> Result<usize, StringError> {
        let text = self.get(src)?;
        let sep = self.get(delim)?;
        if text.is_empty() {
            return Ok(0);
        }
        Ok(text.split(sep.as_str()).filter(|f| !f.is_empty()).count())
    }

    pub fn equals(&self, a: usize, b: usize) -> Result<bool, StringError> {
        Ok(a == b || self.get(a)? == self.get(b)?)
    }

    pub fn contains(&self, a: usize, b: usize) -> Result<bool, StringError> {
        let hay = self.get(a)?;
        let needle = self.get(b)?;
        Ok(hay.contains(needle.as_str()))
    }

    /// (index, text, refcount, address) for every live slot, for `*strings`.
    pub fn list(&self) -> Vec<(usize, String, usize, usize)> {
        let inner = self.lock();
        let mut out = Vec::new();
        for (index, slot) in inner.slots.iter().enumerate() {
            if let Some(slot) = slot {
                out.push((
                    index,
                    slot.text.to_string_lossy().into_owned(),
                    slot.refs,
                    slot.text.as_ptr() as usize,
                ));
            }
        }
        out
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let t = StringTable::new();
        let a = t.intern("hello").unwrap();
        let b = t.intern("hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(t.ref_count(a), 2);
    }

    #[test]
    fn address_stable_across_other_interns() {
        let t = StringTable::new();
        let a = t.intern("stable").unwrap();
        let before = t.address(a).unwrap();
        for i in 0..100 {
            t.intern(&format!("filler-{}", i)).unwrap();
        }
        assert_eq!(t.address(a).unwrap(), before);
    }

    #[test]
    fn release_frees_slot() {
        let t = StringTable::new();
        let a = t.intern("gone").unwrap();
        t.dec(a);
        assert!(t.get(a).is_err());
        // a released index may be handed out again
        let b = t.intern("other").unwrap();
        assert_eq!(b, a);
    }

    #[test]
    fn string_operations() {
        let t = StringTable::new();
        let ab = t.intern("alpha,beta").unwrap();
        let comma = t.intern(",").unwrap();
        let beta = t.split(ab, comma, 1).unwrap();
        assert_eq!(t.get(beta).unwrap(), "beta");
        assert_eq!(t.count_fields(ab, comma).unwrap(), 2);

        let al = t.intern("alpha").unwrap();
        assert_eq!(t.position(al, ab).unwrap(), 0);
        let missing = t.intern("gamma").unwrap();
        assert_eq!(t.position(missing, ab).unwrap(), -1);
        assert!(t.contains(ab, al).unwrap());

        let joined = t.concat(al, comma).unwrap();
        assert_eq!(t.get(joined).unwrap(), "alpha,");
    }
}
