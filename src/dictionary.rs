// dictionary.rs - Forward-linked, append-only word store

use std::collections::HashMap;
use std::fmt;

use crate::strings::StringTable;

/// Function pointer invoked for a word's compiled behavior. The single
/// argument is the machine's `VmContext`; jitted code forwards its own
/// context pointer when calling other words.
pub type WordFn = extern "C" fn(*mut crate::machine::VmContext);

/// Inline code generator behavior: emits the word's native sequence at the
/// current emission point of the open definition.
pub type GenFn = fn(&mut crate::jit::Asm) -> Result<(), String>;

/// Immediate behavior, invoked with cursor visibility so the word may
/// consume following tokens. Present in one or both of the compile-time
/// and interpret-time slots.
pub type ImmFn = fn(&mut crate::interpreter::ImmediateCtx) -> Result<(), String>;

pub const NAME_BYTES: usize = 32;

// ============================================================================
// TYPE AND STATE FLAGS
// ============================================================================

pub type WordType = u32;

pub const WORD: WordType = 0;
pub const CONSTANT: WordType = 1 << 0;
pub const VARIABLE: WordType = 1 << 1;
pub const VALUE: WordType = 1 << 2;
pub const RECORD: WordType = 1 << 3;
pub const INTEGER: WordType = 1 << 4;
pub const FLOAT: WordType = 1 << 5;
pub const STRING: WordType = 1 << 6;
pub const ARRAY: WordType = 1 << 7;
pub const TWODIM: WordType = 1 << 8;

pub fn type_name(t: WordType) -> String {
    if t == WORD {
        return "WORD".to_string();
    }
    let mut parts = Vec::new();
    for (bit, name) in [
        (CONSTANT, "CONSTANT"),
        (VARIABLE, "VARIABLE"),
        (VALUE, "VALUE"),
        (RECORD, "RECORD"),
        (INTEGER, "INTEGER"),
        (FLOAT, "FLOAT"),
        (STRING, "STRING"),
        (ARRAY, "ARRAY"),
        (TWODIM, "TWODIM"),
    ] {
        if t & bit != 0 {
            parts.push(name);
        }
    }
    parts.join("|")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WordState {
    Normal = 0,
    Immediate = 1,
    CompileOnly = 2,
    InterpretOnly = 4,
    CompileOnlyImmediate = 3,
    InterpretOnlyImmediate = 5,
}

impl WordState {
    pub fn is_immediate(self) -> bool {
        (self as u32) & 1 != 0
    }

    pub fn compile_only(self) -> bool {
        (self as u32) & 2 != 0
    }

    pub fn interpret_only(self) -> bool {
        (self as u32) & 4 != 0
    }
}

impl fmt::Display for WordState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WordState::Normal => "NORMAL",
            WordState::Immediate => "IMMEDIATE",
            WordState::CompileOnly => "COMPILE_ONLY",
            WordState::InterpretOnly => "INTERPRET_ONLY",
            WordState::CompileOnlyImmediate => "COMPILE_ONLY_IMMEDIATE",
            WordState::InterpretOnlyImmediate => "INTERPRET_ONLY_IMMEDIATE",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// DATA CELL
// ============================================================================

const TAG_INT: u64 = 0;
const TAG_FLOAT: u64 = 1;
const TAG_PTR: u64 = 2;

/// Three-way tagged cell: integer, double or opaque pointer. Kept as plain
/// bits so an entry is valid at any byte offset of the arena, and so the
/// generator can bake the address of `bits` into emitted loads and stores.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DataCell {
    tag: u64,
    bits: u64,
}

impl DataCell {
    pub fn int(v: u64) -> DataCell {
        DataCell { tag: TAG_INT, bits: v }
    }

    pub fn float(v: f64) -> DataCell {
        DataCell { tag: TAG_FLOAT, bits: v.to_bits() }
    }

    pub fn ptr(v: *mut u8) -> DataCell {
        DataCell { tag: TAG_PTR, bits: v as u64 }
    }

    pub fn as_int(&self) -> Option<u64> {
        (self.tag == TAG_INT).then_some(self.bits)
    }

    pub fn as_float(&self) -> Option<f64> {
        (self.tag == TAG_FLOAT).then(|| f64::from_bits(self.bits))
    }

    pub fn as_ptr(&self) -> Option<*mut u8> {
        (self.tag == TAG_PTR).then_some(self.bits as *mut u8)
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }
}

impl fmt::Display for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.tag {
            TAG_FLOAT => write!(f, "double: {}", f64::from_bits(self.bits)),
            TAG_PTR => write!(f, "pointer: {:#x}", self.bits),
            _ => write!(f, "integer: {}", self.bits),
        }
    }
}

// ============================================================================
// DICTIONARY ENTRY
// ============================================================================

/// Fixed-layout record placed in the dictionary arena. `ARRAY` entries
/// reserve their payload immediately after this header, so the struct must
/// keep `data` as its final field.
#[repr(C)]
pub struct Entry {
    name: [u8; NAME_BYTES],
    pub generator: Option<GenFn>,
    pub compiled: Option<WordFn>,
    pub immediate_compile: Option<ImmFn>,
    pub immediate_interp: Option<ImmFn>,
    pub link: *mut Entry,
    pub types: WordType,
    pub state: WordState,
    allotted: u64,
    pub data: DataCell,
}

/// Header stride in the arena; payloads allotted for ARRAY entries follow.
pub const ENTRY_STRIDE: usize = std::mem::size_of::<Entry>();

impl Entry {
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_BYTES);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Stable address of the data cell's payload word, baked into emitted
    /// loads and stores for VALUE/VARIABLE/STRING words.
    pub fn data_addr(&mut self) -> *mut u64 {
        &mut self.data.bits
    }

    /// First byte of the allotted payload (ARRAY element 0).
    pub fn payload_addr(&mut self) -> *mut u8 {
        unsafe { (self as *mut Entry as *mut u8).add(ENTRY_STRIDE) }
    }
}

// ============================================================================
// DICTIONARY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DictError {
    NameTooLong(String),
    OutOfMemory,
    Empty,
}

impl fmt::Display for DictError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DictError::NameTooLong(n) => write!(f, "word name too long: {}", n),
            DictError::OutOfMemory => write!(f, "dictionary arena exhausted"),
            DictError::Empty => write!(f, "no words to forget"),
        }
    }
}

impl std::error::Error for DictError {}

/// Append-only store of entries in a fixed byte arena. Entries never move,
/// which keeps the data-cell addresses baked into compiled code valid;
/// `forget` reclaims space by rewinding the allocation cursor.
pub struct Dictionary {
    memory: Box<[u8]>,
    cursor: usize,
    head: *mut Entry,
    source: HashMap<String, String>,
}

unsafe impl Send for Dictionary {}

impl Dictionary {
    pub fn new(arena_bytes: usize) -> Box<Dictionary> {
        Box::new(Dictionary {
            memory: vec![0u8; arena_bytes].into_boxed_slice(),
            cursor: 0,
            head: std::ptr::null_mut(),
            source: HashMap::new(),
        })
    }

    /// Append a new head entry. Names are case-folded to lowercase and
    /// bounded at 31 characters; lookups are case-insensitive.
    pub fn add(
        &mut self,
        name: &str,
        generator: Option<GenFn>,
        compiled: Option<WordFn>,
        immediate_compile: Option<ImmFn>,
        immediate_interp: Option<ImmFn>,
        source: Option<&str>,
    ) -> Result<(), DictError> {
        let folded = name.to_lowercase();
        if folded.len() >= NAME_BYTES {
            return Err(DictError::NameTooLong(name.to_string()));
        }

        let offset = (self.cursor + 7) & !7;
        if offset + ENTRY_STRIDE > self.memory.len() {
            return Err(DictError::OutOfMemory);
        }

        let mut name_bytes = [0u8; NAME_BYTES];
        name_bytes[..folded.len()].copy_from_slice(folded.as_bytes());

        let entry = Entry {
            name: name_bytes,
            generator,
            compiled,
            immediate_compile,
            immediate_interp,
            link: self.head,
            types: WORD,
            state: WordState::Normal,
            allotted: 0,
            data: DataCell::int(0),
        };

        let slot = unsafe { self.memory.as_mut_ptr().add(offset) as *mut Entry };
        unsafe { std::ptr::write(slot, entry) };
        self.cursor = offset + ENTRY_STRIDE;
        self.head = slot;

        if let Some(text) = source {
            self.source.insert(folded, text.to_string());
        }
        Ok(())
    }

    /// Linear walk from the head, youngest first, case-insensitive.
    pub fn find(&self, name: &str) -> Option<&Entry> {
        let folded = name.to_lowercase();
        let mut current = self.head;
        while !current.is_null() {
            let entry = unsafe { &*current };
            if entry.name() == folded {
                return Some(entry);
            }
            current = entry.link;
        }
        None
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Entry> {
        let folded = name.to_lowercase();
        let mut current = self.head;
        while !current.is_null() {
            let entry = unsafe { &mut *current };
            if entry.name() == folded {
                return Some(entry);
            }
            current = entry.link;
        }
        None
    }

    pub fn head_entry(&mut self) -> Option<&mut Entry> {
        if self.head.is_null() {
            None
        } else {
            Some(unsafe { &mut *self.head })
        }
    }

    /// Reserve `bytes` after the current head entry (ARRAY payloads). The
    /// space is reclaimed together with the entry on `forget`.
    pub fn allot(&mut self, bytes: usize) -> Result<*mut u8, DictError> {
        if self.head.is_null() {
            return Err(DictError::Empty);
        }
        if self.cursor + bytes > self.memory.len() {
            return Err(DictError::OutOfMemory);
        }
        let start = unsafe { self.memory.as_mut_ptr().add(self.cursor) };
        unsafe { std::ptr::write_bytes(start, 0, bytes) };
        self.cursor += bytes;
        unsafe { (*self.head).allotted += bytes as u64 };
        Ok(start)
    }

    /// Copy raw bytes into the allotment region of the current head.
    pub fn store(&mut self, data: &[u8]) -> Result<(), DictError> {
        let dst = self.allot(data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Remove the head entry, rewinding the cursor past the entry header
    /// and any allotted payload. Returns the forgotten name.
    pub fn forget(&mut self) -> Result<String, DictError> {
        if self.head.is_null() {
            return Err(DictError::Empty);
        }
        let (name, link, allotted) = {
            let entry = unsafe { &*self.head };
            (entry.name().to_string(), entry.link, entry.allotted as usize)
        };
        self.cursor -= ENTRY_STRIDE + allotted;
        self.head = link;
        self.source.remove(&name);
        Ok(name)
    }

    pub fn source_of(&self, name: &str) -> Option<&str> {
        self.source.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// All names, youngest first, for `words`.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = self.head;
        while !current.is_null() {
            let entry = unsafe { &*current };
            out.push(entry.name().to_string());
            current = entry.link;
        }
        out
    }

    /// `see`-style report: behaviors, flags, data variant and saved source.
    pub fn display(&self, name: &str, strings: &StringTable) -> String {
        let entry = match self.find(name) {
            Some(e) => e,
            None => return format!("{} ?", name),
        };

        let fn_addr = |p: Option<usize>| match p {
            Some(a) => format!("{:#x}", a),
            None => "-".to_string(),
        };

        let mut out = String::new();
        out.push_str(&format!("name      : {}\n", entry.name()));
        out.push_str(&format!(
            "generator : {}\n",
            fn_addr(entry.generator.map(|f| f as usize))
        ));
        out.push_str(&format!(
            "compiled  : {}\n",
            fn_addr(entry.compiled.map(|f| f as usize))
        ));
        out.push_str(&format!(
            "immediate : {}\n",
            fn_addr(entry.immediate_compile.map(|f| f as usize))
        ));
        out.push_str(&format!(
            "interp    : {}\n",
            fn_addr(entry.immediate_interp.map(|f| f as usize))
        ));
        out.push_str(&format!("state     : {}\n", entry.state));
        out.push_str(&format!("type      : {}\n", type_name(entry.types)));
        out.push_str(&format!("data      : {}\n", entry.data));
        if entry.types & STRING != 0 {
            if let Some(idx) = entry.data.as_int() {
                if let Ok(text) = strings.get(idx as usize) {
                    out.push_str(&format!("string    : \"{}\"\n", text));
                }
            }
        }
        out.push_str(&format!("link      : {:#x}\n", entry.link as usize));
        match self.source_of(entry.name()) {
            Some(src) => out.push_str(&format!("source    :\n{}\n", pretty_source(src))),
            None => out.push_str("source    : built-in\n"),
        }
        out
    }
}

/// Re-indent a saved definition: two extra spaces inside each `:`, `if`,
/// `do`, `begin` or `case` nesting level.
pub fn pretty_source(source: &str) -> String {
    let mut out = String::new();
    let mut indent: usize = 1;
    let mut at_line_start = true;

    for word in source.split_whitespace() {
        let lower = word.to_lowercase();
        let opens = matches!(lower.as_str(), ":" | "if" | "do" | "begin" | "case");
        let closes = matches!(
            lower.as_str(),
            ";" | "then" | "loop" | "+loop" | "until" | "again" | "repeat" | "endcase"
        );

        if closes {
            indent = indent.saturating_sub(1);
            if !at_line_start {
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push_str(word);
            out.push('\n');
            at_line_start = true;
            continue;
        }

        if at_line_start {
            out.push_str(&"  ".repeat(indent));
            at_line_start = false;
        } else {
            out.push(' ');
        }
        out.push_str(word);

        if opens {
            out.push('\n');
            indent += 1;
            at_line_start = true;
        }
    }

    if !at_line_start {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_find_is_case_insensitive() {
        let mut d = Dictionary::new(64 * 1024);
        d.add("Square", None, None, None, None, Some(": square dup * ;"))
            .unwrap();
        assert!(d.find("SQUARE").is_some());
        assert!(d.find("square").is_some());
        assert!(d.find("circle").is_none());
    }

    #[test]
    fn forget_restores_previous_head() {
        let mut d = Dictionary::new(64 * 1024);
        d.add("first", None, None, None, None, None).unwrap();
        let used = d.used_bytes();
        d.add("second", None, None, None, None, None).unwrap();
        assert_eq!(d.forget().unwrap(), "second");
        assert!(d.find("second").is_none());
        assert!(d.find("first").is_some());
        assert_eq!(d.used_bytes(), used);
    }

    #[test]
    fn forget_reclaims_allotment() {
        let mut d = Dictionary::new(64 * 1024);
        d.add("plain", None, None, None, None, None).unwrap();
        let before = d.used_bytes();
        d.add("table", None, None, None, None, None).unwrap();
        d.allot(10 * 8).unwrap();
        d.forget().unwrap();
        assert_eq!(d.used_bytes(), before);
    }

    #[test]
    fn rejects_overlong_names() {
        let mut d = Dictionary::new(64 * 1024);
        let long = "x".repeat(NAME_BYTES);
        assert!(matches!(
            d.add(&long, None, None, None, None, None),
            Err(DictError::NameTooLong(_))
        ));
    }

    #[test]
    fn payload_follows_header() {
        let mut d = Dictionary::new(64 * 1024);
        d.add("arr", None, None, None, None, None).unwrap();
        let base = d.allot(4 * 8).unwrap();
        let head = d.head_entry().unwrap();
        assert_eq!(head.payload_addr(), base);
        assert_eq!(head.payload_addr() as usize, head.data_addr() as usize + 8);
    }

    #[test]
    fn pretty_print_indents_nesting() {
        let text = ": fact dup 2 < if drop 1 then ;";
        let pretty = pretty_source(text);
        assert!(pretty.contains("if\n"));
        assert!(pretty.contains("    drop 1"));
    }
}
