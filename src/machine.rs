// machine.rs - Process state: stacks, string table, dictionary, code pages

use std::collections::HashSet;
use std::sync::Arc;

use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::prelude::*;
use cranelift_jit::JITModule;

use crate::dictionary::Dictionary;
use crate::stacks::{
    Stack, StackError, DATA_STACK_CELLS, LOCALS_STACK_CELLS, RETURN_STACK_CELLS,
    STRING_STACK_CELLS,
};
use crate::strings::StringTable;

/// Dictionary arena size. Entries and ARRAY payloads never relocate inside
/// it, which keeps baked data-cell addresses valid.
const DICT_ARENA_BYTES: usize = 8 * 1024 * 1024;

// Fault codes recorded by runtime helpers called from generated code.
pub const FAULT_ARRAY_BOUNDS: i64 = 1;
pub const FAULT_STRING: i64 = 2;

pub fn fault_message(code: i64) -> &'static str {
    match code {
        FAULT_ARRAY_BOUNDS => "array index out of range",
        FAULT_STRING => "string operation failed",
        _ => "runtime fault",
    }
}

/// Shared context between the driver, runtime helpers and generated code.
///
/// Compiled words receive a pointer to this struct. Generated code itself
/// only ever touches the stack-top slots and the fault cell (through baked
/// addresses); the trailing fields let host-implemented words (`.s`,
/// `words`, the string helpers) reach the rest of the machine.
#[repr(C)]
pub struct VmContext {
    pub ds_top: *mut *mut i64,
    pub rs_top: *mut *mut i64,
    pub ls_top: *mut *mut i64,
    pub ss_top: *mut *mut i64,
    pub ds_ceiling: *const i64,
    pub rs_ceiling: *const i64,
    pub ls_ceiling: *const i64,
    pub ss_ceiling: *const i64,
    pub fault: i64,
    pub strings: *const StringTable,
    pub dictionary: *mut Dictionary,
}

/// Addresses the generator bakes into emitted code as 64-bit immediates.
/// All of them point into boxed, non-moving storage owned by the machine.
#[derive(Clone, Copy)]
pub struct TopSlots {
    pub ds: i64,
    pub rs: i64,
    pub ls: i64,
    pub ss: i64,
    pub ds_ceiling: i64,
    pub fault: i64,
    pub vmctx: i64,
}

/// One finalized word's executable memory, retained for the lifetime of
/// its dictionary entry and released on `forget`.
pub struct CodeUnit {
    pub name: String,
    module: Option<JITModule>,
    pub code_bytes: usize,
    /// String-table indices captured by this word's emission; dropped back
    /// when the word is forgotten.
    pub strings: Vec<usize>,
}

impl CodeUnit {
    pub fn new(name: String, module: JITModule, code_bytes: usize, strings: Vec<usize>) -> Self {
        CodeUnit {
            name,
            module: Some(module),
            code_bytes,
            strings,
        }
    }
}

impl Drop for CodeUnit {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // No references into this word's pages remain once its entry
            // has been forgotten (or the whole machine is going away).
            unsafe { module.free_memory() };
        }
    }
}

/// The whole interpreter state: four operand stacks, string table,
/// dictionary and the retained executable code units. Tests instantiate a
/// fresh machine per case; there is no global state.
pub struct Machine {
    pub ds: Box<Stack>,
    pub rs: Box<Stack>,
    pub ls: Box<Stack>,
    pub ss: Box<Stack>,
    pub strings: Arc<StringTable>,
    pub dict: Box<Dictionary>,
    vm: Box<VmContext>,
    isa: OwnedTargetIsa,
    pub code: Vec<CodeUnit>,
    pub logging: bool,
    pub loop_check: bool,
    pub traced: HashSet<String>,
    startup_loaded: bool,
}

impl Machine {
    pub fn new() -> Result<Machine, String> {
        let mut ds = Stack::new("data", DATA_STACK_CELLS);
        let mut rs = Stack::new("return", RETURN_STACK_CELLS);
        let mut ls = Stack::new("locals", LOCALS_STACK_CELLS);
        let mut ss = Stack::new("string", STRING_STACK_CELLS);
        let strings = Arc::new(StringTable::new());
        let mut dict = Dictionary::new(DICT_ARENA_BYTES);

        let vm = Box::new(VmContext {
            ds_top: ds.top_slot(),
            rs_top: rs.top_slot(),
            ls_top: ls.top_slot(),
            ss_top: ss.top_slot(),
            ds_ceiling: ds.ceiling_ptr(),
            rs_ceiling: rs.ceiling_ptr(),
            ls_ceiling: ls.ceiling_ptr(),
            ss_ceiling: ss.ceiling_ptr(),
            fault: 0,
            strings: Arc::as_ptr(&strings),
            dictionary: &mut *dict,
        });

        let mut flag_builder = settings::builder();
        // No PLT indirection; calls go through absolute 64-bit pointers.
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| format!("failed to set is_pic: {}", e))?;
        flag_builder
            .set("use_colocated_libcalls", "true")
            .map_err(|e| format!("failed to set use_colocated_libcalls: {}", e))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| format!("failed to create ISA builder: {}", e))?
            .finish(flags)
            .map_err(|e| format!("failed to create ISA: {}", e))?;

        let mut machine = Machine {
            ds,
            rs,
            ls,
            ss,
            strings,
            dict,
            vm,
            isa,
            code: Vec::new(),
            logging: false,
            loop_check: false,
            traced: HashSet::new(),
            startup_loaded: false,
        };

        crate::builtins::register(&mut machine)?;
        Ok(machine)
    }

    pub fn vm_ptr(&mut self) -> *mut VmContext {
        &mut *self.vm
    }

    pub fn isa(&self) -> OwnedTargetIsa {
        self.isa.clone()
    }

    pub fn top_slots(&mut self) -> TopSlots {
        TopSlots {
            ds: self.ds.top_slot() as i64,
            rs: self.rs.top_slot() as i64,
            ls: self.ls.top_slot() as i64,
            ss: self.ss.top_slot() as i64,
            ds_ceiling: self.ds.ceiling_ptr() as i64,
            fault: &mut self.vm.fault as *mut i64 as i64,
            vmctx: &mut *self.vm as *mut VmContext as i64,
        }
    }

    // ------------------------------------------------------------------
    // Stack convenience used by the interpret path and immediate words
    // ------------------------------------------------------------------

    pub fn push_ds(&mut self, v: i64) -> Result<(), StackError> {
        self.ds.push(v)
    }

    pub fn pop_ds(&mut self) -> Result<i64, StackError> {
        self.ds.pop()
    }

    pub fn push_ds_f64(&mut self, v: f64) -> Result<(), StackError> {
        self.ds.push_f64(v)
    }

    pub fn pop_ds_f64(&mut self) -> Result<f64, StackError> {
        self.ds.pop_f64()
    }

    pub fn push_ss(&mut self, index: usize) -> Result<(), StackError> {
        self.ss.push(index as i64)
    }

    pub fn pop_ss(&mut self) -> Result<usize, StackError> {
        Ok(self.ss.pop()? as usize)
    }

    /// The recovery primitive: restore all four stacks to their ceilings
    /// and clear any recorded fault.
    pub fn reset_stacks(&mut self) {
        self.ds.reset();
        self.rs.reset();
        self.ls.reset();
        self.ss.reset();
        self.vm.fault = 0;
    }

    pub fn take_fault(&mut self) -> Option<i64> {
        match self.vm.fault {
            0 => None,
            code => {
                self.vm.fault = 0;
                Some(code)
            }
        }
    }

    /// Call a compiled behavior and surface any fault it recorded.
    pub fn invoke(&mut self, f: crate::dictionary::WordFn) -> Result<(), String> {
        f(self.vm_ptr());
        match self.take_fault() {
            None => Ok(()),
            Some(code) => Err(fault_message(code).to_string()),
        }
    }

    /// Forget the newest dictionary entry, releasing its executable pages
    /// and dropping the string references its emission captured.
    pub fn forget_last(&mut self) -> Result<String, String> {
        let name = self.dict.forget().map_err(|e| e.to_string())?;
        // Unit names keep the case the definition used; the dictionary
        // folds to lowercase.
        if let Some(pos) = self
            .code
            .iter()
            .rposition(|u| u.name.eq_ignore_ascii_case(&name))
        {
            let unit = self.code.remove(pos);
            for &index in &unit.strings {
                self.strings.dec(index);
            }
        }
        Ok(name)
    }

    pub fn startup_loaded(&mut self) -> bool {
        std::mem::replace(&mut self.startup_loaded, true)
    }

    /// `*mem` report: executable code plus dictionary arena usage.
    pub fn mem_report(&self) -> String {
        let code_bytes: usize = self.code.iter().map(|u| u.code_bytes).sum();
        format!(
            "code units : {} ({} bytes executable)\ndictionary : {} / {} bytes\nstrings    : {} interned",
            self.code.len(),
            code_bytes,
            self.dict.used_bytes(),
            self.dict.capacity(),
            self.strings.list().len(),
        )
    }
}
