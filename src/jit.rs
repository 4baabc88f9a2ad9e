// jit.rs - Cranelift JIT code generator for Forth words

use cranelift::codegen::ir::SigRef;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};

use std::collections::HashMap;
use std::ffi::CStr;
use std::io::{self, Write};

use crate::dictionary::{GenFn, WordFn};
use crate::machine::{Machine, TopSlots, VmContext, FAULT_ARRAY_BOUNDS, FAULT_STRING};
use crate::machine::CodeUnit;
use crate::strings::StringTable;

// ============================================================================
// RUNTIME HELPERS (called from JIT-compiled code)
// ============================================================================

unsafe fn vm_mut<'a>(vm: *mut VmContext) -> &'a mut VmContext {
    &mut *vm
}

unsafe fn strings_of<'a>(vm: *mut VmContext) -> &'a StringTable {
    &*(*vm).strings
}

/// `.` helper: print a number followed by a space.
pub extern "C" fn forge_print_decimal(n: i64) {
    print!("{} ", n);
    let _ = io::stdout().flush();
}

/// `h.` helper: print a number in hex.
pub extern "C" fn forge_print_hex(n: i64) {
    print!("{:#x} ", n);
    let _ = io::stdout().flush();
}

/// `f.` helper: the cell is an IEEE-754 bit pattern.
pub extern "C" fn forge_print_double(bits: i64) {
    print!("{} ", f64::from_bits(bits as u64));
    let _ = io::stdout().flush();
}

/// EMIT helper: print a single character.
pub extern "C" fn forge_emit(c: i64) {
    let _ = io::stdout().write_all(&[c as u8]);
    let _ = io::stdout().flush();
}

/// `."` helper: print the NUL-terminated interned string at `addr`.
pub extern "C" fn forge_prints(addr: *const u8) {
    if addr.is_null() {
        return;
    }
    let text = unsafe { CStr::from_ptr(addr as *const std::os::raw::c_char) };
    print!("{}", text.to_string_lossy());
    let _ = io::stdout().flush();
}

/// `s.` helper: print the interned string at table index `index`.
pub extern "C" fn forge_print_string(vm: *mut VmContext, index: i64) {
    let strings = unsafe { strings_of(vm) };
    match strings.get(index as usize) {
        Ok(text) => {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        Err(_) => unsafe { vm_mut(vm).fault = FAULT_STRING },
    }
}

/// `s+` helper: concatenate two interned strings, returning the new index.
pub extern "C" fn forge_string_concat(vm: *mut VmContext, a: i64, b: i64) -> i64 {
    let strings = unsafe { strings_of(vm) };
    match strings.concat(a as usize, b as usize) {
        Ok(index) => {
            strings.inc(index);
            index as i64
        }
        Err(_) => {
            unsafe { vm_mut(vm).fault = FAULT_STRING };
            0
        }
    }
}

/// `s=` helper: Forth boolean equality of two interned strings.
pub extern "C" fn forge_string_equal(vm: *mut VmContext, a: i64, b: i64) -> i64 {
    let strings = unsafe { strings_of(vm) };
    match strings.equals(a as usize, b as usize) {
        Ok(true) => -1,
        Ok(false) => 0,
        Err(_) => {
            unsafe { vm_mut(vm).fault = FAULT_STRING };
            0
        }
    }
}

/// Reference-count bump at emission sites that capture a string.
pub extern "C" fn forge_string_inc(vm: *mut VmContext, index: i64) {
    let strings = unsafe { strings_of(vm) };
    strings.inc(index as usize);
}

/// Array bounds trap: record the fault; the emitting site branches to the
/// word's exit label right after this call.
pub extern "C" fn forge_array_trap(vm: *mut VmContext) {
    unsafe { vm_mut(vm).fault = FAULT_ARRAY_BOUNDS };
}

/// `.s` helper: display the data and string stacks, bottom first.
pub extern "C" fn forge_show_stacks(vm: *mut VmContext) {
    let vm = unsafe { vm_mut(vm) };
    unsafe {
        let top = *vm.ds_top;
        let depth = (vm.ds_ceiling as usize - top as usize) / 8;
        print!("<{}> ", depth);
        let mut p = (vm.ds_ceiling as *mut i64).sub(1);
        while p >= top && depth > 0 {
            print!("{} ", *p);
            if p == top {
                break;
            }
            p = p.sub(1);
        }
        let s_top = *vm.ss_top;
        let s_depth = (vm.ss_ceiling as usize - s_top as usize) / 8;
        if s_depth > 0 {
            print!(" S<{}>", s_depth);
        }
    }
    let _ = io::stdout().flush();
}

/// `words` helper: list the dictionary, youngest first.
pub extern "C" fn forge_words(vm: *mut VmContext) {
    let dict = unsafe { &*(*vm).dictionary };
    let names = dict.names();
    println!("{} words:", names.len());
    for (i, name) in names.iter().enumerate() {
        print!("{:<12}", name);
        if (i + 1) % 6 == 0 {
            println!();
        }
    }
    if names.len() % 6 != 0 {
        println!();
    }
}

// ============================================================================
// COMPILE-TIME STATE: control-flow label stack and locals frame
// ============================================================================

/// One open control construct. Every closer checks the variant of the
/// frame it pops; a mismatch is a fatal compile error.
enum ControlFrame {
    /// The word itself: `exit` is bound by the epilogue and is the target
    /// of EXIT-style early returns and fault checks.
    Function { exit: Block },
    /// IF ... [ELSE ...] THEN. `tail` is the next label to bind.
    IfElse { tail: Block, had_else: bool },
    /// BEGIN ... AGAIN / UNTIL / WHILE-REPEAT. `exit` doubles as the
    /// LEAVE target and the WHILE false-branch.
    Begin { begin: Block, exit: Block },
    /// DO ... LOOP / +LOOP. `exit` drops the counters.
    DoLoop { body: Block, exit: Block },
    /// CASE ... OF ... ENDOF ... ENDCASE.
    Case { end_case: Block, end_of: Option<Block> },
}

impl ControlFrame {
    fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Function { .. } => "definition",
            ControlFrame::IfElse { .. } => "IF",
            ControlFrame::Begin { .. } => "BEGIN",
            ControlFrame::DoLoop { .. } => "DO",
            ControlFrame::Case { .. } => "CASE",
        }
    }
}

/// Locals declared by `{ args | mids -- rets }`. Offsets are byte offsets
/// from the locals-stack top, assigned in declaration order; the inverse
/// map is kept for tracing and error text.
#[derive(Default)]
pub struct Locals {
    offsets: HashMap<String, i32>,
    names: HashMap<i32, String>,
    pub args: usize,
    pub mids: usize,
    pub rets: usize,
}

impl Locals {
    pub fn total(&self) -> usize {
        self.args + self.mids + self.rets
    }

    pub fn find(&self, name: &str) -> Option<i32> {
        self.offsets.get(&name.to_lowercase()).copied()
    }

    pub fn name_at(&self, offset: i32) -> Option<&str> {
        self.names.get(&offset).map(|s| s.as_str())
    }

    fn insert(&mut self, name: &str, offset: i32) {
        self.offsets.insert(name.to_lowercase(), offset);
        self.names.insert(offset, name.to_lowercase());
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ============================================================================
// PER-WORD EMISSION CONTEXT
// ============================================================================

/// Emission context for one word. Wraps the Cranelift function builder and
/// owns the control-flow label stack, the locals frame and the DO-loop
/// depth counter. Stack tops are read from and written back to their
/// machine slots around every primitive, so generated code and runtime
/// helpers always agree on the live tops.
pub struct Asm<'a, 'b> {
    b: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    func_id: FuncId,
    slots: TopSlots,
    call_conv: cranelift::codegen::isa::CallConv,
    frames: Vec<ControlFrame>,
    pub locals: Locals,
    pub do_loop_depth: i64,
    pub loop_check: bool,
    /// String indices captured by this word's emission (for forget-time
    /// release).
    pub captured: Vec<usize>,
}

impl<'a, 'b> Asm<'a, 'b> {
    fn iconst(&mut self, v: i64) -> Value {
        self.b.ins().iconst(types::I64, v)
    }

    fn vm_val(&mut self) -> Value {
        self.iconst(self.slots.vmctx)
    }

    /// Load the live top pointer of a stack from its slot.
    fn load_top(&mut self, slot: i64) -> (Value, Value) {
        let slot_ptr = self.iconst(slot);
        let top = self.b.ins().load(types::I64, MemFlags::new(), slot_ptr, 0);
        (slot_ptr, top)
    }

    fn push_cell(&mut self, slot: i64, v: Value) {
        let (slot_ptr, top) = self.load_top(slot);
        let new_top = self.b.ins().iadd_imm(top, -8);
        self.b.ins().store(MemFlags::new(), v, new_top, 0);
        self.b.ins().store(MemFlags::new(), new_top, slot_ptr, 0);
    }

    fn pop_cell(&mut self, slot: i64) -> Value {
        let (slot_ptr, top) = self.load_top(slot);
        let v = self.b.ins().load(types::I64, MemFlags::new(), top, 0);
        let new_top = self.b.ins().iadd_imm(top, 8);
        self.b.ins().store(MemFlags::new(), new_top, slot_ptr, 0);
        v
    }

    fn peek_cell(&mut self, slot: i64) -> Value {
        let (_, top) = self.load_top(slot);
        self.b.ins().load(types::I64, MemFlags::new(), top, 0)
    }

    fn pop_cell_f64(&mut self, slot: i64) -> Value {
        let (slot_ptr, top) = self.load_top(slot);
        let v = self.b.ins().load(types::F64, MemFlags::new(), top, 0);
        let new_top = self.b.ins().iadd_imm(top, 8);
        self.b.ins().store(MemFlags::new(), new_top, slot_ptr, 0);
        v
    }

    fn push_ds(&mut self, v: Value) {
        self.push_cell(self.slots.ds, v)
    }

    fn pop_ds(&mut self) -> Value {
        self.pop_cell(self.slots.ds)
    }

    // Stores are typed by their operand, so doubles share the push path.
    fn push_ds_f64(&mut self, v: Value) {
        self.push_cell(self.slots.ds, v)
    }

    fn pop_ds_f64(&mut self) -> Value {
        self.pop_cell_f64(self.slots.ds)
    }

    fn push_rs(&mut self, v: Value) {
        self.push_cell(self.slots.rs, v)
    }

    fn push_ss(&mut self, v: Value) {
        self.push_cell(self.slots.ss, v)
    }

    fn pop_ss(&mut self) -> Value {
        self.pop_cell(self.slots.ss)
    }

    /// Forth boolean from an i8 comparison result: -1 or 0.
    fn forth_bool(&mut self, flag: Value) -> Value {
        let t = self.iconst(-1);
        let f = self.iconst(0);
        self.b.ins().select(flag, t, f)
    }

    fn import_helper_sig(&mut self, params: usize, returns: usize) -> SigRef {
        let mut sig = Signature::new(self.call_conv);
        for _ in 0..params {
            sig.params.push(AbiParam::new(types::I64));
        }
        for _ in 0..returns {
            sig.returns.push(AbiParam::new(types::I64));
        }
        self.b.import_signature(sig)
    }

    /// Call a host helper through its absolute address.
    fn call_helper(&mut self, helper: i64, args: &[Value], returns: usize) -> Option<Value> {
        let sig = self.import_helper_sig(args.len(), returns);
        let callee = self.iconst(helper);
        let call = self.b.ins().call_indirect(sig, callee, args);
        if returns > 0 {
            Some(self.b.inst_results(call)[0])
        } else {
            None
        }
    }

    fn function_exit(&self) -> Result<Block, String> {
        match self.frames.first() {
            Some(ControlFrame::Function { exit }) => Ok(*exit),
            _ => Err("no open definition".to_string()),
        }
    }

    /// After calling into another word, branch to the epilogue if the
    /// callee recorded a fault.
    fn check_fault(&mut self) -> Result<(), String> {
        let exit = self.function_exit()?;
        let fault_ptr = self.iconst(self.slots.fault);
        let fault = self.b.ins().load(types::I64, MemFlags::new(), fault_ptr, 0);
        let cont = self.b.create_block();
        self.b.ins().brif(fault, exit, &[], cont, &[]);
        self.b.switch_to_block(cont);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prologue / epilogue
    // ------------------------------------------------------------------

    pub fn prologue(&mut self) -> Result<(), String> {
        let entry = self.b.create_block();
        self.b.append_block_params_for_function_params(entry);
        self.b.switch_to_block(entry);
        self.b.ins().nop();
        let exit = self.b.create_block();
        self.frames.push(ControlFrame::Function { exit });
        Ok(())
    }

    pub fn epilogue(&mut self) -> Result<(), String> {
        let frame = self
            .frames
            .pop()
            .ok_or("epilogue: label stack is empty")?;
        let exit = match frame {
            ControlFrame::Function { exit } => exit,
            other => {
                return Err(format!("unterminated {} at end of definition", other.kind()));
            }
        };
        if !self.frames.is_empty() {
            return Err("unterminated control structure at end of definition".to_string());
        }

        self.b.ins().jump(exit, &[]);
        self.b.switch_to_block(exit);

        let total = self.locals.total();
        if total > 0 {
            // Copy return locals back to the data stack in declaration
            // order, then release the frame.
            for i in 0..self.locals.rets {
                let offset = ((self.locals.args + self.locals.mids + i) * 8) as i32;
                let (_, ls) = self.load_top(self.slots.ls);
                let v = self.b.ins().load(types::I64, MemFlags::new(), ls, offset);
                self.push_ds(v);
            }
            let (slot_ptr, ls) = self.load_top(self.slots.ls);
            let released = self.b.ins().iadd_imm(ls, (total * 8) as i64);
            self.b.ins().store(MemFlags::new(), released, slot_ptr, 0);
        }

        self.b.ins().return_(&[]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Literals, calls, locals
    // ------------------------------------------------------------------

    pub fn push_literal(&mut self, n: i64) -> Result<(), String> {
        let v = self.iconst(n);
        self.push_ds(v);
        Ok(())
    }

    pub fn push_double(&mut self, x: f64) -> Result<(), String> {
        let v = self.b.ins().f64const(x);
        self.push_ds_f64(v);
        Ok(())
    }

    /// `s"` emission: push the interned index onto the string stack.
    pub fn push_string_index(&mut self, index: usize) -> Result<(), String> {
        let v = self.iconst(index as i64);
        self.push_ss(v);
        Ok(())
    }

    /// `."` emission: print the interned text at its stable address.
    pub fn emit_prints(&mut self, addr: u64) -> Result<(), String> {
        let a = self.iconst(addr as i64);
        self.call_helper(forge_prints as *const u8 as i64, &[a], 0);
        Ok(())
    }

    /// Call another word's compiled behavior through its address.
    pub fn call_word(&mut self, target: WordFn) -> Result<(), String> {
        let vm = self.vm_val();
        self.call_helper(target as usize as i64, &[vm], 0);
        self.check_fault()
    }

    pub fn push_local(&mut self, offset: i32) -> Result<(), String> {
        let (_, ls) = self.load_top(self.slots.ls);
        let v = self.b.ins().load(types::I64, MemFlags::new(), ls, offset);
        self.push_ds(v);
        Ok(())
    }

    pub fn store_local(&mut self, offset: i32) -> Result<(), String> {
        let v = self.pop_ds();
        let (_, ls) = self.load_top(self.slots.ls);
        self.b.ins().store(MemFlags::new(), v, ls, offset);
        Ok(())
    }

    /// Open the locals frame declared by `{ args | mids -- rets }`:
    /// allocate the region, copy the arguments in (bottom-most argument
    /// into slot 0) and zero the mids and rets.
    pub fn locals_enter(
        &mut self,
        args: &[String],
        mids: &[String],
        rets: &[String],
    ) -> Result<(), String> {
        if !self.locals.is_empty() {
            return Err("locals already declared in this definition".to_string());
        }

        let mut offset = 0i32;
        for name in args.iter().chain(mids).chain(rets) {
            if self.locals.find(name).is_some() {
                return Err(format!("duplicate local name: {}", name));
            }
            self.locals.insert(name, offset);
            offset += 8;
        }
        self.locals.args = args.len();
        self.locals.mids = mids.len();
        self.locals.rets = rets.len();

        let total = self.locals.total();
        if total == 0 {
            return Ok(());
        }

        let (slot_ptr, ls) = self.load_top(self.slots.ls);
        let frame = self.b.ins().iadd_imm(ls, -((total * 8) as i64));
        self.b.ins().store(MemFlags::new(), frame, slot_ptr, 0);

        for i in (0..args.len()).rev() {
            let v = self.pop_ds();
            let (_, ls) = self.load_top(self.slots.ls);
            self.b.ins().store(MemFlags::new(), v, ls, (i * 8) as i32);
        }

        let zero = self.iconst(0);
        for i in args.len()..total {
            let (_, ls) = self.load_top(self.slots.ls);
            self.b.ins().store(MemFlags::new(), zero, ls, (i * 8) as i32);
        }
        Ok(())
    }

    /// TO into a VALUE/VARIABLE data cell at a baked address.
    pub fn store_to_cell(&mut self, addr: u64) -> Result<(), String> {
        let v = self.pop_ds();
        let p = self.iconst(addr as i64);
        self.b.ins().store(MemFlags::new(), v, p, 0);
        Ok(())
    }

    /// TO into a STRING word: pop the string stack, bump the refcount,
    /// store the index.
    pub fn store_to_string_cell(&mut self, addr: u64) -> Result<(), String> {
        let idx = self.pop_ss();
        let vm = self.vm_val();
        self.call_helper(forge_string_inc as *const u8 as i64, &[vm, idx], 0);
        let p = self.iconst(addr as i64);
        self.b.ins().store(MemFlags::new(), idx, p, 0);
        Ok(())
    }

    /// Bounds-checked indexed fetch: `index <array>` leaves the element.
    pub fn array_fetch(&mut self, count: u64, base: u64) -> Result<(), String> {
        let index = self.pop_ds();
        self.array_bounds_check(index, count)?;
        let offset = self.b.ins().ishl_imm(index, 3);
        let base_v = self.iconst(base as i64);
        let p = self.b.ins().iadd(base_v, offset);
        let v = self.b.ins().load(types::I64, MemFlags::new(), p, 0);
        self.push_ds(v);
        Ok(())
    }

    /// Bounds-checked indexed store: `value index TO <array>`.
    pub fn array_store(&mut self, count: u64, base: u64) -> Result<(), String> {
        let index = self.pop_ds();
        let value = self.pop_ds();
        self.array_bounds_check(index, count)?;
        let offset = self.b.ins().ishl_imm(index, 3);
        let base_v = self.iconst(base as i64);
        let p = self.b.ins().iadd(base_v, offset);
        self.b.ins().store(MemFlags::new(), value, p, 0);
        Ok(())
    }

    fn array_bounds_check(&mut self, index: Value, count: u64) -> Result<(), String> {
        let exit = self.function_exit()?;
        let limit = self.iconst(count as i64);
        let oob = self
            .b
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, index, limit);
        let trap = self.b.create_block();
        let ok = self.b.create_block();
        self.b.ins().brif(oob, trap, &[], ok, &[]);

        self.b.switch_to_block(trap);
        let vm = self.vm_val();
        self.call_helper(forge_array_trap as *const u8 as i64, &[vm], 0);
        self.b.ins().jump(exit, &[]);

        self.b.switch_to_block(ok);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integer arithmetic
    // ------------------------------------------------------------------

    pub fn gen_plus(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().iadd(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_minus(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().isub(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_star(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().imul(a, b);
        self.push_ds(r);
        Ok(())
    }

    // Signed 64-bit IDIV; a zero divisor traps in hardware, as the
    // interpreter documents.
    pub fn gen_slash(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().sdiv(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_mod(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().srem(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_negate(&mut self) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().ineg(a);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_invert(&mut self) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().bnot(a);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_abs(&mut self) -> Result<(), String> {
        let a = self.pop_ds();
        let neg = self.b.ins().ineg(a);
        let is_neg = self.b.ins().icmp_imm(IntCC::SignedLessThan, a, 0);
        let r = self.b.ins().select(is_neg, neg, a);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_min(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let lt = self.b.ins().icmp(IntCC::SignedLessThan, a, b);
        let r = self.b.ins().select(lt, a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_max(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let gt = self.b.ins().icmp(IntCC::SignedGreaterThan, a, b);
        let r = self.b.ins().select(gt, a, b);
        self.push_ds(r);
        Ok(())
    }

    /// WITHIN ( v lo hi -- ? ): -1 iff lo <= v < hi.
    pub fn gen_within(&mut self) -> Result<(), String> {
        let hi = self.pop_ds();
        let lo = self.pop_ds();
        let v = self.pop_ds();
        let ge = self.b.ins().icmp(IntCC::SignedGreaterThanOrEqual, v, lo);
        let lt = self.b.ins().icmp(IntCC::SignedLessThan, v, hi);
        let both = self.b.ins().band(ge, lt);
        let r = self.forth_bool(both);
        self.push_ds(r);
        Ok(())
    }

    /// Integer square root, Newton iteration on the data stack; no FPU.
    pub fn gen_sqrt(&mut self) -> Result<(), String> {
        let newton_step = |a: &mut Asm| -> Result<(), String> {
            // ( n x -- n x y )  with y = (n/x + x) / 2
            a.gen_over()?;
            a.gen_over()?;
            a.gen_slash()?;
            a.gen_over()?;
            a.gen_plus()?;
            a.gen_two_slash()
        };

        self.gen_dup()?;
        self.push_literal(2)?;
        self.gen_less()?;
        self.gen_if()?;
        // n < 2: n is its own root.
        self.gen_else()?;
        self.gen_dup()?;
        newton_step(self)?;
        self.gen_begin()?;
        self.gen_over()?;
        self.gen_over()?;
        self.gen_greater()?;
        self.gen_while()?;
        self.gen_nip()?;
        newton_step(self)?;
        self.gen_repeat()?;
        self.gen_drop()?;
        self.gen_nip()?;
        self.gen_then()
    }

    /// Euclidean GCD by repeated division: ( a b -- gcd ).
    pub fn gen_gcd(&mut self) -> Result<(), String> {
        self.gen_begin()?;
        self.gen_dup()?;
        self.gen_while()?;
        self.gen_tuck()?;
        self.gen_mod()?;
        self.gen_repeat()?;
        self.gen_drop()
    }

    // Optimised small adds, subtracts and shifts.

    fn add_imm(&mut self, n: i64) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().iadd_imm(a, n);
        self.push_ds(r);
        Ok(())
    }

    fn shl_imm(&mut self, n: i64) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().ishl_imm(a, n);
        self.push_ds(r);
        Ok(())
    }

    fn shr_imm(&mut self, n: i64) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().ushr_imm(a, n);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_one_plus(&mut self) -> Result<(), String> {
        self.add_imm(1)
    }

    pub fn gen_two_plus(&mut self) -> Result<(), String> {
        self.add_imm(2)
    }

    pub fn gen_sixteen_plus(&mut self) -> Result<(), String> {
        self.add_imm(16)
    }

    pub fn gen_one_minus(&mut self) -> Result<(), String> {
        self.add_imm(-1)
    }

    pub fn gen_two_minus(&mut self) -> Result<(), String> {
        self.add_imm(-2)
    }

    pub fn gen_sixteen_minus(&mut self) -> Result<(), String> {
        self.add_imm(-16)
    }

    pub fn gen_two_star(&mut self) -> Result<(), String> {
        self.shl_imm(1)
    }

    pub fn gen_four_star(&mut self) -> Result<(), String> {
        self.shl_imm(2)
    }

    pub fn gen_eight_star(&mut self) -> Result<(), String> {
        self.shl_imm(3)
    }

    pub fn gen_sixteen_star(&mut self) -> Result<(), String> {
        self.shl_imm(4)
    }

    /// 10* as (x<<3) + (x<<1), avoiding the multiplier.
    pub fn gen_ten_star(&mut self) -> Result<(), String> {
        let a = self.pop_ds();
        let x8 = self.b.ins().ishl_imm(a, 3);
        let x2 = self.b.ins().ishl_imm(a, 1);
        let r = self.b.ins().iadd(x8, x2);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_two_slash(&mut self) -> Result<(), String> {
        self.shr_imm(1)
    }

    pub fn gen_four_slash(&mut self) -> Result<(), String> {
        self.shr_imm(2)
    }

    pub fn gen_eight_slash(&mut self) -> Result<(), String> {
        self.shr_imm(3)
    }

    // ------------------------------------------------------------------
    // Comparison and logic
    // ------------------------------------------------------------------

    fn compare(&mut self, cc: IntCC) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let flag = self.b.ins().icmp(cc, a, b);
        let r = self.forth_bool(flag);
        self.push_ds(r);
        Ok(())
    }

    fn compare_zero(&mut self, cc: IntCC) -> Result<(), String> {
        let a = self.pop_ds();
        let flag = self.b.ins().icmp_imm(cc, a, 0);
        let r = self.forth_bool(flag);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_equals(&mut self) -> Result<(), String> {
        self.compare(IntCC::Equal)
    }

    pub fn gen_less(&mut self) -> Result<(), String> {
        self.compare(IntCC::SignedLessThan)
    }

    pub fn gen_greater(&mut self) -> Result<(), String> {
        self.compare(IntCC::SignedGreaterThan)
    }

    pub fn gen_zero_equals(&mut self) -> Result<(), String> {
        self.compare_zero(IntCC::Equal)
    }

    pub fn gen_zero_less(&mut self) -> Result<(), String> {
        self.compare_zero(IntCC::SignedLessThan)
    }

    pub fn gen_zero_greater(&mut self) -> Result<(), String> {
        self.compare_zero(IntCC::SignedGreaterThan)
    }

    /// Boolean NOT, distinct from bitwise INVERT.
    pub fn gen_not(&mut self) -> Result<(), String> {
        self.compare_zero(IntCC::Equal)
    }

    pub fn gen_and(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().band(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_or(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().bor(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_xor(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        let r = self.b.ins().bxor(a, b);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_true(&mut self) -> Result<(), String> {
        self.push_literal(-1)
    }

    pub fn gen_false(&mut self) -> Result<(), String> {
        self.push_literal(0)
    }

    // ------------------------------------------------------------------
    // Floating point (cells are IEEE-754 bit patterns on D)
    // ------------------------------------------------------------------

    pub fn gen_f_plus(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fadd(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_minus(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fsub(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_star(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fmul(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_slash(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fdiv(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    /// fmod as x - trunc(x/y)*y.
    pub fn gen_f_mod(&mut self) -> Result<(), String> {
        let y = self.pop_ds_f64();
        let x = self.pop_ds_f64();
        let q = self.b.ins().fdiv(x, y);
        let t = self.b.ins().trunc(q);
        let p = self.b.ins().fmul(t, y);
        let r = self.b.ins().fsub(x, p);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_sqrt(&mut self) -> Result<(), String> {
        let a = self.pop_ds_f64();
        let r = self.b.ins().sqrt(a);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_abs(&mut self) -> Result<(), String> {
        let a = self.pop_ds_f64();
        let r = self.b.ins().fabs(a);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_max(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fmax(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    pub fn gen_f_min(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let r = self.b.ins().fmin(a, b);
        self.push_ds_f64(r);
        Ok(())
    }

    fn f_compare(&mut self, cc: FloatCC) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let flag = self.b.ins().fcmp(cc, a, b);
        let r = self.forth_bool(flag);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_f_less(&mut self) -> Result<(), String> {
        self.f_compare(FloatCC::LessThan)
    }

    pub fn gen_f_greater(&mut self) -> Result<(), String> {
        self.f_compare(FloatCC::GreaterThan)
    }

    /// Approximate equality: |x - y| < 1e-9.
    pub fn gen_f_equals(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let d = self.b.ins().fsub(a, b);
        let ad = self.b.ins().fabs(d);
        let eps = self.b.ins().f64const(1e-9);
        let close = self.b.ins().fcmp(FloatCC::LessThan, ad, eps);
        let r = self.forth_bool(close);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_f_not_equals(&mut self) -> Result<(), String> {
        let b = self.pop_ds_f64();
        let a = self.pop_ds_f64();
        let d = self.b.ins().fsub(a, b);
        let ad = self.b.ins().fabs(d);
        let eps = self.b.ins().f64const(1e-9);
        let apart = self.b.ins().fcmp(FloatCC::GreaterThanOrEqual, ad, eps);
        let r = self.forth_bool(apart);
        self.push_ds(r);
        Ok(())
    }

    /// FLOAT ( n -- f ): integer cell to double bit pattern.
    pub fn gen_float(&mut self) -> Result<(), String> {
        let a = self.pop_ds();
        let r = self.b.ins().fcvt_from_sint(types::F64, a);
        self.push_ds_f64(r);
        Ok(())
    }

    /// INTEGER ( f -- n ): truncating conversion, saturating like CVTTSD2SI.
    pub fn gen_integer(&mut self) -> Result<(), String> {
        let a = self.pop_ds_f64();
        let r = self.b.ins().fcvt_to_sint_sat(types::I64, a);
        self.push_ds(r);
        Ok(())
    }

    pub fn gen_f_dot(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        self.call_helper(forge_print_double as *const u8 as i64, &[v], 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stack manipulation
    // ------------------------------------------------------------------

    pub fn gen_dup(&mut self) -> Result<(), String> {
        let a = self.peek_cell(self.slots.ds);
        self.push_ds(a);
        Ok(())
    }

    pub fn gen_drop(&mut self) -> Result<(), String> {
        let (slot_ptr, top) = self.load_top(self.slots.ds);
        let new_top = self.b.ins().iadd_imm(top, 8);
        self.b.ins().store(MemFlags::new(), new_top, slot_ptr, 0);
        Ok(())
    }

    pub fn gen_swap(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.ds);
        let a = self.b.ins().load(types::I64, MemFlags::new(), top, 0);
        let b = self.b.ins().load(types::I64, MemFlags::new(), top, 8);
        self.b.ins().store(MemFlags::new(), b, top, 0);
        self.b.ins().store(MemFlags::new(), a, top, 8);
        Ok(())
    }

    pub fn gen_over(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.ds);
        let second = self.b.ins().load(types::I64, MemFlags::new(), top, 8);
        self.push_ds(second);
        Ok(())
    }

    /// ( a b c -- b c a )
    pub fn gen_rot(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.ds);
        let c = self.b.ins().load(types::I64, MemFlags::new(), top, 0);
        let b = self.b.ins().load(types::I64, MemFlags::new(), top, 8);
        let a = self.b.ins().load(types::I64, MemFlags::new(), top, 16);
        self.b.ins().store(MemFlags::new(), a, top, 0);
        self.b.ins().store(MemFlags::new(), c, top, 8);
        self.b.ins().store(MemFlags::new(), b, top, 16);
        Ok(())
    }

    pub fn gen_nip(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let (_, top) = self.load_top(self.slots.ds);
        self.b.ins().store(MemFlags::new(), b, top, 0);
        Ok(())
    }

    /// ( a b -- b a b )
    pub fn gen_tuck(&mut self) -> Result<(), String> {
        let b = self.pop_ds();
        let a = self.pop_ds();
        self.push_ds(b);
        self.push_ds(a);
        self.push_ds(b);
        Ok(())
    }

    /// PICK ( ... n -- ... x ): copy the nth cell below the (popped) top.
    pub fn gen_pick(&mut self) -> Result<(), String> {
        let n = self.pop_ds();
        let (_, top) = self.load_top(self.slots.ds);
        let offset = self.b.ins().ishl_imm(n, 3);
        let p = self.b.ins().iadd(top, offset);
        let v = self.b.ins().load(types::I64, MemFlags::new(), p, 0);
        self.push_ds(v);
        Ok(())
    }

    pub fn gen_depth(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.ds);
        let ceiling = self.iconst(self.slots.ds_ceiling);
        let bytes = self.b.ins().isub(ceiling, top);
        let cells = self.b.ins().ushr_imm(bytes, 3);
        self.push_ds(cells);
        Ok(())
    }

    pub fn gen_to_r(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        self.push_rs(v);
        Ok(())
    }

    pub fn gen_r_from(&mut self) -> Result<(), String> {
        let v = self.pop_cell(self.slots.rs);
        self.push_ds(v);
        Ok(())
    }

    pub fn gen_r_fetch(&mut self) -> Result<(), String> {
        let v = self.peek_cell(self.slots.rs);
        self.push_ds(v);
        Ok(())
    }

    /// SP@ / SP: the live data-stack top pointer.
    pub fn gen_sp_fetch(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.ds);
        self.push_ds(top);
        Ok(())
    }

    pub fn gen_sp(&mut self) -> Result<(), String> {
        self.gen_sp_fetch()
    }

    pub fn gen_sp_store(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        let slot_ptr = self.iconst(self.slots.ds);
        self.b.ins().store(MemFlags::new(), v, slot_ptr, 0);
        Ok(())
    }

    pub fn gen_rp_fetch(&mut self) -> Result<(), String> {
        let (_, top) = self.load_top(self.slots.rs);
        self.push_ds(top);
        Ok(())
    }

    pub fn gen_rp_store(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        let slot_ptr = self.iconst(self.slots.rs);
        self.b.ins().store(MemFlags::new(), v, slot_ptr, 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn gen_fetch(&mut self) -> Result<(), String> {
        let addr = self.pop_ds();
        let v = self.b.ins().load(types::I64, MemFlags::new(), addr, 0);
        self.push_ds(v);
        Ok(())
    }

    pub fn gen_store(&mut self) -> Result<(), String> {
        let addr = self.pop_ds();
        let v = self.pop_ds();
        self.b.ins().store(MemFlags::new(), v, addr, 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // I/O and strings
    // ------------------------------------------------------------------

    pub fn gen_dot(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        self.call_helper(forge_print_decimal as *const u8 as i64, &[v], 0);
        Ok(())
    }

    pub fn gen_h_dot(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        self.call_helper(forge_print_hex as *const u8 as i64, &[v], 0);
        Ok(())
    }

    pub fn gen_emit(&mut self) -> Result<(), String> {
        let v = self.pop_ds();
        self.call_helper(forge_emit as *const u8 as i64, &[v], 0);
        Ok(())
    }

    pub fn gen_s_dot(&mut self) -> Result<(), String> {
        let idx = self.pop_ss();
        let vm = self.vm_val();
        self.call_helper(forge_print_string as *const u8 as i64, &[vm, idx], 0);
        Ok(())
    }

    pub fn gen_s_plus(&mut self) -> Result<(), String> {
        let b = self.pop_ss();
        let a = self.pop_ss();
        let vm = self.vm_val();
        let r = self
            .call_helper(forge_string_concat as *const u8 as i64, &[vm, a, b], 1)
            .ok_or("s+: helper returned nothing")?;
        self.push_ss(r);
        Ok(())
    }

    pub fn gen_s_equal(&mut self) -> Result<(), String> {
        let b = self.pop_ss();
        let a = self.pop_ss();
        let vm = self.vm_val();
        let r = self
            .call_helper(forge_string_equal as *const u8 as i64, &[vm, a, b], 1)
            .ok_or("s=: helper returned nothing")?;
        self.push_ds(r);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    pub fn gen_if(&mut self) -> Result<(), String> {
        let cond = self.pop_ds();
        let body = self.b.create_block();
        let tail = self.b.create_block();
        self.b.ins().brif(cond, body, &[], tail, &[]);
        self.b.switch_to_block(body);
        self.frames.push(ControlFrame::IfElse {
            tail,
            had_else: false,
        });
        Ok(())
    }

    pub fn gen_else(&mut self) -> Result<(), String> {
        match self.frames.pop() {
            Some(ControlFrame::IfElse {
                tail,
                had_else: false,
            }) => {
                let done = self.b.create_block();
                self.b.ins().jump(done, &[]);
                self.b.switch_to_block(tail);
                self.frames.push(ControlFrame::IfElse {
                    tail: done,
                    had_else: true,
                });
                Ok(())
            }
            Some(ControlFrame::IfElse { had_else: true, .. }) => {
                Err("ELSE: IF already has an ELSE".to_string())
            }
            Some(other) => {
                let kind = other.kind();
                self.frames.push(other);
                Err(format!("ELSE without IF (open {})", kind))
            }
            None => Err("ELSE without IF".to_string()),
        }
    }

    pub fn gen_then(&mut self) -> Result<(), String> {
        match self.frames.pop() {
            Some(ControlFrame::IfElse { tail, .. }) => {
                self.b.ins().jump(tail, &[]);
                self.b.switch_to_block(tail);
                Ok(())
            }
            Some(other) => {
                let kind = other.kind();
                self.frames.push(other);
                Err(format!("THEN without IF (open {})", kind))
            }
            None => Err("THEN without IF".to_string()),
        }
    }

    pub fn gen_begin(&mut self) -> Result<(), String> {
        let begin = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(begin, &[]);
        self.b.switch_to_block(begin);
        self.frames.push(ControlFrame::Begin { begin, exit });
        Ok(())
    }

    /// Back edge shared by AGAIN / REPEAT / LOOP. With loop checking on,
    /// the edge also polls the fault cell so a recorded fault can break
    /// an otherwise unbounded loop.
    fn back_edge(&mut self, begin: Block, exit: Block) {
        if self.loop_check {
            let fault_ptr = self.iconst(self.slots.fault);
            let fault = self.b.ins().load(types::I64, MemFlags::new(), fault_ptr, 0);
            self.b.ins().brif(fault, exit, &[], begin, &[]);
        } else {
            self.b.ins().jump(begin, &[]);
        }
    }

    fn pop_begin(&mut self, closer: &str) -> Result<(Block, Block), String> {
        match self.frames.pop() {
            Some(ControlFrame::Begin { begin, exit }) => Ok((begin, exit)),
            Some(other) => {
                let kind = other.kind();
                self.frames.push(other);
                Err(format!("{} without BEGIN (open {})", closer, kind))
            }
            None => Err(format!("{} without BEGIN", closer)),
        }
    }

    pub fn gen_again(&mut self) -> Result<(), String> {
        let (begin, exit) = self.pop_begin("AGAIN")?;
        self.back_edge(begin, exit);
        self.b.switch_to_block(exit);
        Ok(())
    }

    pub fn gen_until(&mut self) -> Result<(), String> {
        let (begin, exit) = self.pop_begin("UNTIL")?;
        let cond = self.pop_ds();
        self.b.ins().brif(cond, exit, &[], begin, &[]);
        self.b.switch_to_block(exit);
        Ok(())
    }

    pub fn gen_while(&mut self) -> Result<(), String> {
        let exit = match self.frames.last() {
            Some(ControlFrame::Begin { exit, .. }) => *exit,
            Some(other) => return Err(format!("WHILE without BEGIN (open {})", other.kind())),
            None => return Err("WHILE without BEGIN".to_string()),
        };
        let cond = self.pop_ds();
        let body = self.b.create_block();
        self.b.ins().brif(cond, body, &[], exit, &[]);
        self.b.switch_to_block(body);
        Ok(())
    }

    pub fn gen_repeat(&mut self) -> Result<(), String> {
        let (begin, exit) = self.pop_begin("REPEAT")?;
        self.back_edge(begin, exit);
        self.b.switch_to_block(exit);
        Ok(())
    }

    /// DO ( limit index -- ): counters move to the return stack with the
    /// index on top; `doLoopDepth` tracks nesting for I/J/K and EXIT.
    pub fn gen_do(&mut self) -> Result<(), String> {
        let index = self.pop_ds();
        let limit = self.pop_ds();
        self.push_rs(limit);
        self.push_rs(index);

        let body = self.b.create_block();
        let exit = self.b.create_block();
        self.b.ins().jump(body, &[]);
        self.b.switch_to_block(body);
        self.do_loop_depth += 1;
        self.frames.push(ControlFrame::DoLoop { body, exit });
        Ok(())
    }

    fn pop_do(&mut self, closer: &str) -> Result<(Block, Block), String> {
        match self.frames.pop() {
            Some(ControlFrame::DoLoop { body, exit }) => Ok((body, exit)),
            Some(other) => {
                let kind = other.kind();
                self.frames.push(other);
                Err(format!("{} without DO (open {})", closer, kind))
            }
            None => Err(format!("{} without DO", closer)),
        }
    }

    /// Branch back into the loop body, optionally via the fault poll.
    fn loop_back_edge(&mut self, cont: Value, body: Block, exit: Block) {
        if self.loop_check {
            let poll = self.b.create_block();
            self.b.ins().brif(cont, poll, &[], exit, &[]);
            self.b.switch_to_block(poll);
            let fault_ptr = self.iconst(self.slots.fault);
            let fault = self.b.ins().load(types::I64, MemFlags::new(), fault_ptr, 0);
            self.b.ins().brif(fault, exit, &[], body, &[]);
        } else {
            self.b.ins().brif(cont, body, &[], exit, &[]);
        }
    }

    pub fn gen_loop(&mut self) -> Result<(), String> {
        let (body, exit) = self.pop_do("LOOP")?;

        let (_, rs) = self.load_top(self.slots.rs);
        let index = self.b.ins().load(types::I64, MemFlags::new(), rs, 0);
        let limit = self.b.ins().load(types::I64, MemFlags::new(), rs, 8);
        let next = self.b.ins().iadd_imm(index, 1);
        self.b.ins().store(MemFlags::new(), next, rs, 0);
        let cont = self.b.ins().icmp(IntCC::SignedLessThan, next, limit);
        self.loop_back_edge(cont, body, exit);

        // LEAVE lands here too: drop index and limit.
        self.b.switch_to_block(exit);
        let (slot_ptr, rs) = self.load_top(self.slots.rs);
        let dropped = self.b.ins().iadd_imm(rs, 16);
        self.b.ins().store(MemFlags::new(), dropped, slot_ptr, 0);
        self.do_loop_depth -= 1;
        Ok(())
    }

    /// +LOOP: signed step; step > 0 loops while index < limit, otherwise
    /// while index >= limit.
    pub fn gen_plus_loop(&mut self) -> Result<(), String> {
        let (body, exit) = self.pop_do("+LOOP")?;

        let step = self.pop_ds();
        let (_, rs) = self.load_top(self.slots.rs);
        let index = self.b.ins().load(types::I64, MemFlags::new(), rs, 0);
        let limit = self.b.ins().load(types::I64, MemFlags::new(), rs, 8);
        let next = self.b.ins().iadd(index, step);
        self.b.ins().store(MemFlags::new(), next, rs, 0);

        let positive = self.b.ins().icmp_imm(IntCC::SignedGreaterThan, step, 0);
        let below = self.b.ins().icmp(IntCC::SignedLessThan, next, limit);
        let at_or_above = self
            .b
            .ins()
            .icmp(IntCC::SignedGreaterThanOrEqual, next, limit);
        let cont = self.b.ins().select(positive, below, at_or_above);
        self.loop_back_edge(cont, body, exit);

        self.b.switch_to_block(exit);
        let (slot_ptr, rs) = self.load_top(self.slots.rs);
        let dropped = self.b.ins().iadd_imm(rs, 16);
        self.b.ins().store(MemFlags::new(), dropped, slot_ptr, 0);
        self.do_loop_depth -= 1;
        Ok(())
    }

    fn loop_index(&mut self, offset: i32) -> Result<(), String> {
        let (_, rs) = self.load_top(self.slots.rs);
        let v = self.b.ins().load(types::I64, MemFlags::new(), rs, offset);
        self.push_ds(v);
        Ok(())
    }

    pub fn gen_i(&mut self) -> Result<(), String> {
        if self.do_loop_depth < 1 {
            return Err("I: no enclosing DO loop".to_string());
        }
        self.loop_index(0)
    }

    pub fn gen_j(&mut self) -> Result<(), String> {
        if self.do_loop_depth < 2 {
            return Err("J: not enough nested DO loops".to_string());
        }
        self.loop_index(24)
    }

    pub fn gen_k(&mut self) -> Result<(), String> {
        if self.do_loop_depth < 3 {
            return Err("K: not enough nested DO loops".to_string());
        }
        self.loop_index(40)
    }

    /// LEAVE: jump to the nearest DO or BEGIN exit.
    pub fn gen_leave(&mut self) -> Result<(), String> {
        let target = self
            .frames
            .iter()
            .rev()
            .find_map(|frame| match frame {
                ControlFrame::DoLoop { exit, .. } => Some(*exit),
                ControlFrame::Begin { exit, .. } => Some(*exit),
                _ => None,
            })
            .ok_or("LEAVE: no enclosing loop")?;
        self.b.ins().jump(target, &[]);
        // Emission continues in an unreachable block until the loop closer.
        let cont = self.b.create_block();
        self.b.switch_to_block(cont);
        Ok(())
    }

    /// EXIT: drop any enclosing DO frames' counters from R, then return.
    pub fn gen_exit(&mut self) -> Result<(), String> {
        if self.do_loop_depth > 0 {
            let (slot_ptr, rs) = self.load_top(self.slots.rs);
            let dropped = self.b.ins().iadd_imm(rs, 8 * self.do_loop_depth);
            self.b.ins().store(MemFlags::new(), dropped, slot_ptr, 0);
        }
        self.b.ins().return_(&[]);
        let cont = self.b.create_block();
        self.b.switch_to_block(cont);
        Ok(())
    }

    /// RECURSE: direct call to the word being compiled.
    pub fn gen_recurse(&mut self) -> Result<(), String> {
        let callee = self.module.declare_func_in_func(self.func_id, &mut self.b.func);
        let vm = self.vm_val();
        self.b.ins().call(callee, &[vm]);
        self.check_fault()
    }

    pub fn gen_case(&mut self) -> Result<(), String> {
        let selector = self.pop_ds();
        self.push_rs(selector);
        let end_case = self.b.create_block();
        self.frames.push(ControlFrame::Case {
            end_case,
            end_of: None,
        });
        Ok(())
    }

    pub fn gen_of(&mut self) -> Result<(), String> {
        let candidate = self.pop_ds();
        let selector = self.peek_cell(self.slots.rs);
        let differs = self.b.ins().icmp(IntCC::NotEqual, candidate, selector);
        let end_of = self.b.create_block();
        let body = self.b.create_block();
        match self.frames.last_mut() {
            Some(ControlFrame::Case { end_of: slot, .. }) => *slot = Some(end_of),
            Some(other) => return Err(format!("OF without CASE (open {})", other.kind())),
            None => return Err("OF without CASE".to_string()),
        }
        self.b.ins().brif(differs, end_of, &[], body, &[]);
        self.b.switch_to_block(body);
        Ok(())
    }

    pub fn gen_endof(&mut self) -> Result<(), String> {
        let (end_case, end_of) = match self.frames.last_mut() {
            Some(ControlFrame::Case { end_case, end_of }) => (*end_case, end_of.take()),
            Some(other) => return Err(format!("ENDOF without CASE (open {})", other.kind())),
            None => return Err("ENDOF without CASE".to_string()),
        };
        let end_of = end_of.ok_or("ENDOF without OF")?;
        self.b.ins().jump(end_case, &[]);
        self.b.switch_to_block(end_of);
        Ok(())
    }

    /// DEFAULT: marker between the last ENDOF and ENDCASE; the fall-through
    /// path is already positioned, so nothing is emitted.
    pub fn gen_default(&mut self) -> Result<(), String> {
        match self.frames.last() {
            Some(ControlFrame::Case { .. }) => Ok(()),
            Some(other) => Err(format!("DEFAULT without CASE (open {})", other.kind())),
            None => Err("DEFAULT without CASE".to_string()),
        }
    }

    pub fn gen_endcase(&mut self) -> Result<(), String> {
        let end_case = match self.frames.pop() {
            Some(ControlFrame::Case {
                end_of: Some(_), ..
            }) => {
                return Err("ENDCASE: OF without a matching ENDOF".to_string());
            }
            Some(ControlFrame::Case { end_case, .. }) => end_case,
            Some(other) => {
                let kind = other.kind();
                self.frames.push(other);
                return Err(format!("ENDCASE without CASE (open {})", kind));
            }
            None => return Err("ENDCASE without CASE".to_string()),
        };
        self.b.ins().jump(end_case, &[]);
        self.b.switch_to_block(end_case);
        // Drop the selector saved on R by CASE.
        let (slot_ptr, rs) = self.load_top(self.slots.rs);
        let dropped = self.b.ins().iadd_imm(rs, 8);
        self.b.ins().store(MemFlags::new(), dropped, slot_ptr, 0);
        Ok(())
    }

}

// ============================================================================
// STANDALONE FUNCTION BUILDERS
// ============================================================================

/// Everything the emitter needs from the machine, detached from it so a
/// compilation body may still borrow the machine (dictionary lookups,
/// immediate words).
#[derive(Clone)]
pub struct AsmEnv {
    slots: TopSlots,
    isa: cranelift::codegen::isa::OwnedTargetIsa,
    loop_check: bool,
    logging: bool,
}

impl AsmEnv {
    pub fn of(machine: &mut Machine) -> AsmEnv {
        AsmEnv {
            slots: machine.top_slots(),
            isa: machine.isa(),
            loop_check: machine.loop_check,
            logging: machine.logging,
        }
    }
}

/// Build one finalized word in a fresh module. The module is retained in
/// the returned `CodeUnit` so `forget` can release exactly this word's
/// executable pages.
pub fn with_asm<F>(env: AsmEnv, name: &str, body: F) -> Result<(WordFn, CodeUnit), String>
where
    F: FnOnce(&mut Asm) -> Result<(), String>,
{
    let AsmEnv {
        slots,
        isa,
        loop_check,
        logging,
    } = env;

    let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    let mut module = JITModule::new(builder);

    let pointer = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer));

    let func_id = module
        .declare_function(name, Linkage::Export, &sig)
        .map_err(|e| format!("failed to declare {}: {}", name, e))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;

    let mut builder_ctx = FunctionBuilderContext::new();
    let captured;
    {
        let mut fb = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        {
            let mut asm = Asm {
                b: &mut fb,
                module: &mut module,
                func_id,
                slots,
                call_conv,
                frames: Vec::new(),
                locals: Locals::default(),
                do_loop_depth: 0,
                loop_check,
                captured: Vec::new(),
            };
            body(&mut asm)?;
            captured = std::mem::take(&mut asm.captured);
        }
        fb.seal_all_blocks();
        fb.finalize();
    }

    if logging {
        println!("; ----- {} -----\n{}", name, ctx.func.display());
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| format!("failed to compile {}: {}", name, e))?;
    let code_bytes = ctx
        .compiled_code()
        .map(|c| c.code_buffer().len())
        .unwrap_or(0);
    module
        .finalize_definitions()
        .map_err(|e| format!("failed to finalize {}: {}", name, e))?;

    let code = module.get_finalized_function(func_id);
    let func: WordFn = unsafe { std::mem::transmute(code) };
    Ok((func, CodeUnit::new(name.to_string(), module, code_bytes, captured)))
}

/// Wrap a primitive's inline generator into a callable compiled form.
pub fn build_primitive(
    machine: &mut Machine,
    name: &str,
    gen: GenFn,
) -> Result<(WordFn, CodeUnit), String> {
    with_asm(AsmEnv::of(machine), name, |asm| {
        asm.prologue()?;
        gen(asm)?;
        asm.epilogue()
    })
}

/// VALUE/CONSTANT behavior: load the data cell onto D.
pub fn build_cell_loader(
    machine: &mut Machine,
    name: &str,
    addr: u64,
) -> Result<(WordFn, CodeUnit), String> {
    with_asm(AsmEnv::of(machine), name, |asm| {
        asm.prologue()?;
        let p = asm.iconst(addr as i64);
        let v = asm.b.ins().load(types::I64, MemFlags::new(), p, 0);
        asm.push_ds(v);
        asm.epilogue()
    })
}

/// VARIABLE behavior: push the address of the data cell.
pub fn build_variable_ref(
    machine: &mut Machine,
    name: &str,
    addr: u64,
) -> Result<(WordFn, CodeUnit), String> {
    with_asm(AsmEnv::of(machine), name, |asm| {
        asm.prologue()?;
        asm.push_literal(addr as i64)?;
        asm.epilogue()
    })
}

/// STRING behavior: push the stored string index onto S.
pub fn build_string_loader(
    machine: &mut Machine,
    name: &str,
    addr: u64,
) -> Result<(WordFn, CodeUnit), String> {
    with_asm(AsmEnv::of(machine), name, |asm| {
        asm.prologue()?;
        let p = asm.iconst(addr as i64);
        let v = asm.b.ins().load(types::I64, MemFlags::new(), p, 0);
        asm.push_ss(v);
        asm.epilogue()
    })
}

/// ARRAY behavior: bounds-checked indexed fetch from the payload.
pub fn build_array_fetch(
    machine: &mut Machine,
    name: &str,
    count: u64,
    base: u64,
) -> Result<(WordFn, CodeUnit), String> {
    with_asm(AsmEnv::of(machine), name, |asm| {
        asm.prologue()?;
        asm.array_fetch(count, base)?;
        asm.epilogue()
    })
}
