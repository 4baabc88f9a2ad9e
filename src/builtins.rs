// builtins.rs - Registers the base vocabulary into the dictionary

use std::io::{self, Write};

use crate::dictionary::{
    self, DataCell, GenFn, ImmFn, WordFn, WordState, ARRAY, CONSTANT, FLOAT, STRING, VALUE,
    VARIABLE,
};
use crate::interpreter::ImmediateCtx;
use crate::jit::{self, Asm};
use crate::lexer::Token;
use crate::machine::Machine;

/// Declares a free-function wrapper per generator method (entries hold
/// plain `fn` pointers valid for any future compilation) and yields the
/// name table.
macro_rules! generator_table {
    ($(($name:expr, $method:ident)),* $(,)?) => {{
        $(
            fn $method(asm: &mut Asm) -> Result<(), String> {
                Asm::$method(asm)
            }
        )*
        &[$(($name, $method as GenFn)),*]
    }};
}

/// Register every primitive. Each one carries both an inline generator and
/// a callable compiled form built by wrapping that generator in a
/// prologue/epilogue pair.
pub fn register(machine: &mut Machine) -> Result<(), String> {
    let gens: &[(&str, GenFn)] = generator_table![
        // arithmetic
        ("+", gen_plus),
        ("-", gen_minus),
        ("*", gen_star),
        ("/", gen_slash),
        ("MOD", gen_mod),
        ("NEGATE", gen_negate),
        ("INVERT", gen_invert),
        ("ABS", gen_abs),
        ("MIN", gen_min),
        ("MAX", gen_max),
        ("WITHIN", gen_within),
        ("sqrt", gen_sqrt),
        ("gcd", gen_gcd),
        ("1+", gen_one_plus),
        ("2+", gen_two_plus),
        ("16+", gen_sixteen_plus),
        ("1-", gen_one_minus),
        ("2-", gen_two_minus),
        ("16-", gen_sixteen_minus),
        ("2*", gen_two_star),
        ("4*", gen_four_star),
        ("8*", gen_eight_star),
        ("10*", gen_ten_star),
        ("16*", gen_sixteen_star),
        ("2/", gen_two_slash),
        ("4/", gen_four_slash),
        ("8/", gen_eight_slash),
        // floating point
        ("f+", gen_f_plus),
        ("f-", gen_f_minus),
        ("f*", gen_f_star),
        ("f/", gen_f_slash),
        ("fmod", gen_f_mod),
        ("fsqrt", gen_f_sqrt),
        ("fabs", gen_f_abs),
        ("fmax", gen_f_max),
        ("fmin", gen_f_min),
        ("f<", gen_f_less),
        ("f>", gen_f_greater),
        ("f=", gen_f_equals),
        ("f<>", gen_f_not_equals),
        ("f.", gen_f_dot),
        ("FLOAT", gen_float),
        ("INTEGER", gen_integer),
        // stack
        ("DUP", gen_dup),
        ("DROP", gen_drop),
        ("SWAP", gen_swap),
        ("OVER", gen_over),
        ("ROT", gen_rot),
        ("NIP", gen_nip),
        ("TUCK", gen_tuck),
        ("PICK", gen_pick),
        ("DEPTH", gen_depth),
        (">R", gen_to_r),
        ("R>", gen_r_from),
        ("R@", gen_r_fetch),
        ("RP@", gen_rp_fetch),
        ("RP!", gen_rp_store),
        ("SP", gen_sp),
        ("SP@", gen_sp_fetch),
        ("SP!", gen_sp_store),
        // memory
        ("@", gen_fetch),
        ("!", gen_store),
        // comparison and logic
        ("=", gen_equals),
        ("<", gen_less),
        (">", gen_greater),
        ("0=", gen_zero_equals),
        ("0<", gen_zero_less),
        ("0>", gen_zero_greater),
        ("NOT", gen_not),
        ("AND", gen_and),
        ("OR", gen_or),
        ("XOR", gen_xor),
        // I/O and strings
        (".", gen_dot),
        ("h.", gen_h_dot),
        ("emit", gen_emit),
        ("s.", gen_s_dot),
        ("s+", gen_s_plus),
        ("s=", gen_s_equal),
        // Forth booleans
        ("TRUE", gen_true),
        ("FALSE", gen_false),
    ];
    for &(name, gen) in gens {
        add_primitive(machine, name, gen)?;
        if name == "TRUE" || name == "FALSE" {
            mark_head(machine, CONSTANT, WordState::Normal);
        }
    }

    // Host-implemented compiled words.
    add_host(machine, ".s", jit::forge_show_stacks)?;
    add_host(machine, "words", jit::forge_words)?;

    // Control flow: compile-only immediate words.
    let controls: &[(&str, ImmFn)] = &[
        ("IF", imm_if),
        ("ELSE", imm_else),
        ("THEN", imm_then),
        ("BEGIN", imm_begin),
        ("UNTIL", imm_until),
        ("WHILE", imm_while),
        ("REPEAT", imm_repeat),
        ("AGAIN", imm_again),
        ("DO", imm_do),
        ("LOOP", imm_loop),
        ("+LOOP", imm_plus_loop),
        ("I", imm_i),
        ("J", imm_j),
        ("K", imm_k),
        ("LEAVE", imm_leave),
        ("EXIT", imm_exit),
        ("RECURSE", imm_recurse),
        ("CASE", imm_case),
        ("OF", imm_of),
        ("ENDOF", imm_endof),
        ("DEFAULT", imm_default),
        ("ENDCASE", imm_endcase),
        ("{", imm_left_brace),
        ("}", imm_right_brace),
    ];
    for &(name, imm) in controls {
        add_compile_only(machine, name, imm)?;
    }

    // Immediate words present in both modes.
    add_immediate_pair(machine, "to", to_compile, to_interp)?;
    add_immediate_pair(machine, "CHAR", char_compile, char_interp)?;
    add_immediate_pair(machine, ".\"", dot_quote_compile, dot_quote_interp)?;
    add_immediate_pair(machine, "s\"", s_quote_compile, s_quote_interp)?;
    // Defining words pop their initial value from the live stacks, so
    // they only make sense at interpret time (or behind [ ... ] inside a
    // definition). VARIABLE pops nothing and stays usable in both modes.
    add_interp_only(machine, "VALUE", def_value)?;
    add_interp_only(machine, "FVALUE", def_fvalue)?;
    add_interp_only(machine, "CONSTANT", def_constant)?;
    add_interp_only(machine, "FCONSTANT", def_fconstant)?;
    add_immediate_pair(machine, "VARIABLE", def_variable, def_variable)?;
    add_interp_only(machine, "STRING", def_string)?;
    add_interp_only(machine, "ARRAY", def_array)?;

    // Interpret-only meta words.
    add_interp_only(machine, "see", imm_see)?;
    add_interp_only(machine, "FORGET", imm_forget)?;

    Ok(())
}

// ============================================================================
// REGISTRATION HELPERS
// ============================================================================

fn add_primitive(machine: &mut Machine, name: &str, gen: GenFn) -> Result<(), String> {
    let (func, unit) = jit::build_primitive(machine, name, gen)?;
    machine
        .dict
        .add(name, Some(gen), Some(func), None, None, None)
        .map_err(|e| e.to_string())?;
    machine.code.push(unit);
    Ok(())
}

fn add_host(machine: &mut Machine, name: &str, func: WordFn) -> Result<(), String> {
    machine
        .dict
        .add(name, None, Some(func), None, None, None)
        .map_err(|e| e.to_string())
}

fn add_compile_only(machine: &mut Machine, name: &str, imm: ImmFn) -> Result<(), String> {
    machine
        .dict
        .add(name, None, None, Some(imm), None, None)
        .map_err(|e| e.to_string())?;
    mark_head(machine, dictionary::WORD, WordState::CompileOnlyImmediate);
    Ok(())
}

fn add_immediate_pair(
    machine: &mut Machine,
    name: &str,
    compile: ImmFn,
    interp: ImmFn,
) -> Result<(), String> {
    machine
        .dict
        .add(name, None, None, Some(compile), Some(interp), None)
        .map_err(|e| e.to_string())?;
    mark_head(machine, dictionary::WORD, WordState::Immediate);
    Ok(())
}

fn add_interp_only(machine: &mut Machine, name: &str, interp: ImmFn) -> Result<(), String> {
    machine
        .dict
        .add(name, None, None, None, Some(interp), None)
        .map_err(|e| e.to_string())?;
    mark_head(machine, dictionary::WORD, WordState::InterpretOnlyImmediate);
    Ok(())
}

fn mark_head(machine: &mut Machine, types: dictionary::WordType, state: WordState) {
    if let Some(head) = machine.dict.head_entry() {
        head.types = types;
        head.state = state;
    }
}

// ============================================================================
// CONTROL-FLOW IMMEDIATES
// ============================================================================

fn imm_if(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_if()
}

fn imm_else(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_else()
}

fn imm_then(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_then()
}

fn imm_begin(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_begin()
}

fn imm_until(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_until()
}

fn imm_while(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_while()
}

fn imm_repeat(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_repeat()
}

fn imm_again(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_again()
}

fn imm_do(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_do()
}

fn imm_loop(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_loop()
}

fn imm_plus_loop(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_plus_loop()
}

fn imm_i(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_i()
}

fn imm_j(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_j()
}

fn imm_k(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_k()
}

fn imm_leave(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_leave()
}

fn imm_exit(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_exit()
}

fn imm_recurse(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_recurse()
}

fn imm_case(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_case()
}

fn imm_of(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_of()
}

fn imm_endof(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_endof()
}

fn imm_default(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_default()
}

fn imm_endcase(ctx: &mut ImmediateCtx) -> Result<(), String> {
    ctx.asm()?.gen_endcase()
}

/// `{ args | mids -- rets }`: parse the declaration in three phases, then
/// emit the frame allocation.
fn imm_left_brace(ctx: &mut ImmediateCtx) -> Result<(), String> {
    enum Phase {
        Args,
        Mids,
        Rets,
    }

    let mut args = Vec::new();
    let mut mids = Vec::new();
    let mut rets = Vec::new();
    let mut phase = Phase::Args;

    let mut pos = ctx.cursor + 1;
    loop {
        match ctx.tokens.get(pos) {
            Some(Token::Word(w)) if w == "}" => break,
            Some(Token::Word(w)) if w == "|" => phase = Phase::Mids,
            Some(Token::Word(w)) if w == "--" => phase = Phase::Rets,
            Some(Token::Word(w)) => match phase {
                Phase::Args => args.push(w.clone()),
                Phase::Mids => mids.push(w.clone()),
                Phase::Rets => rets.push(w.clone()),
            },
            Some(other) => return Err(format!("bad local name: {}", other)),
            None => return Err("{ without matching }".to_string()),
        }
        pos += 1;
    }

    let asm = ctx.asm()?;
    asm.locals_enter(&args, &mids, &rets)?;
    ctx.jumped = Some(pos);
    Ok(())
}

/// `}` is consumed by `{`'s declaration parser; reaching it as a word is
/// a mismatch.
fn imm_right_brace(_ctx: &mut ImmediateCtx) -> Result<(), String> {
    Err("} without {".to_string())
}

// ============================================================================
// TO - store into locals, VALUEs, VARIABLEs, ARRAYs and STRINGs
// ============================================================================

struct ToTarget {
    types: dictionary::WordType,
    cell: u64,
    payload: u64,
    count: u64,
}

fn resolve_to_target(machine: &mut Machine, name: &str) -> Result<ToTarget, String> {
    let entry = machine
        .dict
        .find_mut(name)
        .ok_or_else(|| format!("unknown word in TO: {}", name))?;
    let types = entry.types;
    let count = entry.data.as_int().unwrap_or(0);
    let cell = entry.data_addr() as u64;
    let payload = entry.payload_addr() as u64;
    Ok(ToTarget {
        types,
        cell,
        payload,
        count,
    })
}

fn to_compile(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;

    // Locals shadow dictionary entries for TO.
    let local = ctx.asm.as_ref().and_then(|a| a.locals.find(&name));
    if let Some(offset) = local {
        return ctx.asm()?.store_local(offset);
    }

    let target = resolve_to_target(ctx.machine, &name)?;
    let asm = ctx.asm()?;
    if target.types & CONSTANT != 0 {
        Err(format!("TO cannot update constant: {}", name))
    } else if target.types & ARRAY != 0 {
        asm.array_store(target.count, target.payload)
    } else if target.types & STRING != 0 {
        asm.store_to_string_cell(target.cell)
    } else if target.types & (VALUE | VARIABLE) != 0 {
        asm.store_to_cell(target.cell)
    } else {
        Err(format!("TO target not writable: {}", name))
    }
}

fn to_interp(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let target = resolve_to_target(ctx.machine, &name)?;

    if target.types & CONSTANT != 0 {
        return Err(format!("TO cannot update constant: {}", name));
    }
    if target.types & ARRAY != 0 {
        let index = ctx.machine.pop_ds().map_err(|e| e.to_string())? as u64;
        if index >= target.count {
            return Err(format!("array index out of range: {}", name));
        }
        let value = ctx.machine.pop_ds().map_err(|e| e.to_string())?;
        unsafe { *(target.payload as *mut i64).add(index as usize) = value };
        return Ok(());
    }
    if target.types & STRING != 0 {
        let index = ctx.machine.pop_ss().map_err(|e| e.to_string())?;
        ctx.machine.strings.inc(index);
        unsafe { *(target.cell as *mut u64) = index as u64 };
        return Ok(());
    }
    if target.types & (VALUE | VARIABLE) != 0 {
        let value = ctx.machine.pop_ds().map_err(|e| e.to_string())?;
        unsafe { *(target.cell as *mut i64) = value };
        return Ok(());
    }
    Err(format!("TO target not writable: {}", name))
}

// ============================================================================
// CHAR AND THE QUOTE WORDS
// ============================================================================

fn char_value(ctx: &mut ImmediateCtx) -> Result<i64, String> {
    let token = ctx.next_token()?;
    let text = token.to_string();
    let ch = text.chars().next().ok_or("CHAR: missing character")?;
    ctx.consume_one();
    Ok(ch as i64)
}

fn char_compile(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let value = char_value(ctx)?;
    ctx.asm()?.push_literal(value)
}

fn char_interp(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let value = char_value(ctx)?;
    ctx.machine.push_ds(value).map_err(|e| e.to_string())
}

fn quoted_literal(ctx: &mut ImmediateCtx) -> Result<(usize, u64), String> {
    match ctx.next_token()? {
        Token::Str { index, addr } => {
            let (index, addr) = (*index, *addr);
            ctx.consume_one();
            Ok((index, addr))
        }
        other => Err(format!("expected a string literal, found: {}", other)),
    }
}

fn dot_quote_compile(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let (index, addr) = quoted_literal(ctx)?;
    ctx.machine.strings.inc(index);
    let asm = ctx.asm()?;
    asm.captured.push(index);
    asm.emit_prints(addr)
}

fn dot_quote_interp(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let (index, _) = quoted_literal(ctx)?;
    let text = ctx.machine.strings.get(index).map_err(|e| e.to_string())?;
    print!("{}", text);
    let _ = io::stdout().flush();
    Ok(())
}

fn s_quote_compile(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let (index, _) = quoted_literal(ctx)?;
    ctx.machine.strings.inc(index);
    let asm = ctx.asm()?;
    asm.captured.push(index);
    asm.push_string_index(index)
}

fn s_quote_interp(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let (index, _) = quoted_literal(ctx)?;
    ctx.machine.push_ss(index).map_err(|e| e.to_string())
}

// ============================================================================
// DEFINING WORDS
// ============================================================================

fn def_value(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let value = ctx.machine.pop_ds().map_err(|e| e.to_string())?;
    define_cell_word(ctx.machine, &name, VALUE, DataCell::int(value as u64))
}

fn def_fvalue(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let value = ctx.machine.pop_ds_f64().map_err(|e| e.to_string())?;
    define_cell_word(ctx.machine, &name, FLOAT | VALUE, DataCell::float(value))
}

fn def_constant(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let value = ctx.machine.pop_ds().map_err(|e| e.to_string())?;
    define_cell_word(ctx.machine, &name, CONSTANT, DataCell::int(value as u64))
}

fn def_fconstant(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let value = ctx.machine.pop_ds_f64().map_err(|e| e.to_string())?;
    define_cell_word(ctx.machine, &name, CONSTANT | FLOAT, DataCell::float(value))
}

/// VALUE/FVALUE/CONSTANT/FCONSTANT share their compiled form: load the
/// data cell onto D. Only the type flags (and TO's refusal) differ.
fn define_cell_word(
    machine: &mut Machine,
    name: &str,
    types: dictionary::WordType,
    data: DataCell,
) -> Result<(), String> {
    machine
        .dict
        .add(name, None, None, None, None, None)
        .map_err(|e| e.to_string())?;
    let addr = {
        let head = machine.dict.head_entry().ok_or("dictionary is empty")?;
        head.types = types;
        head.data = data;
        head.data_addr() as u64
    };
    let (func, unit) = jit::build_cell_loader(machine, name, addr)?;
    if let Some(head) = machine.dict.head_entry() {
        head.compiled = Some(func);
    }
    machine.code.push(unit);
    Ok(())
}

fn def_variable(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let machine = &mut *ctx.machine;
    machine
        .dict
        .add(&name, None, None, None, None, None)
        .map_err(|e| e.to_string())?;
    let addr = {
        let head = machine.dict.head_entry().ok_or("dictionary is empty")?;
        head.types = VARIABLE;
        head.data = DataCell::int(0);
        head.data_addr() as u64
    };
    let (func, unit) = jit::build_variable_ref(machine, &name, addr)?;
    if let Some(head) = machine.dict.head_entry() {
        head.compiled = Some(func);
    }
    machine.code.push(unit);
    Ok(())
}

fn def_string(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let machine = &mut *ctx.machine;
    let index = machine.pop_ss().map_err(|e| e.to_string())?;
    machine.strings.inc(index);
    machine
        .dict
        .add(&name, None, None, None, None, None)
        .map_err(|e| e.to_string())?;
    let addr = {
        let head = machine.dict.head_entry().ok_or("dictionary is empty")?;
        head.types = STRING;
        head.data = DataCell::int(index as u64);
        head.data_addr() as u64
    };
    let (func, mut unit) = jit::build_string_loader(machine, &name, addr)?;
    unit.strings.push(index);
    if let Some(head) = machine.dict.head_entry() {
        head.compiled = Some(func);
    }
    machine.code.push(unit);
    Ok(())
}

fn def_array(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let machine = &mut *ctx.machine;
    let count = machine.pop_ds().map_err(|e| e.to_string())?;
    if count <= 0 {
        return Err(format!("ARRAY: size must be positive, got {}", count));
    }

    machine
        .dict
        .add(&name, None, None, None, None, None)
        .map_err(|e| e.to_string())?;
    {
        let head = machine.dict.head_entry().ok_or("dictionary is empty")?;
        head.types = ARRAY;
        head.data = DataCell::int(count as u64);
    }
    machine
        .dict
        .allot(count as usize * 8)
        .map_err(|e| e.to_string())?;
    let base = machine
        .dict
        .head_entry()
        .ok_or("dictionary is empty")?
        .payload_addr() as u64;

    let (func, unit) = jit::build_array_fetch(machine, &name, count as u64, base)?;
    if let Some(head) = machine.dict.head_entry() {
        head.compiled = Some(func);
    }
    machine.code.push(unit);
    Ok(())
}

// ============================================================================
// META WORDS
// ============================================================================

fn imm_see(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.take_name()?;
    let report = ctx.machine.dict.display(&name, &ctx.machine.strings);
    println!("{}", report);
    Ok(())
}

fn imm_forget(ctx: &mut ImmediateCtx) -> Result<(), String> {
    let name = ctx.machine.forget_last()?;
    println!("forgot {}", name);
    Ok(())
}
