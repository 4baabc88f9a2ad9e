// compiler.rs - Compile path: token dispatch into the JIT generator

use crate::interpreter::{self, ImmediateCtx};
use crate::jit::{self, AsmEnv};
use crate::lexer::Token;
use crate::machine::Machine;

/// Compile the body of `: name ... ;` into a fresh native function and
/// install it as the new dictionary head. Nothing is installed unless the
/// whole body compiles; an error simply abandons the in-progress module.
pub fn compile_word(
    machine: &mut Machine,
    name: &str,
    body: &[Token],
    source: &str,
) -> Result<(), String> {
    if machine.dict.find(name).is_some() {
        return Err(format!("word already defined: {}", name));
    }

    let trace = machine.traced.contains(&name.to_lowercase());
    if trace {
        println!("compiling word: [{}]", name);
    }

    let env = AsmEnv::of(machine);
    let (func, unit) = jit::with_asm(env, name, |asm| {
        asm.prologue()?;

        let mut i = 0;
        while i < body.len() {
            let token = &body[i];
            if trace {
                println!("  [{}] token: {}", name, token);
            }

            match token {
                Token::End => break,

                Token::Integer(n) => asm.push_literal(*n)?,
                Token::Float(x) => asm.push_double(*x)?,

                Token::Str { index, .. } => {
                    // A bare literal (not consumed by a quote word) lands
                    // on the string stack; the emission captures it.
                    machine.strings.inc(*index);
                    asm.captured.push(*index);
                    asm.push_string_index(*index)?;
                }

                Token::Compiling(c) => {
                    return Err(format!("nested {} inside a definition", c));
                }

                Token::Interpreting('[') => {
                    i = interpret_bracket(machine, body, i)?;
                    continue;
                }

                Token::Interpreting(c) => {
                    return Err(format!("unexpected {} inside a definition", c));
                }

                Token::Word(w) => {
                    let found = machine
                        .dict
                        .find(w)
                        .map(|e| (e.state, e.generator, e.immediate_compile, e.compiled));

                    if let Some((state, generator, immediate, compiled)) = found {
                        if state.interpret_only() {
                            return Err(format!("{} is interpret-only", w));
                        }
                        if let Some(gen) = generator {
                            gen(asm)?;
                        } else if let Some(imm) = immediate {
                            let mut ctx = ImmediateCtx {
                                machine,
                                tokens: body,
                                cursor: i,
                                jumped: None,
                                asm: Some(asm),
                            };
                            imm(&mut ctx)?;
                            if let Some(next) = ctx.jumped {
                                i = next;
                            }
                        } else if let Some(target) = compiled {
                            asm.call_word(target)?;
                        } else {
                            return Err(format!("{} has no compilable behavior", w));
                        }
                    } else if let Some(offset) = asm.locals.find(w) {
                        if trace {
                            println!("  [{}] local {} at offset {}", name, w, offset);
                        }
                        asm.push_local(offset)?;
                    } else {
                        return Err(format!("unknown or uncompilable word: {}", w));
                    }
                }
            }
            i += 1;
        }

        asm.epilogue()
    })?;

    machine
        .dict
        .add(name, None, Some(func), None, None, Some(source))
        .map_err(|e| e.to_string())?;
    machine.code.push(unit);

    if trace {
        println!("compiled word: [{}]", name);
    }
    Ok(())
}

/// `[ ... ]` inside a definition: interpret the bracketed tokens
/// immediately, then resume compilation after the closing `]`.
fn interpret_bracket(
    machine: &mut Machine,
    body: &[Token],
    open: usize,
) -> Result<usize, String> {
    let close = body[open + 1..]
        .iter()
        .position(|t| matches!(t, Token::Compiling(']')))
        .map(|p| open + 1 + p)
        .ok_or("[ without matching ]")?;
    interpreter::interpret_tokens(machine, &body[open + 1..close])?;
    Ok(close + 1)
}

