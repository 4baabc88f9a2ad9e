// interpreter.rs - Outer driver: interpret path and error recovery

use std::fs;

use crate::compiler;
use crate::jit::Asm;
use crate::lexer::{Lexer, Token};
use crate::machine::Machine;

/// Context handed to immediate behaviors. The cursor and token buffer are
/// explicit parameters rather than shared globals: an immediate word that
/// consumes following tokens records the position it advanced to in
/// `jumped`, and the driver resumes after it.
pub struct ImmediateCtx<'a, 'b, 'c> {
    pub machine: &'a mut Machine,
    pub tokens: &'a [Token],
    pub cursor: usize,
    pub jumped: Option<usize>,
    /// Present in compile mode only; immediate words that emit code fail
    /// cleanly when it is absent.
    pub asm: Option<&'a mut Asm<'b, 'c>>,
}

impl<'a, 'b, 'c> ImmediateCtx<'a, 'b, 'c> {
    pub fn asm(&mut self) -> Result<&mut Asm<'b, 'c>, String> {
        match &mut self.asm {
            Some(asm) => Ok(&mut **asm),
            None => Err("compile-only word used while interpreting".to_string()),
        }
    }

    pub fn next_token(&self) -> Result<&'a Token, String> {
        match self.tokens.get(self.cursor + 1) {
            Some(Token::End) | None => Err("unexpected end of input".to_string()),
            Some(token) => Ok(token),
        }
    }

    /// The following token as a name, consuming it.
    pub fn take_name(&mut self) -> Result<String, String> {
        let token = self.next_token()?;
        match token {
            Token::Word(w) => {
                self.jumped = Some(self.cursor + 1);
                Ok(w.clone())
            }
            other => Err(format!("expected a name, found: {}", other)),
        }
    }

    /// Mark the following token as consumed.
    pub fn consume_one(&mut self) {
        self.jumped = Some(self.cursor + 1);
    }
}

/// Tokenize and run one unit of source. On any error the emitter's
/// in-progress buffer has already been discarded (no entry is installed),
/// and all four stacks are reset before returning.
pub fn eval(machine: &mut Machine, source: &str) -> Result<(), String> {
    let result = Lexer::new(source, machine.strings.clone())
        .tokenize()
        .map_err(|e| e.to_string())
        .and_then(|tokens| interpret_tokens(machine, &tokens));

    if result.is_err() {
        machine.reset_stacks();
    }
    result
}

/// The interpret path. Numbers push, words dispatch to one of the entry's
/// behaviors, `:` hands the definition over to the compile path.
pub fn interpret_tokens(machine: &mut Machine, tokens: &[Token]) -> Result<(), String> {
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::End => break,

            Token::Integer(n) => {
                machine.push_ds(*n).map_err(|e| e.to_string())?;
            }
            Token::Float(x) => {
                machine.push_ds_f64(*x).map_err(|e| e.to_string())?;
            }
            Token::Str { index, .. } => {
                machine.push_ss(*index).map_err(|e| e.to_string())?;
            }

            Token::Compiling(':') => {
                i = compile_definition(machine, tokens, i)?;
                continue;
            }
            Token::Compiling(c) => {
                return Err(format!("{} without [", c));
            }
            Token::Interpreting(c) => {
                return Err(format!("{} without :", c));
            }

            Token::Word(w) => {
                let found = machine
                    .dict
                    .find(w)
                    .map(|e| (e.state, e.compiled, e.immediate_interp));

                let (state, compiled, immediate) = match found {
                    Some(entry) => entry,
                    None => return Err(format!("unknown word: {}", w)),
                };

                if state.compile_only() {
                    return Err(format!("{} is compile-only", w));
                }

                if let Some(f) = compiled {
                    machine.invoke(f)?;
                } else if let Some(imm) = immediate {
                    let mut ctx = ImmediateCtx {
                        machine,
                        tokens,
                        cursor: i,
                        jumped: None,
                        asm: None,
                    };
                    imm(&mut ctx)?;
                    if let Some(next) = ctx.jumped {
                        i = next;
                    }
                } else {
                    return Err(format!("{} cannot be interpreted", w));
                }
            }
        }
        i += 1;
    }
    Ok(())
}

/// `:` at interpret level: read the name, find the terminating `;`, and
/// compile the body. Returns the index just past the `;`.
fn compile_definition(
    machine: &mut Machine,
    tokens: &[Token],
    colon: usize,
) -> Result<usize, String> {
    let name = match tokens.get(colon + 1) {
        Some(Token::Word(w)) => w.clone(),
        Some(other) => return Err(format!("bad word name after ':': {}", other)),
        None => return Err("missing word name after ':'".to_string()),
    };

    let end = tokens[colon + 2..]
        .iter()
        .position(|t| matches!(t, Token::Interpreting(';')))
        .map(|p| colon + 2 + p)
        .ok_or_else(|| format!("missing ; in definition of {}", name))?;

    let body = &tokens[colon + 2..end];
    let source = render_source(&name, body);
    compiler::compile_word(machine, &name, body, &source)?;
    Ok(end + 1)
}

fn render_source(name: &str, body: &[Token]) -> String {
    let mut text = format!(": {}", name);
    for token in body {
        text.push(' ');
        text.push_str(&token.to_string());
    }
    text.push_str(" ;");
    text
}

/// Load `./start.f` once, interpreting it end to end. Later calls are
/// no-ops; a missing file is not an error.
pub fn load_startup(machine: &mut Machine) -> Result<(), String> {
    if machine.startup_loaded() {
        return Ok(());
    }
    match fs::read_to_string("./start.f") {
        Ok(text) => eval(machine, &text),
        Err(_) => Ok(()),
    }
}
