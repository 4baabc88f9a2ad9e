// main.rs - Forge Forth REPL

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use forge::interpreter;
use forge::machine::Machine;
use forge::selftest;

fn main() {
    println!("Forge Forth v0.2.0 (Cranelift JIT)");
    println!("Type quit to exit");
    println!();

    let mut machine = match Machine::new() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = interpreter::load_startup(&mut machine) {
        eprintln!("start.f: {}", e);
    }

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("terminal error: {:?}", e);
            std::process::exit(1);
        }
    };

    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".forge_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    let mut accumulated = String::new();
    let mut compiling = false;

    loop {
        let prompt = if compiling { "] " } else { "> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if input.eq_ignore_ascii_case("quit") {
                    machine.reset_stacks();
                    break;
                }

                if input.starts_with('*') {
                    if handle_meta_command(&mut machine, input) {
                        break;
                    }
                    continue;
                }

                // Definitions may span lines; accumulate until balanced.
                for word in input.split_whitespace() {
                    match word {
                        ":" => compiling = true,
                        ";" => compiling = false,
                        _ => {}
                    }
                }
                if !accumulated.is_empty() {
                    accumulated.push(' ');
                }
                accumulated.push_str(input);

                if compiling {
                    continue;
                }

                let source = std::mem::take(&mut accumulated);
                match interpreter::eval(&mut machine, &source) {
                    Ok(()) => println!(" Ok"),
                    Err(e) => println!(" {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                accumulated.clear();
                compiling = false;
                machine.reset_stacks();
            }
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(e) => {
                eprintln!("error: {:?}", e);
                break;
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }
}

/// `*` meta-commands, case-insensitive. Returns true when the REPL should
/// exit.
fn handle_meta_command(machine: &mut Machine, input: &str) -> bool {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("").to_lowercase();
    let argument = parts.next();

    match command.as_str() {
        "*quit" => return true,
        "*mem" => println!("{}", machine.mem_report()),
        "*tests" => {
            selftest::run_basic_tests();
        }
        "*logging" => match argument {
            Some("on") | Some("ON") => {
                machine.logging = true;
                println!("logging ON");
            }
            Some("off") | Some("OFF") => {
                machine.logging = false;
                println!("logging OFF");
            }
            _ => eprintln!("usage: *logging on|off"),
        },
        "*loopcheck" => match argument {
            Some("on") | Some("ON") => {
                machine.loop_check = true;
                println!("loop checking ON");
            }
            Some("off") | Some("OFF") => {
                machine.loop_check = false;
                println!("loop checking OFF");
            }
            _ => eprintln!("usage: *loopcheck on|off"),
        },
        "*tron" => match argument {
            Some(word) => {
                machine.traced.insert(word.to_lowercase());
                println!("tracing enabled for: {}", word);
            }
            None => eprintln!("usage: *tron <word>"),
        },
        "*troff" => match argument {
            Some(word) => {
                machine.traced.remove(&word.to_lowercase());
                println!("tracing disabled for: {}", word);
            }
            None => eprintln!("usage: *troff <word>"),
        },
        "*dump" => match argument.and_then(parse_address) {
            Some(addr) => dump(addr),
            None => eprintln!("usage: *dump <addr>"),
        },
        "*strings" => {
            for (index, text, refs, addr) in machine.strings.list() {
                println!("[{}] (index: {}, refs: {}, addr: {:#x})", text, index, refs, addr);
            }
        }
        _ => {
            eprintln!("unknown command: {}", input);
        }
    }
    false
}

fn parse_address(text: &str) -> Option<usize> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<usize>().ok()
    }
}

/// Hex+ASCII dump of 32 bytes at `addr`. The address comes straight from
/// the user, so this is only as safe as what they typed.
fn dump(addr: usize) {
    let base = addr as *const u8;
    for row in 0..2 {
        let mut hex = String::new();
        let mut ascii = String::new();
        for col in 0..16 {
            let byte = unsafe { std::ptr::read_volatile(base.add(row * 16 + col)) };
            hex.push_str(&format!("{:02x} ", byte));
            ascii.push(if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            });
        }
        println!("{:08x}: {} {}", addr + row * 16, hex, ascii);
    }
}
