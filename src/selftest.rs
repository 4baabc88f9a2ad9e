// selftest.rs - Built-in scenario suite behind the *tests meta-command

use crate::interpreter;
use crate::machine::Machine;

enum Expect {
    Int(i64),
    Float(f64),
}

struct Scenario {
    lines: &'static [&'static str],
    expect: Expect,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        lines: &["16 16 +"],
        expect: Expect::Int(32),
    },
    Scenario {
        lines: &["3 5 <"],
        expect: Expect::Int(-1),
    },
    Scenario {
        lines: &["5 3 <"],
        expect: Expect::Int(0),
    },
    Scenario {
        lines: &[": fact dup 2 < if drop 1 exit then dup 1- recurse * ;", "5 fact"],
        expect: Expect::Int(120),
    },
    Scenario {
        lines: &[": doloop 0 11 1 do i + loop ;", "doloop"],
        expect: Expect::Int(55),
    },
    Scenario {
        lines: &[
            ": testcase case 1 of 10 endof 2 of 20 endof 3 of 30 endof default 40 endcase ;",
            "2 testcase",
        ],
        expect: Expect::Int(20),
    },
    Scenario {
        lines: &[
            ": testcase case 1 of 10 endof 2 of 20 endof 3 of 30 endof default 40 endcase ;",
            "99 testcase",
        ],
        expect: Expect::Int(40),
    },
    Scenario {
        lines: &["variable v 110 v ! v @"],
        expect: Expect::Int(110),
    },
    Scenario {
        lines: &["variable v 110 v !", "120 to v v @"],
        expect: Expect::Int(120),
    },
    Scenario {
        lines: &["2.0 2.0 f+"],
        expect: Expect::Float(4.0),
    },
    Scenario {
        lines: &["-3.0 fabs"],
        expect: Expect::Float(3.0),
    },
    Scenario {
        lines: &[": t { a b | c -- d } a b + to c c 2* to d ;", "10 6 t"],
        expect: Expect::Int(32),
    },
    Scenario {
        lines: &["48 18 gcd"],
        expect: Expect::Int(6),
    },
    Scenario {
        lines: &["144 sqrt"],
        expect: Expect::Int(12),
    },
];

/// Run every scenario against a fresh machine; returns (passed, failed).
pub fn run_basic_tests() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    for (n, scenario) in SCENARIOS.iter().enumerate() {
        let label = scenario.lines.join(" \\ ");
        match run_scenario(scenario) {
            Ok(None) => {
                println!("ok   {:2}: {}", n + 1, label);
                passed += 1;
            }
            Ok(Some(diff)) => {
                println!("FAIL {:2}: {} -> {}", n + 1, label, diff);
                failed += 1;
            }
            Err(e) => {
                println!("FAIL {:2}: {} -> {}", n + 1, label, e);
                failed += 1;
            }
        }
    }

    println!("{} passed, {} failed", passed, failed);
    (passed, failed)
}

fn run_scenario(scenario: &Scenario) -> Result<Option<String>, String> {
    let mut machine = Machine::new()?;
    for line in scenario.lines {
        interpreter::eval(&mut machine, line)?;
    }
    match scenario.expect {
        Expect::Int(want) => {
            let got = machine.pop_ds().map_err(|e| e.to_string())?;
            if got == want {
                Ok(None)
            } else {
                Ok(Some(format!("expected {}, got {}", want, got)))
            }
        }
        Expect::Float(want) => {
            let got = machine.pop_ds_f64().map_err(|e| e.to_string())?;
            if got == want {
                Ok(None)
            } else {
                Ok(Some(format!("expected {}, got {}", want, got)))
            }
        }
    }
}
