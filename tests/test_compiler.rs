// End-to-end tests: source text through the tokenizer, the compile or
// interpret path, and the JIT-compiled words themselves.

use forge::interpreter::eval;
use forge::machine::Machine;

fn machine() -> Machine {
    Machine::new().expect("machine")
}

fn run(lines: &[&str]) -> Machine {
    let mut m = machine();
    for line in lines {
        eval(&mut m, line).unwrap_or_else(|e| panic!("eval `{}` failed: {}", line, e));
    }
    m
}

fn top(m: &mut Machine) -> i64 {
    m.pop_ds().expect("data stack empty")
}

#[test]
fn test_compile_simple_word() {
    let mut m = run(&[": square dup * ;", "5 square"]);
    assert_eq!(top(&mut m), 25);
    assert_eq!(m.ds.depth(), 0);
}

#[test]
fn test_words_call_words() {
    let mut m = run(&[": square dup * ;", ": cube dup square * ;", "3 cube"]);
    assert_eq!(top(&mut m), 27);
}

#[test]
fn test_interpret_arithmetic() {
    let mut m = run(&["16 16 +"]);
    assert_eq!(top(&mut m), 32);
}

#[test]
fn test_comparisons_are_forth_booleans() {
    let mut m = run(&["3 5 <"]);
    assert_eq!(top(&mut m), -1);
    let mut m = run(&["5 3 <"]);
    assert_eq!(top(&mut m), 0);
    let mut m = run(&["7 7 ="]);
    assert_eq!(top(&mut m), -1);
}

#[test]
fn test_if_else_then() {
    let m = &mut run(&[": sign 0 < if -1 else 1 then ;"]);
    eval(m, "-5 sign").unwrap();
    assert_eq!(top(m), -1);
    eval(m, "5 sign").unwrap();
    assert_eq!(top(m), 1);
}

#[test]
fn test_if_without_else() {
    let m = &mut run(&[": clamp0 dup 0 < if drop 0 then ;"]);
    eval(m, "-3 clamp0").unwrap();
    assert_eq!(top(m), 0);
    eval(m, "9 clamp0").unwrap();
    assert_eq!(top(m), 9);
}

#[test]
fn test_begin_until() {
    let mut m = run(&[": count10 0 begin 1+ dup 10 = until ;", "count10"]);
    assert_eq!(top(&mut m), 10);
}

#[test]
fn test_begin_while_repeat() {
    // sum 1..n with an explicit counter pair
    let mut m = run(&[
        ": sumto 0 swap begin dup 0 > while tuck + swap 1- repeat drop ;",
        "10 sumto",
    ]);
    assert_eq!(top(&mut m), 55);
}

#[test]
fn test_do_loop() {
    let mut m = run(&[": doloop 0 11 1 do i + loop ;", "doloop"]);
    assert_eq!(top(&mut m), 55);
}

#[test]
fn test_plus_loop() {
    let mut m = run(&[": by2 0 10 0 do i + 2 +loop ;", "by2"]);
    assert_eq!(top(&mut m), 20);
}

#[test]
fn test_plus_loop_negative_step() {
    // 10 8 6 4 2 summed, stepping down to the limit
    let mut m = run(&[": down 0 0 10 do i + -2 +loop ;", "down"]);
    assert_eq!(top(&mut m), 30);
}

#[test]
fn test_leave() {
    let mut m = run(&[": partial 0 10 0 do i + i 3 = if leave then loop ;", "partial"]);
    assert_eq!(top(&mut m), 6);
}

#[test]
fn test_exit_and_recurse() {
    let mut m = run(&[
        ": fact dup 2 < if drop 1 exit then dup 1- recurse * ;",
        "5 fact",
    ]);
    assert_eq!(top(&mut m), 120);
    let mut m = run(&[
        ": fact dup 2 < if drop 1 exit then dup 1- recurse * ;",
        "1 fact",
    ]);
    assert_eq!(top(&mut m), 1);
}

#[test]
fn test_case_matches() {
    let def = ": testcase case 1 of 10 endof 2 of 20 endof 3 of 30 endof default 40 endcase ;";
    let m = &mut run(&[def]);
    eval(m, "2 testcase").unwrap();
    assert_eq!(top(m), 20);
    eval(m, "99 testcase").unwrap();
    assert_eq!(top(m), 40);
    eval(m, "1 testcase").unwrap();
    assert_eq!(top(m), 10);
    assert_eq!(m.rs.depth(), 0);
}

#[test]
fn test_return_stack_words() {
    let mut m = run(&[": rr 5 >r r@ r> + ;", "rr"]);
    assert_eq!(top(&mut m), 10);
    assert_eq!(m.rs.depth(), 0);
}

#[test]
fn test_locals_frame() {
    let mut m = run(&[": t { a b | c -- d } a b + to c c 2* to d ;", "10 6 t"]);
    assert_eq!(top(&mut m), 32);
    assert_eq!(m.ls.depth(), 0);
}

#[test]
fn test_locals_arg_order() {
    // bottom-most argument binds first
    let m = &mut run(&[": first { a b -- r } a to r ;"]);
    eval(m, "10 6 first").unwrap();
    assert_eq!(top(m), 10);
}

#[test]
fn test_locals_ret_count() {
    let m = &mut run(&[": pair { a -- x y } a to x a 1+ to y ;"]);
    eval(m, "7 pair").unwrap();
    assert_eq!(top(m), 8);
    assert_eq!(top(m), 7);
    assert_eq!(m.ds.depth(), 0);
}

#[test]
fn test_variable_store_fetch() {
    let m = &mut run(&["variable v 110 v ! v @"]);
    assert_eq!(top(m), 110);
    eval(m, "120 to v v @").unwrap();
    assert_eq!(top(m), 120);
}

#[test]
fn test_value_and_to() {
    let m = &mut run(&["42 value answer"]);
    eval(m, "answer").unwrap();
    assert_eq!(top(m), 42);
    eval(m, "99 to answer answer").unwrap();
    assert_eq!(top(m), 99);
}

#[test]
fn test_value_inside_definition() {
    let m = &mut run(&["42 value answer", ": probe answer 1+ ;", "probe"]);
    assert_eq!(top(m), 43);
    eval(m, "50 to answer probe").unwrap();
    assert_eq!(top(m), 51);
}

#[test]
fn test_constant_rejects_to() {
    let m = &mut run(&["7 constant seven"]);
    eval(m, "seven").unwrap();
    assert_eq!(top(m), 7);
    let err = eval(m, "8 to seven").unwrap_err();
    assert!(err.contains("constant"), "unexpected error: {}", err);
}

#[test]
fn test_array_fetch_and_store() {
    let m = &mut run(&["4 array tbl"]);
    eval(m, "7 2 to tbl").unwrap();
    eval(m, "2 tbl").unwrap();
    assert_eq!(top(m), 7);
    // untouched slots read as zero
    eval(m, "0 tbl").unwrap();
    assert_eq!(top(m), 0);
}

#[test]
fn test_array_bounds_trap() {
    let m = &mut run(&["4 array tbl"]);
    let err = eval(m, "9 tbl").unwrap_err();
    assert!(err.contains("array"), "unexpected error: {}", err);
    // recovery reset the stacks
    assert_eq!(m.ds.depth(), 0);
}

#[test]
fn test_array_store_in_definition() {
    let m = &mut run(&["4 array tbl", ": put 3 to tbl ;", "11 put", "3 tbl"]);
    assert_eq!(top(m), 11);
}

#[test]
fn test_float_arithmetic() {
    let mut m = run(&["2.0 2.0 f+"]);
    assert_eq!(m.pop_ds_f64().unwrap(), 4.0);
    let mut m = run(&["-3.0 fabs"]);
    assert_eq!(m.pop_ds_f64().unwrap(), 3.0);
}

#[test]
fn test_float_epsilon_compare() {
    let mut m = run(&["1.5 1.5 f="]);
    assert_eq!(top(&mut m), -1);
    let mut m = run(&["1.5 1.6 f="]);
    assert_eq!(top(&mut m), 0);
    let mut m = run(&["1.5 1.6 f<>"]);
    assert_eq!(top(&mut m), -1);
}

#[test]
fn test_float_conversions() {
    let mut m = run(&["3 FLOAT 2.0 f* INTEGER"]);
    assert_eq!(top(&mut m), 6);
}

#[test]
fn test_float_in_compiled_word() {
    let mut m = run(&[": halve 2.0 f/ ;", "9.0 halve"]);
    assert_eq!(m.pop_ds_f64().unwrap(), 4.5);
}

#[test]
fn test_string_equality() {
    let mut m = run(&["s\" abc\" s\" abc\" s="]);
    assert_eq!(top(&mut m), -1);
    let mut m = run(&["s\" abc\" s\" abd\" s="]);
    assert_eq!(top(&mut m), 0);
}

#[test]
fn test_string_value_word() {
    let mut m = run(&["s\" hello\" string greeting", "greeting s\" hello\" s="]);
    assert_eq!(top(&mut m), -1);
}

#[test]
fn test_char() {
    let mut m = run(&["char a"]);
    assert_eq!(top(&mut m), 97);
    let mut m = run(&[": letter char Q ;", "letter"]);
    assert_eq!(top(&mut m), 81);
}

#[test]
fn test_forget() {
    let m = &mut run(&[": gone 1 ;"]);
    eval(m, "gone").unwrap();
    assert_eq!(top(m), 1);
    eval(m, "FORGET").unwrap();
    let err = eval(m, "gone").unwrap_err();
    assert!(err.contains("unknown word"), "unexpected error: {}", err);
}

#[test]
fn test_redefinition_rejected() {
    let m = &mut run(&[": x 1 ;"]);
    let err = eval(m, ": x 2 ;").unwrap_err();
    assert!(err.contains("already defined"), "unexpected error: {}", err);
    // the original survives
    eval(m, "x").unwrap();
    assert_eq!(top(m), 1);
}

#[test]
fn test_unknown_word() {
    let m = &mut machine();
    let err = eval(m, "no-such-word").unwrap_err();
    assert!(err.contains("unknown word"), "unexpected error: {}", err);
}

#[test]
fn test_compile_only_at_interpret() {
    let m = &mut machine();
    let err = eval(m, "5 if").unwrap_err();
    assert!(err.contains("compile-only"), "unexpected error: {}", err);
}

#[test]
fn test_defining_words_rejected_in_definition() {
    // Defining words pop the live stack, so they must not run while a
    // body is being compiled; only [ ... ] reaches them safely.
    let m = &mut machine();
    let err = eval(m, ": bad 5 value x ;").unwrap_err();
    assert!(err.contains("interpret-only"), "unexpected error: {}", err);
    assert!(eval(m, "bad").is_err());

    let err = eval(m, ": bad2 4 array tbl ;").unwrap_err();
    assert!(err.contains("interpret-only"), "unexpected error: {}", err);
    let err = eval(m, ": bad3 7 constant c ;").unwrap_err();
    assert!(err.contains("interpret-only"), "unexpected error: {}", err);
}

#[test]
fn test_control_mismatch() {
    let m = &mut machine();
    assert!(eval(m, ": bad then ;").is_err());
    assert!(eval(m, ": bad2 if ;").is_err());
    assert!(eval(m, ": bad3 begin loop ;").is_err());
    // nothing was installed
    assert!(eval(m, "bad").is_err());
}

#[test]
fn test_error_resets_stacks() {
    let m = &mut machine();
    let _ = eval(m, "1 2 3 no-such-word");
    assert_eq!(m.ds.depth(), 0);
}

#[test]
fn test_bracket_interpretation() {
    // [ ... ] interprets during a definition; the VALUE created inside is
    // visible to the rest of the body.
    let mut m = run(&[": k [ 30 value thirty ] thirty 1+ ;", "k"]);
    assert_eq!(top(&mut m), 31);
}

#[test]
fn test_definition_spanning_lines() {
    let mut m = run(&[": add3\n  1 +\n  2 + ;", "10 add3"]);
    assert_eq!(top(&mut m), 13);
}

#[test]
fn test_label_stack_balanced_after_nesting() {
    let mut m = run(&[
        ": grid 0 3 0 do 4 0 do 1 + loop loop ;",
        "grid",
    ]);
    assert_eq!(top(&mut m), 12);
    assert_eq!(m.rs.depth(), 0);
}

#[test]
fn test_comments_in_definition() {
    let mut m = run(&[": twice ( n -- 2n ) 2* ;", "21 twice"]);
    assert_eq!(top(&mut m), 42);
}
