// Primitive coverage and the arithmetic identities the generator must
// preserve, exercised through the interpret path (every primitive runs as
// its JIT-compiled form).

use forge::interpreter::eval;
use forge::machine::Machine;

fn machine() -> Machine {
    Machine::new().expect("machine")
}

fn eval_top(m: &mut Machine, line: &str) -> i64 {
    eval(m, line).unwrap_or_else(|e| panic!("eval `{}` failed: {}", line, e));
    m.pop_ds().expect("data stack empty")
}

#[test]
fn test_stack_shuffles() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "1 2 swap"), 1);
    m.reset_stacks();
    assert_eq!(eval_top(m, "1 2 over"), 1);
    m.reset_stacks();
    assert_eq!(eval_top(m, "10 20 30 rot"), 10);
    m.reset_stacks();
    assert_eq!(eval_top(m, "1 2 nip"), 2);
    assert_eq!(m.ds.depth(), 0);
    assert_eq!(eval_top(m, "1 2 tuck"), 2);
    m.reset_stacks();
    assert_eq!(eval_top(m, "1 2 3 2 pick"), 1);
    m.reset_stacks();
    assert_eq!(eval_top(m, "1 2 3 depth"), 3);
    m.reset_stacks();
}

#[test]
fn test_dup_drop() {
    let m = &mut machine();
    eval(m, "42 dup").unwrap();
    assert_eq!(m.pop_ds().unwrap(), 42);
    assert_eq!(m.pop_ds().unwrap(), 42);
    eval(m, "1 2 drop").unwrap();
    assert_eq!(m.pop_ds().unwrap(), 1);
}

#[test]
fn test_division_and_mod() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "17 5 /"), 3);
    assert_eq!(eval_top(m, "17 5 MOD"), 2);
    // IDIV truncates toward zero
    assert_eq!(eval_top(m, "-17 5 /"), -3);
    assert_eq!(eval_top(m, "-17 5 MOD"), -2);
}

#[test]
fn test_quotient_remainder_identity() {
    let m = &mut machine();
    for &(a, b) in &[(17i64, 5i64), (-17, 5), (17, -5), (-100, 7), (0, 3)] {
        let line = format!("{} {} / {} * {} {} MOD +", a, b, b, a, b);
        assert_eq!(eval_top(m, &line), a, "identity failed for {}/{}", a, b);
    }
}

#[test]
fn test_shift_multiply_equivalence() {
    let m = &mut machine();
    for &n in &[0i64, 1, 7, 1000, -8, i64::MAX / 2, -1] {
        for &(word, k) in &[("2*", 2i64), ("4*", 4), ("8*", 8), ("16*", 16)] {
            let shifted = eval_top(m, &format!("{} {}", n, word));
            let multiplied = eval_top(m, &format!("{} {} *", n, k));
            assert_eq!(shifted, multiplied, "{} {}", n, word);
        }
    }
}

#[test]
fn test_ten_star() {
    let m = &mut machine();
    for &n in &[0i64, 7, -3, 123456] {
        assert_eq!(eval_top(m, &format!("{} 10*", n)), n.wrapping_mul(10));
    }
}

#[test]
fn test_logical_right_shifts() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "16 2/"), 8);
    assert_eq!(eval_top(m, "16 4/"), 4);
    assert_eq!(eval_top(m, "16 8/"), 2);
    // logical, not arithmetic: the sign bit shifts in as zero
    assert_eq!(eval_top(m, "-2 2/"), i64::MAX);
}

#[test]
fn test_inc_dec() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "5 1+"), 6);
    assert_eq!(eval_top(m, "5 2+"), 7);
    assert_eq!(eval_top(m, "5 16+"), 21);
    assert_eq!(eval_top(m, "5 1-"), 4);
    assert_eq!(eval_top(m, "5 2-"), 3);
    assert_eq!(eval_top(m, "21 16-"), 5);
}

#[test]
fn test_inc_dec_round_trip() {
    let m = &mut machine();
    for &n in &[0i64, -5, 1 << 40, i64::MAX] {
        assert_eq!(eval_top(m, &format!("{} 1+ 1-", n)), n);
        assert_eq!(eval_top(m, &format!("{} NEGATE NEGATE", n)), n);
    }
}

#[test]
fn test_wrap_around() {
    let m = &mut machine();
    let max = i64::MAX;
    assert_eq!(eval_top(m, &format!("{} 1+", max)), i64::MIN);
    assert_eq!(eval_top(m, &format!("{} {} +", max, max)), max.wrapping_add(max));
}

#[test]
fn test_negate_abs_invert() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "5 NEGATE"), -5);
    assert_eq!(eval_top(m, "-8 ABS"), 8);
    assert_eq!(eval_top(m, "8 ABS"), 8);
    assert_eq!(eval_top(m, "0 INVERT"), -1);
    assert_eq!(eval_top(m, "-1 INVERT"), 0);
}

#[test]
fn test_min_max_within() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "3 9 MIN"), 3);
    assert_eq!(eval_top(m, "3 9 MAX"), 9);
    assert_eq!(eval_top(m, "5 1 10 WITHIN"), -1);
    assert_eq!(eval_top(m, "1 1 10 WITHIN"), -1);
    assert_eq!(eval_top(m, "10 1 10 WITHIN"), 0);
    assert_eq!(eval_top(m, "0 1 10 WITHIN"), 0);
}

#[test]
fn test_bitwise_and_booleans() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "12 10 AND"), 8);
    assert_eq!(eval_top(m, "12 10 OR"), 14);
    assert_eq!(eval_top(m, "12 10 XOR"), 6);
    assert_eq!(eval_top(m, "0 NOT"), -1);
    assert_eq!(eval_top(m, "5 NOT"), 0);
    assert_eq!(eval_top(m, "TRUE"), -1);
    assert_eq!(eval_top(m, "FALSE"), 0);
}

#[test]
fn test_zero_comparisons() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "0 0="), -1);
    assert_eq!(eval_top(m, "3 0="), 0);
    assert_eq!(eval_top(m, "-3 0<"), -1);
    assert_eq!(eval_top(m, "3 0<"), 0);
    assert_eq!(eval_top(m, "3 0>"), -1);
    assert_eq!(eval_top(m, "-3 0>"), 0);
}

#[test]
fn test_integer_sqrt() {
    let m = &mut machine();
    for &(n, root) in &[
        (0i64, 0i64),
        (1, 1),
        (2, 1),
        (3, 1),
        (4, 2),
        (15, 3),
        (16, 4),
        (17, 4),
        (144, 12),
        (1_000_000, 1000),
    ] {
        assert_eq!(eval_top(m, &format!("{} sqrt", n)), root, "sqrt {}", n);
    }
}

#[test]
fn test_gcd() {
    let m = &mut machine();
    for &(a, b, g) in &[(48i64, 18i64, 6i64), (18, 48, 6), (7, 13, 1), (10, 0, 10)] {
        assert_eq!(eval_top(m, &format!("{} {} gcd", a, b)), g, "gcd {} {}", a, b);
    }
}

#[test]
fn test_float_min_max_mod() {
    let m = &mut machine();
    eval(m, "2.5 1.5 fmin").unwrap();
    assert_eq!(m.pop_ds_f64().unwrap(), 1.5);
    eval(m, "2.5 1.5 fmax").unwrap();
    assert_eq!(m.pop_ds_f64().unwrap(), 2.5);
    eval(m, "7.5 2.0 fmod").unwrap();
    assert_eq!(m.pop_ds_f64().unwrap(), 1.5);
    eval(m, "9.0 fsqrt").unwrap();
    assert_eq!(m.pop_ds_f64().unwrap(), 3.0);
}

#[test]
fn test_float_compare() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "1.0 2.0 f<"), -1);
    assert_eq!(eval_top(m, "2.0 1.0 f<"), 0);
    assert_eq!(eval_top(m, "2.0 1.0 f>"), -1);
}

#[test]
fn test_sp_and_rp_observers() {
    let m = &mut machine();
    // depth grows by one after SP@ pushes the old top
    eval(m, "1 2 SP@").unwrap();
    let p = m.pop_ds().unwrap();
    assert_ne!(p, 0);
    assert_eq!(m.ds.depth(), 2);
    m.reset_stacks();
    eval(m, "RP@").unwrap();
    assert_ne!(m.pop_ds().unwrap(), 0);
}

#[test]
fn test_memory_fetch_store() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "variable cell0 5150 cell0 ! cell0 @"), 5150);
}

#[test]
fn test_case_insensitive_lookup() {
    let m = &mut machine();
    assert_eq!(eval_top(m, "2 3 Min"), 2);
    assert_eq!(eval_top(m, "2 3 mIN"), 2);
    assert_eq!(eval_top(m, "5 dUp +"), 10);
}
