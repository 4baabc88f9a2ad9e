use forge::dictionary::{pretty_source, Dictionary, WordState, CONSTANT, FLOAT, VALUE};
use forge::interpreter::eval;
use forge::machine::Machine;
use forge::strings::StringTable;

#[test]
fn test_add_then_forget_restores_previous() {
    let mut d = Dictionary::new(64 * 1024);
    d.add("alpha", None, None, None, None, None).unwrap();
    d.add("beta", None, None, None, None, None).unwrap();

    assert!(d.find("alpha").is_some());
    assert!(d.find("beta").is_some());

    assert_eq!(d.forget().unwrap(), "beta");
    assert!(d.find("beta").is_none());
    assert!(d.find("alpha").is_some());
}

#[test]
fn test_names_youngest_first() {
    let mut d = Dictionary::new(64 * 1024);
    d.add("first", None, None, None, None, None).unwrap();
    d.add("second", None, None, None, None, None).unwrap();
    let names = d.names();
    assert_eq!(names[0], "second");
    assert_eq!(names[1], "first");
}

#[test]
fn test_shadowing_finds_youngest() {
    let mut d = Dictionary::new(64 * 1024);
    d.add("dup", None, None, None, None, None).unwrap();
    if let Some(head) = d.head_entry() {
        head.types = CONSTANT;
    }
    d.add("dup", None, None, None, None, None).unwrap();
    if let Some(head) = d.head_entry() {
        head.types = FLOAT | VALUE;
    }
    assert_eq!(d.find("dup").unwrap().types, FLOAT | VALUE);
    d.forget().unwrap();
    assert_eq!(d.find("dup").unwrap().types, CONSTANT);
}

#[test]
fn test_state_predicates() {
    assert!(WordState::Immediate.is_immediate());
    assert!(WordState::CompileOnlyImmediate.is_immediate());
    assert!(WordState::CompileOnlyImmediate.compile_only());
    assert!(WordState::InterpretOnlyImmediate.interpret_only());
    assert!(!WordState::Normal.is_immediate());
}

#[test]
fn test_display_reports_flags_and_source() {
    let mut d = Dictionary::new(64 * 1024);
    let strings = StringTable::new();
    d.add("square", None, None, None, None, Some(": square dup * ;"))
        .unwrap();
    let report = d.display("square", &strings);
    assert!(report.contains("name      : square"));
    assert!(report.contains("state     : NORMAL"));
    assert!(report.contains(": square dup *"));

    assert_eq!(d.display("missing", &strings), "missing ?");
}

#[test]
fn test_pretty_source_indents() {
    let pretty = pretty_source(": doloop 0 11 1 do i + loop ;");
    let lines: Vec<&str> = pretty.lines().collect();
    // the loop body sits one level deeper than the do
    let do_line = lines.iter().position(|l| l.trim() == "do").unwrap();
    let body = lines[do_line + 1];
    assert!(body.starts_with("    "), "body not indented: {:?}", body);
}

#[test]
fn test_machine_see_after_definition() {
    let mut m = Machine::new().unwrap();
    eval(&mut m, ": square dup * ;").unwrap();
    let report = m.dict.display("square", &m.strings);
    assert!(report.contains("compiled  : 0x"));
    assert!(report.contains("source    :"));
}

#[test]
fn test_forget_through_machine_releases_code() {
    let mut m = Machine::new().unwrap();
    eval(&mut m, ": temp 1 2 + ;").unwrap();
    let units_before = m.code.len();
    eval(&mut m, "FORGET").unwrap();
    assert_eq!(m.code.len(), units_before - 1);
    assert!(m.dict.find("temp").is_none());
}

#[test]
fn test_string_word_refcount_released_on_forget() {
    let mut m = Machine::new().unwrap();
    eval(&mut m, "s\" keepsake\" string souvenir").unwrap();
    let index = {
        let list = m.strings.list();
        list.iter()
            .find(|(_, text, _, _)| text == "keepsake")
            .map(|(i, _, _, _)| *i)
            .unwrap()
    };
    let refs_before = m.strings.ref_count(index);
    eval(&mut m, "FORGET").unwrap();
    assert_eq!(m.strings.ref_count(index), refs_before - 1);
}
