//! Black-box tests: compile a whole Palladium program, run it, assert on
//! captured stdout.

use pd_compiler::CompilerConfig;
use pd_core::Object;
use pd_runtime::Vm;

fn run(source: &str) -> String {
    let artifact = pd_compiler::compile(source, CompilerConfig::with_standard_library())
        .unwrap_or_else(|errs| panic!("compile errors: {errs:?}"));
    let mut heap = artifact.heap;
    let global_tags = artifact.global_tags;
    let script = heap.alloc(Object::Function(artifact.function));
    let mut out = Vec::new();
    let mut vm = Vm::new(heap, &mut out);
    vm.load_global_tags(global_tags);
    vm.install_standard_library(&[]);
    vm.run(script).unwrap_or_else(|err| panic!("runtime error: {err}"));
    String::from_utf8(out).unwrap()
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn global_variable_roundtrip() {
    assert_eq!(run("int x = 41; x = x + 1; print x;"), "42\n");
}

#[test]
fn while_loop_counts_up() {
    assert_eq!(run("int i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
}

#[test]
fn short_circuit_and_skips_the_right_operand() {
    // `false and (1/0 == 0)` must not evaluate the division, or this would
    // fail with a division-by-zero runtime error instead of printing.
    assert_eq!(run("bool b = false and (1 / 0 == 0); print b;"), "false\n");
}

#[test]
fn string_concatenation_via_add_object() {
    assert_eq!(run(r#"str s = "foo" + "bar"; print s;"#), "foobar\n");
}

#[test]
fn reference_roundtrip_through_address_of_and_deref() {
    assert_eq!(
        run("fun store() ~> int { int x = 1; int* p = &x; *p = 9; ret x; } print store();"),
        "9\n"
    );
}

#[test]
fn global_reference_roundtrip_through_address_of_and_deref() {
    // At top level too: `&x` writes the Reference back into the global
    // itself, so a later plain read of `x` still observes the mutation
    // made through `p`.
    assert_eq!(run("int x = 5; int* p = &x; *p = 7; print x;"), "7\n");
}

#[test]
fn function_call_and_return() {
    assert_eq!(run("fun square(int n) ~> int { ret n * n; } print square(6);"), "36\n");
}

#[test]
fn division_by_zero_is_a_runtime_error_not_a_panic() {
    let artifact = pd_compiler::compile("print 1 / 0;", CompilerConfig::with_standard_library()).unwrap();
    let mut heap = artifact.heap;
    let script = heap.alloc(Object::Function(artifact.function));
    let mut out = Vec::new();
    let mut vm = Vm::new(heap, &mut out);
    vm.install_standard_library(&[]);
    let err = vm.run(script).unwrap_err();
    assert!(err.message.contains("division by zero"));
}

#[test]
fn clock_returns_an_integer() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn stl_square_and_tostr() {
    assert_eq!(run("print stl.tostr(stl.square(7));"), "49\n");
}

#[test]
fn empty_program_runs_to_completion() {
    assert_eq!(run(""), "");
}

#[test]
fn void_builtin_call_as_a_bare_statement() {
    // `stl.write` returns nothing; calling it as a statement must not
    // desynchronize the stack the way a naive "always pop one" statement
    // compiler would.
    assert_eq!(run(r#"stl.write("hi"); print 1;"#), "hi1\n");
}

#[test]
fn void_function_early_return_then_more_locals() {
    // An early bare `ret;` inside a void function must not leave a stray
    // value on the stack for a later local declaration to trip over.
    assert_eq!(
        run("fun maybe_print(bool flag) { if (flag) { ret; } print 1; } maybe_print(true); int x = 2; print x;"),
        "2\n"
    );
}
