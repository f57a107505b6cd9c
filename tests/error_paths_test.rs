//! Error path tests: scripts that must fail, split by whether the failure
//! is caught at compile time or at run time.

use quill::vm::{InterpretError, Vm};

fn run(source: &str) -> Result<(), InterpretError> {
    let mut vm = Vm::new();
    vm.interpret(source, "test")
}

fn expect_runtime_error(source: &str) {
    match run(source) {
        Err(InterpretError::Runtime) => {}
        other => panic!(
            "expected a runtime error, got {:?} for source: {}",
            other, source
        ),
    }
}

fn expect_compile_error(source: &str) {
    match run(source) {
        Err(InterpretError::Compile(_)) => {}
        other => panic!(
            "expected a compile error, got {:?} for source: {}",
            other, source
        ),
    }
}

// ---- runtime ----

#[test]
fn division_by_zero() {
    expect_runtime_error("let x = 1 / 0;");
    expect_runtime_error("define halve(n) { return n / 0; } halve(8);");
}

#[test]
fn type_errors_in_arithmetic() {
    expect_runtime_error(r#"let x = 1 - "one";"#);
    expect_runtime_error(r#"let x = "a" * 3;"#);
    expect_runtime_error("let x = -true;");
    expect_runtime_error(r#"let x = 1 + "one";"#);
}

#[test]
fn arity_errors() {
    expect_runtime_error("define two(a, b) { return a; } two(1);");
    expect_runtime_error("define none_at_all() { return 0; } none_at_all(1, 2);");
    expect_runtime_error("class Plain {} Plain(1);");
}

#[test]
fn calling_a_non_callable() {
    expect_runtime_error("let x = 5; x();");
    expect_runtime_error(r#"let s = "text"; s();"#);
}

#[test]
fn undefined_names() {
    expect_runtime_error("let x = missing;");
    expect_runtime_error("missing = 1;");
    expect_runtime_error("class Empty {} let e = Empty(); let x = e.nothing;");
}

#[test]
fn list_index_errors() {
    expect_runtime_error("let l = [1, 2]; let x = l[5];");
    expect_runtime_error("let l = [1, 2]; let x = l[-3];");
    expect_runtime_error(r#"let l = [1]; let x = l["zero"];"#);
    expect_runtime_error("let l = [1]; l[9] = 0;");
    expect_runtime_error("let x = 5[0];");
}

#[test]
fn unknown_methods() {
    expect_runtime_error("[1].sort();");
    expect_runtime_error(r#""text".trim();"#);
    expect_runtime_error("1.sqrt();");
    expect_runtime_error("true.flip();");
}

#[test]
fn private_members_from_outside() {
    expect_runtime_error("
        class Vault {
            private combination() { return 0; }
        }
        Vault().combination();
    ");
}

#[test]
fn deep_recursion_overflows() {
    expect_runtime_error("
        define down(n) {
            if n == 0 { return 0; }
            return 1 + down(n - 1);
        }
        down(100000);
    ");
}

#[test]
fn failed_assertions() {
    expect_runtime_error("assert false;");
    expect_runtime_error(r#"assert 1 == 2, "numbers drifted";"#);
    expect_runtime_error("assert(false);");
    expect_runtime_error(r#"assertShow(false, "shown");"#);
}

#[test]
fn missing_module() {
    expect_runtime_error(r#"use "no/such/module";"#);
}

// ---- compile time ----

#[test]
fn malformed_declarations() {
    expect_compile_error("let = 1;");
    expect_compile_error("define () {}");
    expect_compile_error("let x = ;");
}

#[test]
fn break_and_continue_need_a_loop() {
    expect_compile_error("break;");
    expect_compile_error("continue;");
}

#[test]
fn return_outside_a_function() {
    expect_compile_error("return 1;");
}

#[test]
fn assigning_to_a_native_global() {
    expect_compile_error("type = 1;");
}

#[test]
fn private_outside_a_class_or_library_form() {
    expect_compile_error("private x = 1;");
}

#[test]
fn unknown_native_library() {
    expect_compile_error("use Nonexistent;");
}

#[test]
fn too_many_parameters() {
    let params: Vec<String> = (0..31).map(|i| format!("p{}", i)).collect();
    let source = format!("define f({}) {{}}", params.join(", "));
    expect_compile_error(&source);
}
