//! Module system tests driven by an injected resolver, so no files are
//! touched.

use std::collections::HashMap;

use quill::vm::{InterpretError, Vm};

fn vm_with_modules(modules: &[(&str, &str)]) -> Vm {
    let modules: HashMap<String, String> = modules
        .iter()
        .map(|(path, source)| (path.to_string(), source.to_string()))
        .collect();
    let mut vm = Vm::new();
    vm.set_resolver(Box::new(move |path| modules.get(path).cloned()));
    vm
}

#[test]
fn a_module_exports_its_top_level_bindings() {
    let mut vm = vm_with_modules(&[(
        "geometry",
        "
            let sides = 4;
            define area(w, h) { return w * h; }
        ",
    )]);
    let source = r#"
        use "geometry" for geo;
        assert geo.sides == 4;
        assert geo.area(3, 5) == 15;
    "#;
    assert!(vm.interpret(source, "main").is_ok());
}

#[test]
fn modules_know_their_own_name() {
    let mut vm = vm_with_modules(&[("named", "let marker = 1;")]);
    let source = r#"
        use "named" for n;
        assert n.__name__ == "named";
    "#;
    assert!(vm.interpret(source, "main").is_ok());
}

#[test]
fn a_module_loads_once_and_is_cached() {
    let mut vm = vm_with_modules(&[(
        "counted",
        "
            let log = [];
        ",
    )]);
    // both names must alias one library, so the second use hit the cache
    let source = r#"
        use "counted" for first;
        use "counted" for second;
        first.log.append(1);
        assert second.log.length() == 1;
    "#;
    assert!(vm.interpret(source, "main").is_ok());
}

#[test]
fn modules_can_use_other_modules() {
    let mut vm = vm_with_modules(&[
        ("inner", "define one() { return 1; }"),
        (
            "outer",
            r#"
                use "inner" for inner;
                define two() { return inner.one() + 1; }
            "#,
        ),
    ]);
    let source = r#"
        use "outer" for outer;
        assert outer.two() == 2;
    "#;
    assert!(vm.interpret(source, "main").is_ok());
}

#[test]
fn module_private_values_are_invisible() {
    let mut vm = vm_with_modules(&[(
        "sealed",
        "
            private let secret = 13;
            define reveal() { return secret; }
        ",
    )]);
    let works = r#"
        use "sealed" for s;
        assert s.reveal() == 13;
    "#;
    assert!(vm.interpret(works, "main").is_ok());

    let mut vm = vm_with_modules(&[("sealed", "private let secret = 13;")]);
    let direct = r#"
        use "sealed" for s;
        let x = s.secret;
    "#;
    assert!(matches!(
        vm.interpret(direct, "main"),
        Err(InterpretError::Runtime)
    ));
}

#[test]
fn a_compile_error_in_a_module_propagates() {
    let mut vm = vm_with_modules(&[("broken", "let = ;")]);
    assert!(matches!(
        vm.interpret(r#"use "broken";"#, "main"),
        Err(InterpretError::Compile(_))
    ));
}

#[test]
fn native_libraries_import_by_name() {
    let mut vm = Vm::new();
    let source = "
        use Math;
        use Time;
        assert Math.round(2.5) == 3;
        assert Time.MINYEAR == 1;
    ";
    assert!(vm.interpret(source, "main").is_ok());
}

#[test]
fn classes_travel_across_modules() {
    let mut vm = vm_with_modules(&[(
        "shapes",
        "
            class Square {
                init(side) {
                    this.side = side;
                }
                area() { return this.side * this.side; }
            }
        ",
    )]);
    let source = r#"
        use "shapes" for shapes;
        let sq = shapes.Square(6);
        assert sq.area() == 36;
    "#;
    assert!(vm.interpret(source, "main").is_ok());
}
