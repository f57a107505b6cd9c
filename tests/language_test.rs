//! End-to-end language tests: each script checks itself with `assert` and
//! the harness only cares whether the run succeeds.

use quill::vm::{InterpretError, Vm};

fn run(source: &str) -> Result<(), InterpretError> {
    let mut vm = Vm::new();
    vm.interpret(source, "test")
}

fn expect_ok(source: &str) {
    if let Err(error) = run(source) {
        panic!("expected success, got {:?} for source: {}", error, source);
    }
}

#[test]
fn literals_and_operators() {
    expect_ok("assert 1 + 2 * 3 - 4 == 3;");
    expect_ok("assert 10 % 4 == 2;");
    expect_ok("assert 2 ** 10 == 1024;");
    expect_ok("assert -5 + 5 == 0;");
    expect_ok("assert !false;");
    expect_ok("assert none == none;");
    expect_ok("assert true != false;");
    expect_ok("assert 1 < 2 and 2 <= 2 and 3 > 2 and 3 >= 3;");
}

#[test]
fn number_literal_forms() {
    expect_ok("assert 0xFF == 255;");
    expect_ok("assert 0o17 == 15;");
    expect_ok("assert 1_000_000 == 1000000;");
    expect_ok("assert 1.5 + 0.5 == 2;");
}

#[test]
fn bitwise_and_shifts() {
    expect_ok("assert (12 & 10) == 8;");
    expect_ok("assert (12 | 10) == 14;");
    expect_ok("assert (12 ^ 10) == 6;");
    expect_ok("assert (1 << 4) == 16;");
    expect_ok("assert (16 >> 2) == 4;");
}

#[test]
fn strings_and_escapes() {
    expect_ok(r#"assert "abc" + "def" == "abcdef";"#);
    expect_ok(r#"assert 'single' == "single";"#);
    expect_ok(r#"assert "tab\there".length() == 8;"#);
    expect_ok(r#"assert "line"[0] == "l";"#);
    expect_ok(r#"assert "line"[-1] == "e";"#);
}

#[test]
fn logical_operators_short_circuit() {
    expect_ok("
        define boom() { assert false; return true; }
        assert (false and boom()) == false;
        assert true or boom();
    ");
}

#[test]
fn control_flow() {
    expect_ok("
        let total = 0;
        for let i = 0; i < 5; i++ {
            total = total + i;
        }
        assert total == 10;
    ");
    expect_ok("
        let n = 0;
        while n < 10 { n++; }
        assert n == 10;
    ");
    expect_ok("
        let hits = 0;
        for let i = 0; i < 10; i++ {
            if i == 3 { continue; }
            if i == 6 { break; }
            hits++;
        }
        assert hits == 5;
    ");
    expect_ok("
        let branch = none;
        if 1 > 2 { branch = \"then\"; } else { branch = \"else\"; }
        assert branch == \"else\";
    ");
}

#[test]
fn functions_and_lambdas() {
    expect_ok("
        define add(a, b) { return a + b; }
        assert add(2, 3) == 5;
    ");
    expect_ok("
        let double = lambda (x) -> x * 2;
        assert double(21) == 42;
    ");
    expect_ok("
        define make_adder(n) {
            return lambda (x) -> x + n;
        }
        let add3 = make_adder(3);
        assert add3(4) == 7;
    ");
}

#[test]
fn recursion_and_tail_calls() {
    expect_ok("
        define fib(n) {
            if n < 2 { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        assert fib(15) == 610;
    ");
    expect_ok("
        define spin(n, acc) {
            if n == 0 { return acc; }
            return spin(n - 1, acc + n);
        }
        assert spin(100000, 0) == 5000050000;
    ");
}

#[test]
fn lists() {
    expect_ok("
        let l = [1, \"two\", [3]];
        assert l.length() == 3;
        assert l[1] == \"two\";
        assert l[2][0] == 3;
        assert l[-3] == 1;
        l[0] = 10;
        assert l[0] == 10;
    ");
    expect_ok("assert [1, [2, 3]] == [1, [2, 3]];");
    expect_ok("
        let a = [1];
        let b = [a];
        a[0] = b;
        assert a == b;
        assert a != [1];
    ");
    expect_ok("
        let squares = [];
        5.repeat(lambda (i) -> squares.append(i * i));
        assert squares == [0, 1, 4, 9, 16];
    ");
}

#[test]
fn classes() {
    expect_ok("
        class Counter {
            init() {
                this.count = 0;
            }
            bump() {
                this.count = this.count + 1;
                return this.count;
            }
        }
        let c = Counter();
        c.bump();
        c.bump();
        assert c.count == 2;
    ");
    expect_ok("
        class Box {}
        let b = Box();
        b.value = 9;
        assert b.value == 9;
    ");
    expect_ok("
        class Greeter {
            hello() { return \"hi\"; }
        }
        let method = Greeter().hello;
        assert method() == \"hi\";
    ");
}

#[test]
fn private_members_inside_a_class() {
    expect_ok("
        class Account {
            init(amount) {
                private balance = amount;
            }
            deposit(amount) {
                private balance = this.balance + amount;
                return 0;
            }
            total() { return this.balance; }
        }
        let a = Account(10);
        a.deposit(5);
        assert a.total() == 15;
    ");
    expect_ok("
        class Engine {
            private spark() { return 1; }
            start() { return this.spark(); }
        }
        assert Engine().start() == 1;
    ");
}

#[test]
fn private_library_values() {
    expect_ok("
        private let hidden = 3;
        private define twice(n) { return n * 2; }
        assert twice(hidden) == 6;
    ");
}

#[test]
fn assert_with_message_passes_through() {
    expect_ok(r#"assert 1 == 1, "math still works";"#);
}
