//! Native functions: the global set, the method tables for lists, strings
//! and numbers, and the script-defined extras layered on top of them.
//!
//! Natives report failure by raising through [`Vm::raise`] and returning
//! [`Value::None`]; any other return value is the call's result. Void
//! natives return `Value::Number(0.0)`.

use std::io::{BufRead, Write};

use crate::heap::Object;
use crate::value::Value;
use crate::vm::{NativeTable, Vm};

/// Installs the global native set.
pub fn define_globals(vm: &mut Vm) {
    vm.define_native(NativeTable::Globals, "input", input_native);
    vm.define_native(NativeTable::Globals, "print", print_native);
    vm.define_native(NativeTable::Globals, "type", type_native);
    vm.define_native(NativeTable::Globals, "assert", assert_native);
    vm.define_native(NativeTable::Globals, "assertShow", assert_show_native);
}

/// Installs the native method tables.
pub fn define_methods(vm: &mut Vm) {
    vm.define_native(NativeTable::Lists, "append", list_append);
    vm.define_native(NativeTable::Lists, "length", list_length);
    vm.define_native(NativeTable::Lists, "remove", list_remove);
    vm.define_native(NativeTable::Lists, "contains", list_contains);
    vm.define_native(NativeTable::Lists, "index", list_index);
    vm.define_native(NativeTable::Lists, "clear", list_clear);
    vm.define_native(NativeTable::Lists, "all", list_all);
    vm.define_native(NativeTable::Lists, "any", list_any);
    vm.define_native(NativeTable::Lists, "reverse", list_reverse);
    vm.define_native(NativeTable::Lists, "pop", list_pop);

    vm.define_native(NativeTable::Strings, "number", string_number);
    vm.define_native(NativeTable::Strings, "length", string_length);
    vm.define_native(NativeTable::Strings, "split", string_split);
    vm.define_native(NativeTable::Strings, "upper", string_upper);
    vm.define_native(NativeTable::Strings, "lower", string_lower);
    vm.define_native(NativeTable::Strings, "contains", string_contains);

    vm.define_native(NativeTable::Numbers, "bool", number_bool);
    vm.define_native(NativeTable::Numbers, "abs", number_abs);
    vm.define_native(NativeTable::Numbers, "floor", number_floor);
    vm.define_native(NativeTable::Numbers, "ceil", number_ceil);
}

// Methods easier written in the language itself than re-entered through the
// dispatch loop.
const LIST_EXTRA: &str = "
define repeat(list, action) {
   assert type(action) == \"function\", \"Argument must be a function from 'repeat'.\";

   let len = list.length();
   for let i = 0; i < len; i++ {
       action(list[i]);
   }

   return 0;
}
";

const NUMBER_EXTRA: &str = "
define repeat(num, action) {
   assert type(action) == \"function\", \"Argument must be a function from 'repeat'.\";

   for let i = 0; i < num; i++ {
       action(i);
   }

   return 0;
}
";

/// Runs the script-defined extras and merges their bindings into the
/// method tables.
pub fn load_extras(vm: &mut Vm) {
    merge_extra(vm, LIST_EXTRA, "List", NativeTable::Lists);
    merge_extra(vm, NUMBER_EXTRA, "Number", NativeTable::Numbers);
}

fn merge_extra(vm: &mut Vm, source: &str, library_name: &str, table: NativeTable) {
    if vm.interpret(source, library_name).is_err() {
        return;
    }
    let name = vm.heap.intern(library_name);
    let skip = vm.heap.intern("__name__");
    let values: Vec<(crate::heap::ObjRef, Value)> = match vm.libraries.get(&name) {
        Some(Value::Obj(library)) => match vm.heap.get(*library) {
            Object::Library(lib) => lib
                .values
                .iter()
                .filter(|(key, _)| **key != skip)
                .map(|(&key, &value)| (key, value))
                .collect(),
            _ => return,
        },
        _ => return,
    };
    for (key, value) in values {
        match table {
            NativeTable::Lists => vm.list_methods.insert(key, value),
            NativeTable::Numbers => vm.number_methods.insert(key, value),
            NativeTable::Strings => vm.string_methods.insert(key, value),
            NativeTable::Globals => vm.globals.insert(key, value),
        };
    }
}

// ---- globals ----

fn input_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() > 1 {
        vm.raise(&format!(
            "Expected 1 or 0 arguments but got {} from 'input()'.",
            args.len()
        ));
        return Value::None;
    }

    if let Some(&prompt) = args.first() {
        let prompt = match prompt.as_obj().and_then(|r| vm.heap.as_string(r)) {
            Some(s) => s.to_string(),
            None => {
                vm.raise("Argument must be a string from 'input()'.");
                return Value::None;
            }
        };
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
    }

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        vm.raise("A Read error occured on input()!?");
        return Value::None;
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Value::Obj(vm.heap.intern(&line))
}

fn print_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'print()'.",
            args.len()
        ));
        return Value::None;
    }

    println!("{}", vm.heap.show_value(args[0]));
    Value::Number(0.0)
}

fn type_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'type()'.",
            args.len()
        ));
        return Value::None;
    }

    let typ = vm.heap.type_of(args[0]);
    Value::Obj(vm.heap.intern(typ))
}

fn assert_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'assert()'.",
            args.len()
        ));
        return Value::None;
    }

    if args[0].is_falsey() {
        vm.raise("Assertion Failed");
        return Value::None;
    }
    Value::Number(0.0)
}

fn assert_show_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        vm.raise(&format!(
            "Expected 2 arguments but got {} from 'assertShow()'.",
            args.len()
        ));
        return Value::None;
    }

    let message = match args[1].as_obj().and_then(|r| vm.heap.as_string(r)) {
        Some(s) => s.to_string(),
        None => {
            vm.raise("Argument must be a string from 'assertShow()'.");
            return Value::None;
        }
    };

    if args[0].is_falsey() {
        vm.raise(&message);
        return Value::None;
    }
    Value::Number(0.0)
}

// ---- list methods; args[0] is the receiver ----

fn receiver_list<'a>(vm: &'a Vm, args: &[Value]) -> Option<&'a Vec<Value>> {
    match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::List(items)) => Some(items),
        _ => None,
    }
}

fn list_append(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'append()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    if let Some(r) = args[0].as_obj() {
        if let Object::List(items) = vm.heap.get_mut(r) {
            items.push(args[1]);
        }
    }
    Value::Number(0.0)
}

fn list_length(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'length()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let len = receiver_list(vm, args).map(Vec::len).unwrap_or(0);
    Value::Number(len as f64)
}

fn list_remove(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 > 1 {
        vm.raise(&format!(
            "Expected 1 or 0 arguments but got {} from 'remove()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let index = if args.len() == 2 {
        match args[1].as_number() {
            Some(n) => Some(n as i64),
            None => {
                vm.raise("Index must be a number from 'remove()'.");
                return Value::None;
            }
        }
    } else {
        None
    };

    let len = receiver_list(vm, args).map(Vec::len).unwrap_or(0) as i64;
    let index = match index {
        Some(mut i) => {
            if i < 0 {
                i += len;
            }
            if i < 0 || i >= len {
                vm.raise("Index out of bounds.");
                return Value::None;
            }
            i as usize
        }
        None if len == 0 => {
            vm.raise("Index out of bounds.");
            return Value::None;
        }
        None => (len - 1) as usize,
    };

    if let Some(r) = args[0].as_obj() {
        if let Object::List(items) = vm.heap.get_mut(r) {
            items.remove(index);
        }
    }
    Value::Number(0.0)
}

fn list_contains(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'contains()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let items = match receiver_list(vm, args) {
        Some(items) => items.clone(),
        None => return Value::Bool(false),
    };
    for item in items {
        if vm.heap.values_equal(item, args[1]) {
            return Value::Bool(true);
        }
    }
    Value::Bool(false)
}

fn list_index(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'index()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let items = match receiver_list(vm, args) {
        Some(items) => items.clone(),
        None => return Value::Bool(false),
    };
    for (i, item) in items.into_iter().enumerate() {
        if vm.heap.values_equal(item, args[1]) {
            return Value::Number(i as f64);
        }
    }
    Value::Bool(false)
}

fn list_clear(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'clean()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    if let Some(r) = args[0].as_obj() {
        if let Object::List(items) = vm.heap.get_mut(r) {
            items.clear();
        }
    }
    Value::Number(0.0)
}

fn list_all(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'length()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let all = receiver_list(vm, args)
        .map(|items| items.iter().all(|item| !item.is_falsey()))
        .unwrap_or(true);
    Value::Bool(all)
}

fn list_any(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'any()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let any = receiver_list(vm, args)
        .map(|items| items.iter().any(|item| !item.is_falsey()))
        .unwrap_or(false);
    Value::Bool(any)
}

fn list_reverse(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'reverse()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    if let Some(r) = args[0].as_obj() {
        if let Object::List(items) = vm.heap.get_mut(r) {
            items.reverse();
        }
    }
    Value::Number(0.0)
}

fn list_pop(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'pop()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let popped = match args[0].as_obj() {
        Some(r) => match vm.heap.get_mut(r) {
            Object::List(items) => items.pop(),
            _ => None,
        },
        None => None,
    };
    match popped {
        Some(value) => value,
        None => {
            vm.raise("Can not pop from an empty list.");
            Value::None
        }
    }
}

// ---- string methods ----

fn receiver_string(vm: &Vm, args: &[Value]) -> Option<String> {
    args[0]
        .as_obj()
        .and_then(|r| vm.heap.as_string(r))
        .map(|s| s.to_string())
}

fn string_length(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'length()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let len = receiver_string(vm, args).map(|s| s.chars().count()).unwrap_or(0);
    Value::Number(len as f64)
}

fn string_number(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'number()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let string = receiver_string(vm, args).unwrap_or_default();
    match parse_number_prefix(&string) {
        Some(number) => Value::Number(number),
        None => {
            vm.raise("A Conversion error occured on number()?!");
            Value::None
        }
    }
}

// Longest numeric prefix, ignoring leading whitespace.
fn parse_number_prefix(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let mut best = None;
    for i in (1..=s.len()).filter(|&i| s.is_char_boundary(i)) {
        if let Ok(n) = s[..i].parse::<f64>() {
            best = Some(n);
        }
    }
    best
}

fn string_split(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'split()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let delimiter = match args[1].as_obj().and_then(|r| vm.heap.as_string(r)) {
        Some(s) => s.to_string(),
        None => {
            vm.raise("Argument must be a string from 'split()'.");
            return Value::None;
        }
    };

    let string = receiver_string(vm, args).unwrap_or_default();
    let mut parts = Vec::new();
    if !delimiter.is_empty() {
        for part in string.split(&delimiter) {
            let part = vm.heap.intern(part);
            parts.push(Value::Obj(part));
        }
    }
    Value::Obj(vm.heap.alloc(Object::List(parts)))
}

fn string_upper(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'upper()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let upper = receiver_string(vm, args).unwrap_or_default().to_uppercase();
    Value::Obj(vm.heap.intern(&upper))
}

fn string_lower(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'lower()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let lower = receiver_string(vm, args).unwrap_or_default().to_lowercase();
    Value::Obj(vm.heap.intern(&lower))
}

fn string_contains(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'contains()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    let needle = match args[1].as_obj().and_then(|r| vm.heap.as_string(r)) {
        Some(s) => s.to_string(),
        None => {
            vm.raise("Argument must be a string from 'contains()'.");
            return Value::None;
        }
    };
    let haystack = receiver_string(vm, args).unwrap_or_default();
    Value::Bool(haystack.contains(&needle))
}

// ---- number methods ----

fn number_bool(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'bool()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    Value::Bool(args[0].as_number().unwrap_or(0.0) != 0.0)
}

fn number_abs(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'abs()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    Value::Number(args[0].as_number().unwrap_or(0.0).abs())
}

fn number_floor(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'floor()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    Value::Number(args[0].as_number().unwrap_or(0.0).floor())
}

fn number_ceil(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() - 1 != 0 {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'ceil()'.",
            args.len() - 1
        ));
        return Value::None;
    }

    Value::Number(args[0].as_number().unwrap_or(0.0).ceil())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::InterpretError;

    fn run(source: &str) -> Result<(), InterpretError> {
        let mut vm = Vm::new();
        vm.interpret(source, "test")
    }

    #[test]
    fn list_methods_cover_the_basics() {
        assert!(run("let l = [1, 2]; l.append(3); assert l.length() == 3; assert l[2] == 3;")
            .is_ok());
        assert!(run("let l = [1, 2, 3]; l.remove(); assert l.length() == 2;").is_ok());
        assert!(run("let l = [1, 2, 3]; l.remove(0); assert l[0] == 2;").is_ok());
        assert!(run("assert [1, 2].contains(2); assert ![1].contains(9);").is_ok());
        assert!(run("assert [5, 6, 7].index(6) == 1;").is_ok());
        assert!(run("let l = [1, 2]; l.clear(); assert l.length() == 0;").is_ok());
        assert!(run("assert [1, 2].all(); assert ![1, false].all();").is_ok());
        assert!(run("assert [false, 1].any(); assert ![false].any();").is_ok());
        assert!(run("let l = [1, 2, 3]; l.reverse(); assert l[0] == 3;").is_ok());
    }

    #[test]
    fn list_repeat_runs_an_action_per_item() {
        let source = "
            let seen = [];
            [4, 5, 6].repeat(lambda (item) -> seen.append(item));
            assert seen.length() == 3;
            assert seen[1] == 5;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn number_repeat_counts_up() {
        let source = "
            let seen = [];
            3.repeat(lambda (i) -> seen.append(i));
            assert seen.length() == 3;
            assert seen[2] == 2;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn string_methods() {
        assert!(run(r#"assert "hello".length() == 5;"#).is_ok());
        assert!(run(r#"assert "42".number() == 42;"#).is_ok());
        assert!(matches!(
            run(r#"let x = "nope".number();"#),
            Err(InterpretError::Runtime)
        ));
        let split = r#"
            let parts = "a,b,c".split(",");
            assert parts.length() == 3;
            assert parts[1] == "b";
        "#;
        assert!(run(split).is_ok());
    }

    #[test]
    fn list_pop_returns_the_last_item() {
        assert!(run("let l = [1, 2, 3]; assert l.pop() == 3; assert l.length() == 2;").is_ok());
        assert!(matches!(
            run("let l = []; l.pop();"),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn string_case_and_contains() {
        assert!(run(r#"assert "abc".upper() == "ABC";"#).is_ok());
        assert!(run(r#"assert "ABC".lower() == "abc";"#).is_ok());
        assert!(run(r#"assert "haystack".contains("stack");"#).is_ok());
        assert!(run(r#"assert !"haystack".contains("needle");"#).is_ok());
    }

    #[test]
    fn number_bool_is_zero_testing() {
        assert!(run("assert 1.bool(); assert !0.bool();").is_ok());
    }

    #[test]
    fn number_rounding_methods() {
        assert!(run("let n = -3; assert n.abs() == 3;").is_ok());
        assert!(run("assert 2.7.floor() == 2; assert 2.1.ceil() == 3;").is_ok());
    }

    #[test]
    fn assert_show_reports_its_message() {
        assert!(run(r#"assertShow(true, "fine");"#).is_ok());
        assert!(matches!(
            run(r#"assertShow(false, "boom");"#),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn numeric_prefix_parsing() {
        assert_eq!(parse_number_prefix("12.5"), Some(12.5));
        assert_eq!(parse_number_prefix("  3abc"), Some(3.0));
        assert_eq!(parse_number_prefix("abc"), None);
    }
}
