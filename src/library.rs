//! Native libraries, importable by name through `use Math;`.
//!
//! The compiler resolves the library name to its registry index at compile
//! time; the VM builds the library on first import and caches it.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::heap::ObjRef;
use crate::value::Value;
use crate::vm::{InterpretError, Vm};

const REGISTRY: &[(&str, fn(&mut Vm) -> ObjRef)] = &[
    ("Math", create_math_library),
    ("Time", create_time_library),
];

/// The registry index for a native library name, if one exists.
pub fn native_module_index(name: &str) -> Option<u8> {
    REGISTRY
        .iter()
        .position(|(registered, _)| *registered == name)
        .map(|index| index as u8)
}

/// Builds the native library at `index` and caches it in the VM.
pub fn import_library(vm: &mut Vm, index: u8) -> Result<ObjRef, InterpretError> {
    match REGISTRY.get(index as usize) {
        Some((_, create)) => Ok(create(vm)),
        None => {
            vm.raise("Native library does not exist.");
            Err(InterpretError::Runtime)
        }
    }
}

// ---- argument checking; library natives get no receiver ----

fn one_number(vm: &mut Vm, args: &[Value], name: &str) -> Option<f64> {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from '{}()'.",
            args.len(),
            name
        ));
        return None;
    }
    match args[0].as_number() {
        Some(n) => Some(n),
        None => {
            vm.raise(&format!("Argument must be a number from '{}()'.", name));
            None
        }
    }
}

fn number_list(vm: &mut Vm, args: &[Value], name: &str) -> Option<Vec<f64>> {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from '{}()'.",
            args.len(),
            name
        ));
        return None;
    }
    let items = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(crate::heap::Object::List(items)) => items.clone(),
        _ => {
            vm.raise(&format!("Argument must be a list from '{}()'.", name));
            return None;
        }
    };
    let mut numbers = Vec::with_capacity(items.len());
    for item in items {
        match item.as_number() {
            Some(n) => numbers.push(n),
            None => {
                vm.raise(&format!("List Should be all numeric from '{}()'.", name));
                return None;
            }
        }
    }
    Some(numbers)
}

// ---- Math ----

fn create_math_library(vm: &mut Vm) -> ObjRef {
    let name = vm.heap.intern("Math");
    let library = vm.new_library(name);

    vm.define_library_native(library, "abs", math_abs);
    vm.define_library_native(library, "floor", math_floor);
    vm.define_library_native(library, "round", math_round);
    vm.define_library_native(library, "ceil", math_ceil);
    vm.define_library_native(library, "log", math_log);
    vm.define_library_native(library, "exp", math_exp);

    vm.define_library_native(library, "sqrt", math_sqrt);
    vm.define_library_native(library, "clamp", math_clamp);

    vm.define_library_native(library, "sin", math_sin);
    vm.define_library_native(library, "cos", math_cos);
    vm.define_library_native(library, "tan", math_tan);

    vm.define_library_native(library, "asin", math_asin);
    vm.define_library_native(library, "acos", math_acos);
    vm.define_library_native(library, "atan", math_atan);

    vm.define_library_native(library, "min", math_min);
    vm.define_library_native(library, "max", math_max);

    vm.define_library_native(library, "gcd", math_gcd);

    vm.define_library_value(library, "pi", Value::Number(3.14159265358979));
    vm.define_library_value(library, "e", Value::Number(2.71828182845905));

    library
}

fn math_abs(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "abs") {
        Some(n) => Value::Number(n.abs()),
        None => Value::None,
    }
}

fn math_floor(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "floor") {
        Some(n) => Value::Number(n.floor()),
        None => Value::None,
    }
}

fn math_round(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "round") {
        Some(n) => Value::Number(n.round()),
        None => Value::None,
    }
}

fn math_ceil(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "ceil") {
        Some(n) => Value::Number(n.ceil()),
        None => Value::None,
    }
}

fn math_log(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "log") {
        Some(n) => {
            let result = n.ln();
            if result.is_nan() {
                vm.raise("Math domain error from 'log()'.");
                return Value::None;
            }
            Value::Number(result)
        }
        None => Value::None,
    }
}

fn math_exp(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "exp") {
        Some(n) => Value::Number(n.exp()),
        None => Value::None,
    }
}

fn math_sqrt(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "sqrt") {
        Some(n) if n < 0.0 => {
            vm.raise("Argument must be bigger than 0 from 'sqrt()'.");
            Value::None
        }
        Some(n) => Value::Number(n.sqrt()),
        None => Value::None,
    }
}

fn math_clamp(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 3 {
        vm.raise(&format!(
            "Expected 3 arguments but got {} from 'clamp()'.",
            args.len()
        ));
        return Value::None;
    }
    let ordinals = ["First", "Second", "Third"];
    let mut numbers = [0.0; 3];
    for (i, arg) in args.iter().enumerate() {
        match arg.as_number() {
            Some(n) => numbers[i] = n,
            None => {
                vm.raise(&format!(
                    "{} Argument must be a number from 'clamp()'.",
                    ordinals[i]
                ));
                return Value::None;
            }
        }
    }
    // value, low, high
    let [value, low, high] = numbers;
    Value::Number(value.max(low).min(high))
}

fn math_sin(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "sin") {
        Some(n) => Value::Number(n.sin()),
        None => Value::None,
    }
}

fn math_cos(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "cos") {
        Some(n) => Value::Number(n.cos()),
        None => Value::None,
    }
}

fn math_tan(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "tan") {
        Some(n) => Value::Number(n.tan()),
        None => Value::None,
    }
}

fn math_asin(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "asin") {
        Some(n) => {
            let result = n.asin();
            if result.is_nan() {
                vm.raise("Math domain error from 'asin()'.");
                return Value::None;
            }
            Value::Number(result)
        }
        None => Value::None,
    }
}

fn math_acos(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "acos") {
        Some(n) => {
            let result = n.acos();
            if result.is_nan() {
                vm.raise("Math domain error from 'acos()'.");
                return Value::None;
            }
            Value::Number(result)
        }
        None => Value::None,
    }
}

fn math_atan(vm: &mut Vm, args: &[Value]) -> Value {
    match one_number(vm, args, "atan") {
        Some(n) => Value::Number(n.atan()),
        None => Value::None,
    }
}

fn math_min(vm: &mut Vm, args: &[Value]) -> Value {
    match number_list(vm, args, "min") {
        Some(numbers) => match numbers.into_iter().reduce(f64::min) {
            Some(min) => Value::Number(min),
            None => Value::Number(0.0),
        },
        None => Value::None,
    }
}

fn math_max(vm: &mut Vm, args: &[Value]) -> Value {
    match number_list(vm, args, "max") {
        Some(numbers) => match numbers.into_iter().reduce(f64::max) {
            Some(max) => Value::Number(max),
            None => Value::Number(0.0),
        },
        None => Value::None,
    }
}

fn math_gcd(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 2 {
        vm.raise(&format!(
            "Expected 2 arguments but got {} from 'gcd()'.",
            args.len()
        ));
        return Value::None;
    }
    let a = match args[0].as_number() {
        Some(n) => n as i64,
        None => {
            vm.raise("First Argument must be a number from 'gcd()'.");
            return Value::None;
        }
    };
    let b = match args[1].as_number() {
        Some(n) => n as i64,
        None => {
            vm.raise("Second Argument must be a number from 'gcd()'.");
            return Value::None;
        }
    };
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    Value::Number(a as f64)
}

// ---- Time ----

fn create_time_library(vm: &mut Vm) -> ObjRef {
    let name = vm.heap.intern("Time");
    let library = vm.new_library(name);

    vm.define_library_native(library, "time", time_time);
    vm.define_library_native(library, "clock", time_clock);
    vm.define_library_native(library, "sleep", time_sleep);

    vm.define_library_value(library, "MINYEAR", Value::Number(1.0));
    vm.define_library_value(library, "MAXYEAR", Value::Number(9999.0));

    library
}

fn time_time(vm: &mut Vm, args: &[Value]) -> Value {
    if !args.is_empty() {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'time()'.",
            args.len()
        ));
        return Value::None;
    }
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds.floor())
}

fn time_clock(vm: &mut Vm, args: &[Value]) -> Value {
    if !args.is_empty() {
        vm.raise(&format!(
            "Expected 0 arguments but got {} from 'clock()'.",
            args.len()
        ));
        return Value::None;
    }
    Value::Number(process_start().elapsed().as_secs_f64())
}

fn time_sleep(vm: &mut Vm, args: &[Value]) -> Value {
    if args.len() != 1 {
        vm.raise(&format!(
            "Expected 1 argument but got {} from 'sleep()'.",
            args.len()
        ));
        return Value::None;
    }
    let seconds = match args[0].as_number() {
        Some(n) if n >= 0.0 => n,
        _ => {
            vm.raise("First argument must be a number from 'sleep()'.");
            return Value::None;
        }
    };
    std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
    Value::Number(0.0)
}

fn process_start() -> Instant {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
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
    fn registry_lookup_is_stable() {
        assert_eq!(native_module_index("Math"), Some(0));
        assert_eq!(native_module_index("Time"), Some(1));
        assert_eq!(native_module_index("Nope"), None);
    }

    #[test]
    fn math_functions_and_constants() {
        let source = "
            use Math;
            assert Math.abs(-3) == 3;
            assert Math.floor(2.7) == 2;
            assert Math.ceil(2.1) == 3;
            assert Math.sqrt(16) == 4;
            assert Math.clamp(10, 0, 5) == 5;
            assert Math.min([4, 1, 9]) == 1;
            assert Math.max([4, 1, 9]) == 9;
            assert Math.gcd(12, 18) == 6;
            assert Math.pi > 3.14;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn math_domain_errors_are_runtime_errors() {
        assert!(matches!(
            run("use Math; let x = Math.sqrt(-1);"),
            Err(InterpretError::Runtime)
        ));
        assert!(matches!(
            run("use Math; let x = Math.asin(2);"),
            Err(InterpretError::Runtime)
        ));
        assert!(matches!(
            run(r#"use Math; let x = Math.abs("s");"#),
            Err(InterpretError::Runtime)
        ));
    }

    #[test]
    fn imported_libraries_are_cached() {
        let source = "
            use Math;
            use Math;
            assert Math.abs(-1) == 1;
        ";
        assert!(run(source).is_ok());
    }

    #[test]
    fn time_constants() {
        assert!(run("use Time; assert Time.MAXYEAR == 9999; assert Time.time() > 0;").is_ok());
    }
}
