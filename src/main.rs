use std::io::{BufRead, Write};
use std::process::ExitCode;

use quill::vm::{InterpretError, Vm};

fn repl(vm: &mut Vm) {
    println!("Use Ctrl + C to exit.");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                break;
            }
            Ok(_) => {}
        }

        // errors were already reported on stderr; the session continues
        let _ = vm.interpret(&line, "stdin");
    }
}

fn run_file(vm: &mut Vm, path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not open file \"{}\": {}.", path, error);
            return ExitCode::from(74);
        }
    };

    match vm.interpret(&source, path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(65),
        Err(_) => ExitCode::from(70),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let mut vm = Vm::new();

    match args.as_slice() {
        [_] => {
            repl(&mut vm);
            ExitCode::SUCCESS
        }
        [_, path] => run_file(&mut vm, path),
        _ => {
            eprintln!("Usage: quill [path]");
            ExitCode::from(64)
        }
    }
}
