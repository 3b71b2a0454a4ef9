use cpscheme::ast::Value;
use cpscheme::{Environment, Interpreter, ParseErrorKind};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

/// Enable with `RUST_LOG=cpscheme=debug` or `RUST_LOG=cpscheme=trace`.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn main() -> rustyline::Result<()> {
    init_tracing();

    println!("cpscheme - Scheme on a continuation trampoline");
    println!("Enter S-expressions like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let mut interp = Interpreter::default();

    for path in std::env::args().skip(1) {
        info!(%path, "loading file from command line");
        print_results(&interp.interpret(&format!("(load {path:?})")));
    }

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "cpscheme> " } else { "      ... " };
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if pending.is_empty() {
                    if trimmed.is_empty() {
                        continue;
                    }
                    match trimmed {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(interp.global());
                            continue;
                        }
                        ":stats" => {
                            let stats = interp.stats();
                            println!("steps:                  {}", stats.steps);
                            println!("max continuation depth: {}", stats.max_continuation_depth);
                            println!("max operand depth:      {}", stats.max_operand_depth);
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                }

                if !pending.is_empty() {
                    pending.push('\n');
                }
                pending.push_str(&line);

                // keep reading while the input is an unfinished expression
                if let Err(err) = interp.reader().read_all(&pending)
                    && err.kind == ParseErrorKind::Incomplete
                {
                    continue;
                }

                let _ = rl.add_history_entry(pending.as_str());
                let input = std::mem::take(&mut pending);
                print_results(&interp.interpret(&input));
            }
            Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                pending.clear();
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    Ok(())
}

fn print_results(results: &[Value]) {
    for result in results {
        println!("{result}");
    }
}

fn print_help() {
    println!("cpscheme REPL:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show global environment bindings");
    println!("  :stats     - Show statistics of the last evaluation");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms: define if set! begin lambda quote");
    println!("Files: (load \"file.scm\") evaluates every expression of a file");
    println!();
    println!("Examples:");
    println!("  (define (fib n) (if (< n 2) 1 (+ (fib (- n 1)) (fib (- n 2)))))");
    println!("  (fib 10)");
    println!("  (eval '(+ 1 2))     ; => (+ 1 2)");
    println!();
}

fn print_environment(env: &Environment) {
    let bindings = env.local_bindings();

    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();
    for (name, value) in bindings {
        match value {
            Value::Builtin(_) | Value::Trampoline(_) | Value::Syntax(_) => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    if !builtins.is_empty() {
        println!("Built-in functions and forms ({}):", builtins.len());
        let mut col = 0;
        for name in builtins {
            print!("  {:<18}", name.as_str());
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
