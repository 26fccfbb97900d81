use ensemble::ast::Value;
use ensemble::evaluator::Environment;
use ensemble::reader::read_all;
use ensemble::{ReadErrorKind, create_global_env, io, rep};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use tracing_subscriber::EnvFilter;

/// Usage:
///   repl                     interactive session
///   repl FILE [ARGS...]      load FILE with *ARGV* bound to ARGS, then exit
///
/// Set `ENSEMBLE_LOG` (e.g. `ENSEMBLE_LOG=ensemble=debug`) to see interpreter tracing.
fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some((file, rest)) = args.split_first() {
        process::exit(run_file(file, rest));
    }

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ENSEMBLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_file(file: &str, argv: &[String]) -> i32 {
    let env = create_global_env();
    io::set_argv(&env, argv.iter().cloned());
    let path = Value::String(file.to_owned());
    match rep(&format!("(load-file {path})"), &env) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

fn run_repl() {
    println!("Ensemble Lisp");
    println!("Enter forms like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not initialize REPL: {e}");
            process::exit(1);
        }
    };
    let env = create_global_env();

    // Callable from user code as well as through :help
    env.register_builtin_operation::<_, ()>("help", print_help);

    rep("(println (str \"Mal [\" *host-language* \"]\"))", &env).ok();

    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "user> " } else { "  ... " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match trimmed {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(&env);
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                }

                pending.push_str(&line);
                pending.push('\n');

                // Keep reading lines until the buffered forms are complete
                if let Err(e) = read_all(&pending)
                    && e.kind == ReadErrorKind::Incomplete
                {
                    continue;
                }

                let input = std::mem::take(&mut pending);
                let _ = rl.add_history_entry(input.trim_end());

                match rep(&input, &env) {
                    Ok(printed) => println!("{printed}"),
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                pending.clear();
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() -> Value {
    println!("Ensemble Lisp REPL:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current environment bindings");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Discard a partially entered form");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms:");
    println!("  def! let* do if fn* quote quasiquote quasiquoteexpand");
    println!("  defmacro! macroexpand try* catch*");
    println!("  aliases: var let const function => try catch");
    println!();
    println!("Examples:");
    println!("  (def! fib (fn* (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2))))))");
    println!("  (let* (a 5 b (+ a 1)) (* a b))");
    println!("  (defmacro! unless (fn* (c a b) `(if ~c ~b ~a)))");
    println!("  (try* (throw \"boom\") (catch* e (str \"caught \" e)))");
    println!("  (load-file \"script.ens\")");
    println!();

    Value::Nil
}

fn print_environment(env: &Environment) {
    let bindings = env.get_all_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    println!();

    // Natives first, then everything defined in the language
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match value {
            Value::BuiltinFunction { .. } => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    if !builtins.is_empty() {
        println!("Built-in functions ({}):", builtins.len());
        let mut col = 0;
        for name in builtins {
            print!("  {name:<15}");
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
        println!("Defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
