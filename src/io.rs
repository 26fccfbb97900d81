//! Host I/O natives: `slurp`, `spit`, `readln`, `readir` and `load-file`, plus `*ARGV*` setup for
//! drivers. File and console failures are raised as [`Error::IoError`], so programs can
//! catch them with `try*`.

use std::io::{BufRead, Write};

use crate::Error;
use crate::ast::{Value, list, vector};
use crate::evaluator::Environment;

/// `load-file` reads a whole file as one `do` form and evaluates it in the root
/// environment. The trailing `nil` keeps the file's last value from leaking out.
pub(crate) const PRELUDE: &str = r#"
(def! load-file
  (fn* (f)
    (eval (read-string (str "(do " (slurp f) "\nnil)")))))
"#;

fn io_error(path: &str, e: &std::io::Error) -> Error {
    Error::IoError(format!("{path}: {e}"))
}

fn slurp(path: &str) -> Result<String, Error> {
    tracing::debug!(path, "slurp");
    std::fs::read_to_string(path).map_err(|e| io_error(path, &e))
}

fn spit(path: &str, content: &str) -> Result<Value, Error> {
    tracing::debug!(path, bytes = content.len(), "spit");
    std::fs::write(path, content).map_err(|e| io_error(path, &e))?;
    Ok(Value::Nil)
}

/// Names of the entries in a directory, sorted
fn readir(path: &str) -> Result<Value, Error> {
    tracing::debug!(path, "readir");
    let mut names = std::fs::read_dir(path)
        .and_then(|entries| {
            entries
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<Result<Vec<_>, _>>()
        })
        .map_err(|e| io_error(path, &e))?;
    names.sort();
    Ok(vector(names.into_iter().map(Value::String)))
}

/// Prompt on stdout, then read one line from stdin. `nil` at end of input.
fn readln(prompt: &str) -> Result<Value, Error> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{prompt}")
        .and_then(|()| stdout.flush())
        .map_err(|e| io_error("stdout", &e))?;

    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| io_error("stdin", &e))?;
    if read == 0 {
        return Ok(Value::Nil);
    }
    let trimmed = line.strip_suffix('\n').unwrap_or(&line);
    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
    Ok(Value::String(trimmed.to_owned()))
}

pub(crate) fn install(env: &Environment) {
    env.register_builtin_operation::<_, (&str,)>("slurp", slurp);
    env.register_builtin_operation::<_, (&str, &str)>("spit", spit);
    env.register_builtin_operation::<_, (&str,)>("readln", readln);
    env.register_builtin_operation::<_, (&str,)>("readir", readir);
}

/// Bind `*ARGV*` in the root of `env` to the given command-line arguments
pub fn set_argv<I, S>(env: &Environment, args: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv = list(args.into_iter().map(|arg| Value::String(arg.into())));
    env.root().set("*ARGV*", argv);
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::{create_global_env, rep};
    use std::path::PathBuf;

    /// A per-test path in the system temp directory, removed on drop
    struct TempPath(PathBuf);

    impl TempPath {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir()
                .join(format!("ensemble-{}-{name}", std::process::id()));
            TempPath(path)
        }

        fn as_str(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    /// Escape a host path for use inside a string literal
    fn quoted(path: &TempPath) -> String {
        format!("{:?}", path.as_str())
    }

    #[test]
    fn test_spit_then_slurp() {
        let path = TempPath::new("spit.txt");
        let env = create_global_env();
        let spit_form = format!("(spit {} \"hello\\nworld\")", quoted(&path));
        assert_eq!(rep(&spit_form, &env).unwrap(), "nil");
        let slurp_form = format!("(slurp {})", quoted(&path));
        assert_eq!(rep(&slurp_form, &env).unwrap(), "\"hello\\nworld\"");
    }

    #[test]
    fn test_slurp_missing_file_is_catchable() {
        let env = create_global_env();
        let err = rep("(slurp \"/definitely/not/here.ens\")", &env).unwrap_err();
        assert!(matches!(err, Error::IoError(_)), "{err:?}");
        assert_eq!(
            rep(
                "(try* (slurp \"/definitely/not/here.ens\") (catch* e :missing))",
                &env
            )
            .unwrap(),
            ":missing"
        );
    }

    #[test]
    fn test_load_file_defines_in_root() {
        let path = TempPath::new("load.ens");
        std::fs::write(
            &path.0,
            ";; helpers\n(def! inc (fn* (x) (+ x 1)))\n(def! answer (inc 41))\n",
        )
        .unwrap();

        let env = create_global_env();
        let form = format!("(let* (unused 1) (load-file {}))", quoted(&path));
        assert_eq!(rep(&form, &env).unwrap(), "nil");
        assert_eq!(rep("answer", &env).unwrap(), "42");
        assert_eq!(rep("(inc 1)", &env).unwrap(), "2");
    }

    #[test]
    fn test_load_file_ending_in_comment() {
        let path = TempPath::new("comment.ens");
        std::fs::write(&path.0, "(def! x 1) ; trailing comment without newline").unwrap();
        let env = create_global_env();
        let form = format!("(load-file {})", quoted(&path));
        assert_eq!(rep(&form, &env).unwrap(), "nil");
        assert_eq!(rep("x", &env).unwrap(), "1");
    }

    #[test]
    fn test_readir_lists_sorted_names() {
        let dir = std::env::temp_dir().join(format!("ensemble-{}-readir", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.txt"), "").unwrap();
        std::fs::write(dir.join("a.txt"), "").unwrap();

        let env = create_global_env();
        let form = format!("(readir {:?})", dir.to_str().unwrap());
        let listed = rep(&form, &env);
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(listed.unwrap(), "[\"a.txt\" \"b.txt\"]");

        let err = rep(&form, &env).unwrap_err();
        assert!(matches!(err, Error::IoError(_)), "{err:?}");
        assert_eq!(rep("(readir 1)", &env).map_err(|e| e.name()), Err("TypeError"));
    }

    #[test]
    fn test_set_argv() {
        let env = create_global_env();
        let child = Environment::with_parent(&env);
        set_argv(&child, ["a.ens", "--flag"]);
        assert_eq!(rep("*ARGV*", &env).unwrap(), "(\"a.ens\" \"--flag\")");
    }
}
