//! Command line handed to spawned workers

/// Controller-only flags that take a value
const VALUE_FLAGS: &[&str] = &[
    "--jobs",
    "-j",
    "--reporter",
    "--crash-policy",
    "--grace-period-ms",
    "--worker-id",
];

/// Controller-only switches
const SWITCH_FLAGS: &[&str] = &["--strict-ordering", "--is-worker"];

/// Flags whose value is copied to the worker without being inspected
const PASSTHROUGH_FLAGS: &[&str] = &["--engine-arg", "--engine", "--config", "--log-level"];

/// Derive a worker's arguments from the controller's own
///
/// Parallelism and reporting flags are removed, then the worker reporter and
/// the worker-mode switch are appended. File arguments pass through; the
/// worker ignores them and only runs what it is sent. Values of engine and
/// config flags, and everything after `--`, are kept verbatim.
pub fn worker_args<S: AsRef<str>>(controller_args: &[S]) -> Vec<String> {
    let mut args = Vec::with_capacity(controller_args.len() + 3);
    let mut trailing = &controller_args[controller_args.len()..];
    let mut iter = controller_args.iter().enumerate();

    while let Some((index, arg)) = iter.next() {
        let arg = arg.as_ref();
        if arg == "--" {
            trailing = &controller_args[index..];
            break;
        }
        if PASSTHROUGH_FLAGS.contains(&arg) {
            args.push(arg.to_string());
            if let Some((_, value)) = iter.next() {
                args.push(value.as_ref().to_string());
            }
            continue;
        }
        if VALUE_FLAGS.contains(&arg) {
            iter.next();
            continue;
        }
        if SWITCH_FLAGS.contains(&arg) || is_inline_value(arg) {
            continue;
        }
        args.push(arg.to_string());
    }

    args.extend(["--reporter", "cluster", "--is-worker"].map(String::from));
    args.extend(trailing.iter().map(|arg| arg.as_ref().to_string()));
    args
}

/// `--flag=value` or `-jN` forms of a controller-only flag
fn is_inline_value(arg: &str) -> bool {
    if let Some((flag, _)) = arg.split_once('=') {
        return VALUE_FLAGS.contains(&flag);
    }
    arg.starts_with("-j") && !arg.starts_with("--") && arg.len() > 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_parallel_flags() {
        let args = worker_args(&[
            "--jobs",
            "4",
            "--strict-ordering",
            "--engine",
            "node",
            "a.test",
            "--reporter",
            "json",
        ]);
        assert_eq!(
            args,
            vec!["--engine", "node", "a.test", "--reporter", "cluster", "--is-worker"]
        );
    }

    #[test]
    fn test_strips_inline_forms() {
        let args = worker_args(&["-j8", "--crash-policy=requeue", "--log-level=debug", "-j", "2"]);
        assert_eq!(args, vec!["--log-level=debug", "--reporter", "cluster", "--is-worker"]);
    }

    #[test]
    fn test_worker_flags_are_not_duplicated() {
        let args = worker_args(&["--is-worker", "--worker-id", "3", "--grace-period-ms", "100"]);
        assert_eq!(args, vec!["--reporter", "cluster", "--is-worker"]);
    }

    #[test]
    fn test_engine_arg_values_are_kept() {
        let args = worker_args(&[
            "--engine",
            "make",
            "--engine-arg",
            "-j4",
            "--engine-arg=--reporter",
            "--engine-arg",
            "--jobs",
            "a.test",
        ]);
        assert_eq!(
            args,
            vec![
                "--engine",
                "make",
                "--engine-arg",
                "-j4",
                "--engine-arg=--reporter",
                "--engine-arg",
                "--jobs",
                "a.test",
                "--reporter",
                "cluster",
                "--is-worker",
            ]
        );
    }

    #[test]
    fn test_arguments_after_separator_are_kept() {
        let args = worker_args(&["-j", "2", "--", "-j3.test", "--strict-ordering"]);
        assert_eq!(
            args,
            vec!["--reporter", "cluster", "--is-worker", "--", "-j3.test", "--strict-ordering"]
        );
    }

    #[test]
    fn test_empty_input() {
        let empty: [&str; 0] = [];
        assert_eq!(worker_args(&empty), vec!["--reporter", "cluster", "--is-worker"]);
    }
}
