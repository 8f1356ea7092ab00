use serde_json::Value;

use crate::pipeline::{Args, EntryPoint};

/// Command line arguments for running `entry_point` with `args`.
///
/// The entry point's fixed arguments come first, then one entry per argument in key order:
/// `true` becomes a bare `--key`, `false` and `null` are omitted, and anything else becomes
/// `--key value` (arrays and objects as JSON).
pub fn command_args(entry_point: &EntryPoint, args: &Args) -> Vec<String> {
    let mut command = entry_point.args.clone();
    for (key, value) in args {
        let flag = format!("--{key}");
        match value {
            Value::Bool(true) => command.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(value) => command.extend([flag, value.clone()]),
            Value::Number(value) => command.extend([flag, value.to_string()]),
            value @ (Value::Array(_) | Value::Object(_)) => {
                command.extend([flag, value.to_string()])
            }
        }
    }
    command
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_flags_and_values() {
        let entry_point = EntryPoint::new("python").with_args(["-m", "pipelines.crm"]);
        let args = Args::from([
            ("full".to_owned(), json!(true)),
            ("dry_run".to_owned(), json!(false)),
            ("since".to_owned(), json!("2024-01-01")),
            ("batch".to_owned(), json!(500)),
            ("skip".to_owned(), json!(null)),
            ("tables".to_owned(), json!(["a", "b"])),
        ]);

        assert_eq!(
            command_args(&entry_point, &args),
            vec![
                "-m",
                "pipelines.crm",
                "--batch",
                "500",
                "--full",
                "--since",
                "2024-01-01",
                "--tables",
                r#"["a","b"]"#,
            ]
        );
    }

    #[test]
    fn no_args() {
        assert!(command_args(&EntryPoint::new("true"), &Args::new()).is_empty());
    }
}
