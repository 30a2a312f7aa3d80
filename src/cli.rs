//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde_json::Value;

use genpool::logging::LogFormat;
use genpool::renderer::Params;
use genpool::report::ReportFormat;

/// Generate output for a list of items with a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "genpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (repeat for more).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease verbosity (repeat for less).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Also write logs to this file (rotated daily).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render every item with a worker pool.
    Run(RunArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Worker process entry point, started by `run`.
    #[command(hide = true)]
    InternalWorker,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(self.shell, &mut Cli::command(), "genpool", &mut std::io::stdout());
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File with one item per line, or `-` for stdin.
    #[arg(default_value = "-")]
    pub items: PathBuf,

    /// Command rendering one item; `{}` is replaced by the item.
    #[arg(short = 'x', long, env = "GENPOOL_EXEC")]
    pub exec: String,

    /// Command run once before enumeration when building.
    #[arg(long)]
    pub build_cmd: Option<String>,

    /// Run the build step first.
    #[arg(short, long)]
    pub build: bool,

    /// Extra parameters for enumeration (JSON object or query string).
    #[arg(short, long, value_parser = parse_params)]
    pub params: Option<Params>,

    /// Number of workers (default: number of CPUs).
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Items sent to a worker per request.
    #[arg(long, default_value_t = 0)]
    pub worker_concurrency: usize,

    /// Stop a worker on the first unhandled item error.
    #[arg(long)]
    pub fail_on_page_error: bool,

    /// Report format.
    #[arg(long, value_enum, default_value_t = ReportFormatArg::Text)]
    pub report: ReportFormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ReportFormatArg {
    /// Summary line and error report.
    #[default]
    Text,
    /// Full run summary as JSON.
    Json,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Text => ReportFormat::Text,
            ReportFormatArg::Json => ReportFormat::Json,
        }
    }
}

impl Cli {
    /// `-v` count minus `-q` count.
    pub fn verbosity(&self) -> i8 {
        let verbose = self.verbose.min(i8::MAX as u8) as i8;
        let quiet = self.quiet.min(i8::MAX as u8) as i8;
        verbose - quiet
    }
}

/// Parse `--params`: a JSON object, otherwise a query string.
pub fn parse_params(raw: &str) -> Result<Params, String> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        return Ok(map);
    }

    let mut params = Params::new();
    for pair in raw.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key)?;
        let value = Value::String(decode_component(value)?);
        // Repeated keys collect into an array.
        match params.get_mut(&key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key, value);
            }
        }
    }
    Ok(params)
}

fn decode_component(raw: &str) -> Result<String, String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|s| s.into_owned())
        .map_err(|e| format!("invalid query string: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let args = Cli::try_parse_from(["genpool", "run", "routes.txt", "--exec", "echo {}"]).unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.items, PathBuf::from("routes.txt"));
                assert_eq!(run.exec, "echo {}");
                assert!(!run.build);
                assert_eq!(run.workers, 0);
                assert!(run.params.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_options() {
        let args = Cli::try_parse_from([
            "genpool",
            "run",
            "-x",
            "true",
            "-b",
            "-w",
            "4",
            "--worker-concurrency",
            "20",
            "--fail-on-page-error",
            "-p",
            r#"{"lang":"en"}"#,
        ])
        .unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.items, PathBuf::from("-"));
                assert!(run.build);
                assert_eq!(run.workers, 4);
                assert_eq!(run.worker_concurrency, 20);
                assert!(run.fail_on_page_error);
                assert_eq!(run.params.unwrap()["lang"], json!("en"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbosity() {
        let args = Cli::try_parse_from(["genpool", "-vv", "-q", "completions", "bash"]).unwrap();
        assert_eq!(args.verbosity(), 1);
        let args = Cli::try_parse_from(["genpool", "completions", "bash", "-qq"]).unwrap();
        assert_eq!(args.verbosity(), -2);
    }

    #[test]
    fn test_internal_worker_is_hidden() {
        let args = Cli::try_parse_from(["genpool", "internal-worker"]).unwrap();
        assert!(matches!(args.command, Commands::InternalWorker));
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("internal-worker"));
    }

    #[test]
    fn test_parse_params_json() {
        let params = parse_params(r#"{"since": 10, "tags": ["a"]}"#).unwrap();
        assert_eq!(params["since"], json!(10));
        assert_eq!(params["tags"], json!(["a"]));
    }

    #[test]
    fn test_parse_params_query_string() {
        let params = parse_params("lang=en&path=%2Fblog&tag=a&tag=b&q=hello+world&flag").unwrap();
        assert_eq!(params["lang"], json!("en"));
        assert_eq!(params["path"], json!("/blog"));
        assert_eq!(params["tag"], json!(["a", "b"]));
        assert_eq!(params["q"], json!("hello world"));
        assert_eq!(params["flag"], json!(""));
    }

    #[test]
    fn test_parse_params_non_object_json_is_query_string() {
        let params = parse_params("42").unwrap();
        assert_eq!(params["42"], json!(""));
    }
}
