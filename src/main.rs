//! Purpose: `shieldexec` CLI entry point.
//! Role: Binary crate root; parses args and runs the HTTP server or a small utility command.
//! Invariants: Errors are emitted as JSON on stderr unless stderr is a terminal.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

use shieldexec::core::error::{Error, ErrorKind, to_exit_code};
use shieldexec::serve::{self, ServeConfig};

#[derive(Parser)]
#[command(
    name = "shieldexec",
    version,
    about = "Per-session command execution for remote statistical interpreters",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the HTTP command server",
        long_about = r#"Serve the command API over HTTP.

Each caller (X-User header) gets one interpreter session per profile (X-Profile header).
Commands for a session run one at a time, in submission order."#,
        after_help = r#"EXAMPLES
  $ shieldexec serve --profile default=http://127.0.0.1:6311
  $ shieldexec serve --bind 0.0.0.0:8080 --token s3cret \
      --profile default=http://rserver:6311 --profile exposome=http://rserver-exposome:6311

NOTES
  - Non-loopback binds require --token.
  - --admin-token additionally guards /install-package."#
    )]
    Serve(ServeArgs),
    #[command(about = "Print version info as JSON")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ shieldexec completion bash > ~/.local/share/bash-completion/completions/shieldexec
  $ shieldexec completion zsh > ~/.zfunc/_shieldexec"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080", help = "Address to bind (host:port)")]
    bind: String,
    #[arg(
        long = "workspace-dir",
        value_name = "DIR",
        default_value = "workspaces",
        value_hint = ValueHint::DirPath,
        help = "Directory holding saved workspaces"
    )]
    workspace_dir: PathBuf,
    #[arg(
        long = "profile",
        value_name = "NAME=URL",
        required = true,
        help = "Interpreter backend for a profile (repeatable)"
    )]
    profiles: Vec<String>,
    #[arg(
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        help = "JSON file with allowed aggregate/assign methods"
    )]
    methods: Option<PathBuf>,
    #[arg(long, help = "Bearer token required on every request")]
    token: Option<String>,
    #[arg(long = "admin-token", help = "Bearer token required for package installation")]
    admin_token: Option<String>,
    #[arg(long = "public-url", help = "Base URL used in Location headers")]
    public_url: Option<String>,
    #[arg(
        long = "max-body-bytes",
        default_value_t = 100 * 1024 * 1024,
        help = "Request body limit in bytes"
    )]
    max_body_bytes: u64,
    #[arg(
        long = "idle-timeout-secs",
        default_value_t = 1800,
        help = "Close sessions idle for this long"
    )]
    idle_timeout_secs: u64,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `shieldexec --help` for usage."));
            }
        },
    };

    match cli.command {
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(0)
        }
        Command::Version => {
            emit_version_output();
            Ok(0)
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "shieldexec", &mut io::stdout());
            Ok(0)
        }
    }
}

fn serve_config_from_args(args: ServeArgs) -> Result<ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8080.")
    })?;
    let mut profiles = BTreeMap::new();
    for entry in &args.profiles {
        let (name, url) = parse_profile(entry)?;
        if profiles.insert(name.to_string(), url.to_string()).is_some() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("profile '{name}' given more than once")));
        }
    }
    Ok(ServeConfig {
        bind,
        workspace_dir: args.workspace_dir,
        profiles,
        methods: args.methods,
        token: args.token,
        admin_token: args.admin_token,
        public_url: args.public_url,
        max_body_bytes: args.max_body_bytes,
        idle_timeout_secs: args.idle_timeout_secs,
    })
}

fn parse_profile(entry: &str) -> Result<(&str, &str), Error> {
    match entry.split_once('=') {
        Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
            Ok((name.trim(), url.trim()))
        }
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid --profile '{entry}'"))
            .with_hint("Use NAME=URL, e.g. --profile default=http://127.0.0.1:6311.")),
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error:").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("shieldexec {}", env!("CARGO_PKG_VERSION"));
    } else {
        println!(
            "{}",
            json!({
                "name": "shieldexec",
                "version": env!("CARGO_PKG_VERSION"),
            })
        );
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Parse => "parse error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Execution => "execution failed".to_string(),
        ErrorKind::Unavailable => "backend unavailable".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
