use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use contour_core::{
    patch_for_key, resolve_global_config_path, resolve_paths, resolve_paths_with, ConfigScope,
    ConfigStore, ContourConfig, ContourPaths, EventBus,
};
use contour_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use contour_runtime::{
    downloadable_models, ArtifactFetcher, Driver, StderrLine, SubmitOptions, Supervisor,
    SupervisorSettings, TrustedShell,
};
use contour_types::{BackendDescriptor, Command, RemoteShellParams, ShellDialect};
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "contour")]
#[command(about = "Drive Contour execution backends from the command line")]
struct Cli {
    /// Contour user directory (config, logs, models).
    #[arg(long, global = true)]
    user_dir: Option<PathBuf>,
    /// Project config layered over the global one.
    #[arg(long, global = true)]
    project_config: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start a backend, run one command on it and exit with its status.
    Run {
        #[command(flatten)]
        backend: BackendArgs,
        #[arg(long)]
        cwd: Option<String>,
        /// Environment assignment for the command, as KEY=VALUE.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Send a raw shell line instead of argv (refused by local backends).
        #[arg(long, conflicts_with = "argv")]
        shell: Option<String>,
        #[arg(last = true)]
        argv: Vec<String>,
    },
    /// Print how commands cross the trust boundary of a backend.
    Trust {
        #[command(flatten)]
        backend: BackendArgs,
    },
    #[command(subcommand)]
    Models(ModelsCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run a line through the host shell exactly as typed.
    Shell {
        line: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    /// Models in the local models directory.
    List,
    /// Models offered for download.
    Catalog,
    Fetch {
        /// Hugging Face repository, e.g. `TheBloke/phi-2-GGUF`.
        #[arg(long, requires = "file", conflicts_with = "url")]
        repo: Option<String>,
        #[arg(long, requires = "repo")]
        file: Option<String>,
        /// Branch, tag or commit of the repository.
        #[arg(long, default_value = contour_runtime::DEFAULT_REVISION)]
        revision: String,
        /// Direct `https` download instead of a repository file.
        #[arg(long)]
        url: Option<String>,
        /// Save under this name instead of the remote file name.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Delete {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Effective configuration, or each layer separately with `--layers`.
    Show {
        #[arg(long, default_value_t = false)]
        layers: bool,
    },
    /// Persist one setting, e.g. `config set session.stop_grace_ms 500`.
    Set {
        key: String,
        /// JSON value; anything that is not valid JSON is stored as a string.
        value: String,
        /// Write to the `--project-config` file instead of the global one.
        #[arg(long, default_value_t = false)]
        project: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    Local,
    Remote,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DialectChoice {
    Posix,
    Windows,
}

impl From<DialectChoice> for ShellDialect {
    fn from(value: DialectChoice) -> Self {
        match value {
            DialectChoice::Posix => ShellDialect::Posix,
            DialectChoice::Windows => ShellDialect::Windows,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct BackendArgs {
    #[arg(long, value_enum, default_value = "local")]
    backend: BackendChoice,
    /// Backend program for local sessions; defaults to the bundled `contour-agent`.
    #[arg(long)]
    agent: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    identity_file: Option<String>,
    #[arg(long, value_enum, default_value = "posix")]
    remote_dialect: DialectChoice,
    /// Program started on the remote host.
    #[arg(long, default_value = "contour-agent")]
    remote_agent: String,
    #[arg(long)]
    device: Option<String>,
}

fn descriptor_from(args: &BackendArgs) -> anyhow::Result<BackendDescriptor> {
    match args.backend {
        BackendChoice::Local => {
            let program = args.agent.clone().unwrap_or_else(default_agent_program);
            Ok(BackendDescriptor::local(Command::new(program)))
        }
        BackendChoice::Remote => {
            let host = args
                .host
                .clone()
                .context("--host is required for remote backends")?;
            let mut params = RemoteShellParams::new(host, Command::new(args.remote_agent.clone()));
            params.user = args.user.clone();
            params.port = args.port;
            params.identity_file = args.identity_file.clone();
            params.dialect = args.remote_dialect.into();
            Ok(BackendDescriptor::remote_shell(params))
        }
        BackendChoice::Device => {
            let path = args
                .device
                .clone()
                .context("--device is required for device backends")?;
            Ok(BackendDescriptor::device(path))
        }
    }
}

/// `contour-agent` next to this executable, else whatever is on `PATH`.
fn default_agent_program() -> String {
    let name = if cfg!(windows) {
        "contour-agent.exe"
    } else {
        "contour-agent"
    };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

fn command_from(
    argv: Vec<String>,
    shell: Option<String>,
    cwd: Option<String>,
    env: &[String],
) -> anyhow::Result<Command> {
    let mut command = match shell {
        Some(line) => Command::shell_line(line),
        None => {
            let mut parts = argv.into_iter();
            let program = parts
                .next()
                .context("nothing to run: pass a program after `--` or use --shell")?;
            Command::new(program).args(parts)
        }
    };
    if let Some(dir) = cwd {
        command = command.current_dir(dir);
    }
    for assignment in env {
        let (key, value) = assignment
            .split_once('=')
            .with_context(|| format!("--env expects KEY=VALUE, got `{}`", assignment))?;
        command = command.env(key, value);
    }
    Ok(command)
}

fn build_cli_overrides(timeout_ms: Option<u64>) -> Option<serde_json::Value> {
    timeout_ms.map(|ms| json!({ "session": { "command_timeout_ms": ms } }))
}

/// Backend exit status as a process status byte. Only a real 0 maps to 0;
/// missing codes and codes outside `1..=255` (negative NTSTATUS crashes,
/// wrapped values) become 1.
fn status_byte(code: Option<i32>) -> u8 {
    match code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}

fn exit_code_from(code: Option<i32>) -> ExitCode {
    ExitCode::from(status_byte(code))
}

async fn load_config(
    paths: &ContourPaths,
    project_config: Option<PathBuf>,
    overrides: Option<serde_json::Value>,
) -> anyhow::Result<(ConfigStore, ContourConfig)> {
    let store = ConfigStore::open(resolve_global_config_path(paths), project_config, overrides)
        .await
        .context("failed to load configuration")?;
    let config = store.get().await?;
    Ok((store, config))
}

fn config_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run_config(store: &ConfigStore, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show { layers: true } => print_json(&store.get_layers_value().await),
        ConfigCommand::Show { layers: false } => print_json(&store.get_effective_value().await),
        ConfigCommand::Set {
            key,
            value,
            project,
        } => {
            let scope = if project {
                ConfigScope::Project
            } else {
                ConfigScope::Global
            };
            let patch = patch_for_key(&key, config_value(&value))?;
            let config = store.patch(scope, patch).await?;
            print_json(&config)
        }
    }
}

fn models_dir(paths: &ContourPaths, config: &ContourConfig) -> PathBuf {
    config
        .artifacts
        .models_dir
        .clone()
        .unwrap_or_else(|| paths.models_dir.clone())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let paths = match cli.user_dir.clone() {
        Some(dir) => resolve_paths_with(Some(dir))?,
        None => resolve_paths()?,
    };
    let overrides = match &cli.command {
        CliCommand::Run { timeout_ms, .. } => build_cli_overrides(*timeout_ms),
        _ => None,
    };
    let (store, config) = load_config(&paths, cli.project_config.clone(), overrides).await?;
    let logs_dir = config
        .logging
        .logs_dir
        .clone()
        .unwrap_or_else(|| paths.logs_dir.clone());
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Cli, &logs_dir, config.logging.retention_days)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "cli.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..ObservabilityEvent::default()
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    match cli.command {
        CliCommand::Run {
            backend,
            cwd,
            env,
            timeout_ms: _,
            shell,
            argv,
        } => {
            let descriptor = descriptor_from(&backend)?;
            let command = command_from(argv, shell, cwd, &env)?;
            run_once(&config, descriptor, &command).await
        }
        CliCommand::Trust { backend } => {
            let descriptor = descriptor_from(&backend)?;
            let driver = Driver::for_descriptor(&descriptor);
            print_json(&json!({
                "capabilities": driver.capabilities(),
                "trust_boundary": driver.describe_trust_boundary(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Models(models) => {
            run_models(&models_dir(&paths, &config), models).await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Config(command) => {
            run_config(&store, command).await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Shell { line, cwd } => {
            let mut shell = TrustedShell::new();
            if let Some(dir) = cwd {
                shell = shell.current_dir(dir);
            }
            let output = shell.run(&line).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(exit_code_from(output.exit_code))
        }
    }
}

async fn run_once(
    config: &ContourConfig,
    descriptor: BackendDescriptor,
    command: &Command,
) -> anyhow::Result<ExitCode> {
    let supervisor = Supervisor::new(SupervisorSettings::from_config(config), EventBus::new());
    info!("starting {} backend", descriptor.kind().as_str());
    if let Err(err) = supervisor.start_backend(descriptor).await {
        eprintln!("{}", err.user_message());
        print_backend_stderr(&supervisor.stderr_tail(20));
        return Err(err.into());
    }
    let result = supervisor
        .submit_command(command, SubmitOptions::default())
        .await;
    if let Err(err) = &result {
        eprintln!("{}", err.user_message());
        print_backend_stderr(&supervisor.stderr_tail(20));
    }
    supervisor.shutdown().await;
    let outcome = result?;
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);
    Ok(exit_code_from(outcome.exit_code))
}

fn print_backend_stderr(lines: &[StderrLine]) {
    for line in lines {
        eprintln!("  {}", stderr_line_label(line));
    }
}

fn stderr_line_label(line: &StderrLine) -> String {
    match line.request_id {
        Some(id) => format!("[request {}] {}", id, line.text),
        None => line.text.clone(),
    }
}

async fn run_models(models_dir: &Path, command: ModelsCommand) -> anyhow::Result<()> {
    let fetcher = ArtifactFetcher::new(models_dir)?;
    match command {
        ModelsCommand::List => print_json(&fetcher.list_models().await?),
        ModelsCommand::Catalog => print_json(&downloadable_models()),
        ModelsCommand::Fetch {
            repo,
            file,
            revision,
            url,
            name,
            force,
        } => {
            let report = |progress: &contour_runtime::DownloadProgress| {
                eprint!("\r{:5.1}% {:>12}", progress.percent, progress.speed);
            };
            let path = match (url, repo, file) {
                (Some(url), _, _) => {
                    fetcher
                        .download_url(&url, name.as_deref(), force, report)
                        .await?
                }
                (None, Some(repo), Some(file)) => {
                    fetcher
                        .download_model(&repo, &file, &revision, name.as_deref(), force, report)
                        .await?
                }
                _ => fetcher.download_recommended(force, report).await?,
            };
            eprintln!();
            println!("{}", path.display());
            Ok(())
        }
        ModelsCommand::Delete { path } => {
            if fetcher.delete_model(&path).await? {
                println!("deleted {}", path.display());
            } else {
                println!("{} is not a model file; nothing deleted", path.display());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contour_types::BackendKind;

    fn backend(kind: BackendChoice) -> BackendArgs {
        BackendArgs {
            backend: kind,
            agent: Some("/opt/contour/agent".to_string()),
            host: None,
            user: None,
            port: None,
            identity_file: None,
            remote_dialect: DialectChoice::Posix,
            remote_agent: "contour-agent".to_string(),
            device: None,
        }
    }

    #[test]
    fn remote_backend_requires_a_host() {
        let err = descriptor_from(&backend(BackendChoice::Remote)).unwrap_err();
        assert!(err.to_string().contains("--host"));

        let mut args = backend(BackendChoice::Remote);
        args.host = Some("build.example.org".to_string());
        args.port = Some(2222);
        args.remote_dialect = DialectChoice::Windows;
        let descriptor = descriptor_from(&args).expect("descriptor");
        assert_eq!(descriptor.kind(), BackendKind::RemoteShell);
    }

    #[test]
    fn device_backend_requires_a_path() {
        assert!(descriptor_from(&backend(BackendChoice::Device)).is_err());
        let mut args = backend(BackendChoice::Device);
        args.device = Some("/dev/ttyUSB0".to_string());
        assert_eq!(
            descriptor_from(&args).expect("descriptor").kind(),
            BackendKind::Device
        );
    }

    #[test]
    fn command_from_argv_keeps_arguments_verbatim() {
        let command = command_from(
            vec!["echo".into(), "a b".into(), "$HOME".into()],
            None,
            Some("/tmp".into()),
            &["LANG=C".to_string()],
        )
        .expect("command");
        assert_eq!(command.argv(), vec!["echo", "a b", "$HOME"]);
        assert_eq!(command.working_directory.as_deref(), Some("/tmp"));
        assert_eq!(command.environment.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn command_from_rejects_bad_env_and_empty_argv() {
        assert!(command_from(vec![], None, None, &[]).is_err());
        let err = command_from(vec!["ls".into()], None, None, &["NOVALUE".to_string()]).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn timeout_flag_becomes_a_session_override() {
        assert!(build_cli_overrides(None).is_none());
        let overrides = build_cli_overrides(Some(1500)).expect("some");
        assert_eq!(overrides["session"]["command_timeout_ms"], json!(1500));
    }

    #[test]
    fn in_range_exit_codes_pass_through() {
        assert_eq!(status_byte(Some(0)), 0);
        assert_eq!(status_byte(Some(3)), 3);
        assert_eq!(status_byte(Some(255)), 255);
        assert_eq!(status_byte(None), 1);
    }

    #[test]
    fn crashed_backends_never_exit_successfully() {
        assert_eq!(status_byte(Some(-1073741819)), 1);
        assert_eq!(status_byte(Some(-9)), 1);
        assert_eq!(status_byte(Some(256)), 1);
        assert_eq!(status_byte(Some(300)), 1);
    }

    #[test]
    fn models_fetch_accepts_a_url_or_a_repository_revision() {
        let cli = Cli::try_parse_from([
            "contour", "models", "fetch", "--repo", "org/repo", "--file", "m.gguf", "--revision", "v2",
        ])
        .expect("parse");
        match cli.command {
            CliCommand::Models(ModelsCommand::Fetch { revision, url, .. }) => {
                assert_eq!(revision, "v2");
                assert!(url.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["contour", "models", "fetch", "--url", "https://h/m.gguf"])
            .expect("parse");
        match cli.command {
            CliCommand::Models(ModelsCommand::Fetch { revision, url, .. }) => {
                assert_eq!(revision, "main");
                assert_eq!(url.as_deref(), Some("https://h/m.gguf"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "contour", "models", "fetch", "--url", "https://h/m.gguf", "--repo", "a/b", "--file", "m",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn models_fetch_refuses_unsafe_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        for url in ["http://host.example/m.gguf", "https://host.example/..%2Fm.gguf"] {
            let command = ModelsCommand::Fetch {
                repo: None,
                file: None,
                revision: "main".to_string(),
                url: Some(url.to_string()),
                name: None,
                force: false,
            };
            assert!(run_models(&models, command).await.is_err(), "{url}");
        }
        assert!(!models.exists());
    }

    #[test]
    fn config_values_fall_back_to_strings() {
        assert_eq!(config_value("500"), json!(500));
        assert_eq!(config_value("false"), json!(false));
        assert_eq!(config_value("length_prefixed"), json!("length_prefixed"));
    }

    #[tokio::test]
    async fn config_set_writes_the_chosen_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global = dir.path().join("config.json");
        let project = dir.path().join("project.json");
        let store = ConfigStore::open(&global, Some(project.clone()), None)
            .await
            .expect("open");

        run_config(
            &store,
            ConfigCommand::Set {
                key: "session.stop_grace_ms".to_string(),
                value: "750".to_string(),
                project: true,
            },
        )
        .await
        .expect("set");
        assert!(!global.exists());
        assert_eq!(store.get().await.expect("config").session.stop_grace_ms, 750);

        let err = run_config(
            &store,
            ConfigCommand::Set {
                key: "protocol.framing".to_string(),
                value: "carrier-pigeon".to_string(),
                project: false,
            },
        )
        .await
        .expect_err("unknown framing");
        assert!(err.to_string().starts_with("Invalid configuration"), "{err}");
        assert!(!global.exists());
    }

    #[test]
    fn cli_parses_run_with_trailing_argv() {
        let cli = Cli::try_parse_from(["contour", "run", "--env", "A=1", "--", "ls", "-l"])
            .expect("parse");
        match cli.command {
            CliCommand::Run { argv, env, backend, .. } => {
                assert_eq!(argv, vec!["ls", "-l"]);
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(backend.backend, BackendChoice::Local);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
