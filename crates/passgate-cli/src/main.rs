//! Passgate CLI
//!
//! Usage:
//!   passgate check [FILE]            Evaluate a payload without writing it
//!   passgate write [OPTIONS] TARGET  Write stdin to TARGET through the gate

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use passgate::{
    EventSink, FsStorage, GateConfig, InterceptionHandle, JsonLinesSink, MonitoredTarget,
    StorageError, TracingSink, WriteStorage, evaluate_payload, install,
};

/// Keep unauthorized accounts out of an account registry file
#[derive(Parser, Debug)]
#[command(name = "passgate")]
#[command(about = "Write-path gate for an account registry file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a payload against the whitelist and print the decision
    Check {
        #[command(flatten)]
        policy: PolicyArgs,
        /// Payload file (stdin when omitted)
        file: Option<PathBuf>,
    },
    /// Write stdin to TARGET through the gate
    Write {
        #[command(flatten)]
        policy: PolicyArgs,
        /// Resolve absolute targets beneath this directory
        #[arg(long)]
        root: Option<PathBuf>,
        /// File offset to write at
        #[arg(long, default_value_t = 0, conflicts_with = "append")]
        offset: u64,
        /// Write at the current end of the file
        #[arg(long)]
        append: bool,
        /// Where enforcement events go
        #[arg(long, value_enum, default_value_t = EventFormat::Log)]
        events: EventFormat,
        /// Path to write
        target: String,
    },
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Whitelisted identity (repeatable, replaces the configured whitelist)
    #[arg(long = "allow", value_name = "NAME")]
    allow: Vec<String>,
    /// Monitor every file with this name instead of the configured target
    #[arg(long, value_name = "NAME")]
    file_name: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EventFormat {
    /// Structured log records on stderr
    Log,
    /// One JSON object per line on stdout
    Jsonl,
}

impl PolicyArgs {
    fn load(&self) -> anyhow::Result<GateConfig> {
        let mut config = match &self.config {
            Some(path) => GateConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => GateConfig::default(),
        };
        if !self.allow.is_empty() {
            config.whitelist = self.allow.clone();
        }
        if let Some(name) = &self.file_name {
            config.target = MonitoredTarget::file_name(name.clone());
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn read_payload(file: Option<&PathBuf>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        }
        None => {
            let mut payload = Vec::new();
            std::io::stdin()
                .read_to_end(&mut payload)
                .context("failed to read stdin")?;
            Ok(payload)
        }
    }
}

fn check(policy: &PolicyArgs, file: Option<&PathBuf>) -> anyhow::Result<i32> {
    let config = policy.load()?;
    let payload = read_payload(file)?;
    let verdict = evaluate_payload(&config.whitelist(), config.format, &payload);
    println!("{}", serde_json::to_string(&verdict)?);
    Ok(if verdict.decision.is_allowed() { 0 } else { 1 })
}

async fn write(
    policy: &PolicyArgs,
    root: Option<PathBuf>,
    offset: u64,
    append: bool,
    events: EventFormat,
    target: &str,
) -> anyhow::Result<i32> {
    let config = policy.load()?;
    let payload = read_payload(None)?;
    let storage = match root {
        Some(root) => FsStorage::rooted(root),
        None => FsStorage::new(),
    };
    let sink: Arc<dyn EventSink> = match events {
        EventFormat::Log => Arc::new(TracingSink),
        EventFormat::Jsonl => Arc::new(JsonLinesSink::new(std::io::stdout())),
    };
    let handle = install(config, storage, sink)?;
    write_through(&handle, target, (!append).then_some(offset), &payload).await
}

/// Write `payload` to `target` through the installed gate, at `offset` or at
/// the end of the file when `offset` is `None`. Returns the exit code.
async fn write_through<S: WriteStorage + 'static>(
    handle: &InterceptionHandle<S>,
    target: &str,
    offset: Option<u64>,
    payload: &[u8],
) -> anyhow::Result<i32> {
    let offset = match offset {
        Some(offset) => offset,
        None => match handle.storage().size(target).await {
            Ok(size) => size,
            Err(StorageError::NotFound(_)) => 0,
            Err(e) => return Err(e).with_context(|| format!("failed to stat {target}")),
        },
    };

    match handle.write(target, offset, payload).await {
        Ok(outcome) => {
            tracing::debug!(
                written = outcome.written,
                inspected = outcome.inspected,
                "write complete"
            );
            Ok(0)
        }
        Err(e) => {
            let errno = e.errno();
            eprintln!(
                "passgate: {}: {}",
                target,
                std::io::Error::from_raw_os_error(errno)
            );
            Ok(1)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - output to stderr so it doesn't interfere with event output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let code = match &cli.command {
        Command::Check { policy, file } => check(policy, file.as_ref())?,
        Command::Write {
            policy,
            root,
            offset,
            append,
            events,
            target,
        } => write(policy, root.clone(), *offset, *append, *events, target).await?,
    };

    std::process::exit(code);
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_policy_overrides() {
        let cli = Cli::parse_from([
            "passgate",
            "check",
            "--allow",
            "operator",
            "--allow",
            "backup",
            "--file-name",
            "passwd",
        ]);
        let Command::Check { policy, file } = cli.command else {
            panic!("expected check");
        };
        assert!(file.is_none());
        let config = policy.load().unwrap();
        assert_eq!(config.whitelist, vec!["operator", "backup"]);
        assert_eq!(config.target, MonitoredTarget::file_name("passwd"));
    }

    #[test]
    fn test_config_file_and_invalid_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passgate.json");
        std::fs::write(&path, r#"{"whitelist": ["svc"], "report_allowed": false}"#).unwrap();

        let policy = PolicyArgs {
            config: Some(path.clone()),
            allow: vec![],
            file_name: None,
        };
        let config = policy.load().unwrap();
        assert_eq!(config.whitelist, vec!["svc"]);
        assert!(!config.report_allowed);

        let policy = PolicyArgs {
            config: Some(path),
            allow: vec!["bad:name".to_string()],
            file_name: None,
        };
        assert!(policy.load().is_err());
    }

    fn operator_only() -> PolicyArgs {
        PolicyArgs {
            config: None,
            allow: vec!["operator".to_string()],
            file_name: None,
        }
    }

    #[test]
    fn test_check_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        let denied = dir.path().join("denied");
        std::fs::write(&allowed, b"operator:x:1000:1000::/home/operator:/bin/sh\n").unwrap();
        std::fs::write(&denied, b"operator:x:1000\nmallory:x:1001\n").unwrap();

        let policy = operator_only();
        assert_eq!(check(&policy, Some(&allowed)).unwrap(), 0);
        assert_eq!(check(&policy, Some(&denied)).unwrap(), 1);
        assert!(check(&policy, Some(&dir.path().join("missing"))).is_err());
    }

    // Installation is once per process, so this is the only test that installs.
    #[tokio::test]
    async fn test_write_through_installed_gate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        let passwd = dir.path().join("etc/passwd");
        std::fs::write(&passwd, b"root:x:0:0::/root:/bin/sh\n").unwrap();

        let config = operator_only().load().unwrap();
        let sink = Arc::new(passgate::MemorySink::new());
        let handle = install(config, FsStorage::rooted(dir.path()), sink.clone()).unwrap();

        let operator = b"operator:x:1000:1000::/home/operator:/bin/sh\n";
        assert_eq!(
            write_through(&handle, "/etc/passwd", None, operator).await.unwrap(),
            0
        );
        let expected = [b"root:x:0:0::/root:/bin/sh\n".as_slice(), operator].concat();
        assert_eq!(std::fs::read(&passwd).unwrap(), expected);

        for target in ["/etc/passwd", "/etc/./passwd", "etc/passwd"] {
            let code = write_through(&handle, target, None, b"mallory:x:0:0::/:/bin/sh\n")
                .await
                .unwrap();
            assert_eq!(code, 1, "{target}");
            assert_eq!(std::fs::read(&passwd).unwrap(), expected);
        }
        assert_eq!(sink.len(), 4);

        // Appending to a file that doesn't exist yet starts at zero.
        assert_eq!(
            write_through(&handle, "/etc/motd", None, b"hello\n").await.unwrap(),
            0
        );
        assert_eq!(std::fs::read(dir.path().join("etc/motd")).unwrap(), b"hello\n");
        assert_eq!(
            write_through(&handle, "/etc/motd", Some(0), b"J").await.unwrap(),
            0
        );
        assert_eq!(std::fs::read(dir.path().join("etc/motd")).unwrap(), b"Jello\n");
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn test_offset_conflicts_with_append() {
        let result = Cli::try_parse_from([
            "passgate", "write", "--offset", "10", "--append", "/etc/passwd",
        ]);
        assert!(result.is_err());
    }
}
