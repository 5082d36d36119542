pub mod codec;
pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod log_retention;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transport;
pub mod tree;
pub mod tree_store;

use clap::{error::ErrorKind, Parser, Subcommand};
use codec::LogReader;
use config::{load_config, AppConfig, CliOverrides};
use driver::{drive, DriveOptions};
use engine::{Value, ValueEngine, ValueType};
use errors::FuzzError;
use registry::CapabilityRegistry;
use runtime::ProductionRuntime;
use server::ProtocolServer;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tree_store::TreeStore;

#[derive(Debug, Clone, Parser)]
#[command(name = "fuzzgen")]
#[command(about = "Replayable random value generation and a shared execution tree server")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve value requests and termination messages over TCP.
    Serve {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long = "strict-decisions", default_value_t = false)]
        strict_decisions: bool,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long = "session-log-dir")]
        session_log_dir: Option<PathBuf>,
    },
    /// Run a harness repeatedly and report each exit status to a server.
    Drive {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long = "session-prefix", default_value = "run")]
        session_prefix: String,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Construct values of a type, replaying a log when one is given.
    Make {
        value_type: String,
        replay: Option<PathBuf>,
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long = "spin-limit")]
        spin_limit: Option<u32>,
        #[arg(long = "depth-limit")]
        depth_limit: Option<u32>,
    },
    /// Print the records of a value log.
    DumpLog {
        path: PathBuf,
        #[arg(long = "decision-id")]
        decision_id: Option<u64>,
    },
    /// Check that a replay log matches its source byte for byte.
    CompareLogs { left: PathBuf, right: PathBuf },
    /// Write one JSON line per stored tree node with its feature window.
    Export {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        window: Option<usize>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

pub fn run() -> Result<i32, FuzzError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| FuzzError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, FuzzError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(FuzzError::Cli(error.to_string())),
        },
    };

    let overrides = overrides_for(&cli, cwd);
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    logging::init_tracing(&cfg.logging.level);

    match cli.command {
        Command::Serve { .. } => run_serve(&cfg, runtime),
        Command::Drive {
            endpoint,
            count,
            session_prefix,
            program,
            args,
        } => {
            let options = DriveOptions {
                program,
                args,
                cwd: Some(cwd.to_path_buf()),
                count: count.unwrap_or(cfg.driver.count),
                endpoint: endpoint.unwrap_or_else(|| cfg.driver.endpoint.clone()),
                session_prefix,
            };
            let summary = tokio_runtime()?.block_on(drive(
                Arc::clone(&runtime.process_runner),
                &options,
            ))?;
            let line = serde_json::to_string(&summary).map_err(|e| FuzzError::Io(e.to_string()))?;
            runtime.terminal.write_line(&line)?;
            Ok(0)
        }
        Command::Make {
            value_type,
            replay,
            log,
            count,
            ..
        } => run_make(&cfg, runtime, cwd, &value_type, replay, log, count),
        Command::DumpLog { path, decision_id } => {
            let mut reader = LogReader::open(cwd.join(path))?;
            for record in reader.records() {
                let record = record?;
                if decision_id.is_some_and(|id| id != record.decision_id) {
                    continue;
                }
                runtime.terminal.write_line(&record.to_string())?;
            }
            Ok(0)
        }
        Command::CompareLogs { left, right } => compare_logs(runtime, &cwd.join(left), &cwd.join(right)),
        Command::Export {
            store,
            window,
            output,
        } => run_export(&cfg, runtime, store.map(|p| cwd.join(p)), window, output.map(|p| cwd.join(p))),
    }
}

fn overrides_for(cli: &Cli, cwd: &Path) -> CliOverrides {
    let mut overrides = CliOverrides {
        config_path: cli.config.as_ref().map(|p| cwd.join(p)),
        log_level: cli.log_level.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Serve {
            listen,
            seed,
            strict_decisions,
            store,
            session_log_dir,
        } => {
            overrides.listen = listen.clone();
            overrides.server_seed = *seed;
            overrides.strict_decisions = *strict_decisions;
            overrides.store_path = store.clone();
            overrides.session_log_dir = session_log_dir.clone();
        }
        Command::Make {
            seed,
            spin_limit,
            depth_limit,
            ..
        } => {
            overrides.engine_seed = *seed;
            overrides.spin_limit = *spin_limit;
            overrides.depth_limit = *depth_limit;
        }
        _ => {}
    }
    overrides
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime, FuzzError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| FuzzError::Io(e.to_string()))
}

fn run_serve(cfg: &AppConfig, runtime: &ProductionRuntime) -> Result<i32, FuzzError> {
    let registry = Arc::new(CapabilityRegistry::with_builtins());
    let server = Arc::new(ProtocolServer::from_config(cfg, registry)?);
    tokio_runtime()?.block_on(async {
        let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
            .await
            .map_err(|e| FuzzError::Transport(format!("bind {}: {e}", cfg.server.listen)))?;
        transport::serve(listener, Arc::clone(&server), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    })?;
    server.snapshot()?;
    runtime.terminal.write_line(&format!(
        "served: terminations={} nodes={} longest_path={}",
        server.terminations(),
        server.tree().node_count(),
        server.tree().longest_path()
    ))?;
    Ok(0)
}

fn run_make(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    cwd: &Path,
    value_type: &str,
    replay: Option<PathBuf>,
    log: Option<PathBuf>,
    count: u64,
) -> Result<i32, FuzzError> {
    let ty = value_type.parse::<ValueType>()?;
    let registry = Arc::new(CapabilityRegistry::with_builtins());
    let mut engine = match (replay, log) {
        (Some(input), Some(output)) => {
            ValueEngine::replay_from(cwd.join(input), cwd.join(output), &cfg.engine, registry)?
        }
        (None, Some(output)) => ValueEngine::generate_to(cwd.join(output), &cfg.engine, registry)?,
        (replay, None) => {
            let args = replay
                .iter()
                .map(|p| cwd.join(p).display().to_string())
                .collect::<Vec<_>>();
            ValueEngine::from_args(&args, 0, &cfg.engine, registry)?
        }
    };

    let mut exhausted = 0u64;
    for decision_id in 1..=count {
        match engine.make(&ty, decision_id, true) {
            Ok(value) => runtime.terminal.write_line(&describe(&engine, &value))?,
            Err(err) if err.is_resource_exhaustion() => {
                exhausted += 1;
                runtime.terminal.write_line(&format!("exhausted: {err}"))?;
            }
            Err(err) => return Err(err),
        }
    }

    let stats = engine.finish()?;
    runtime.terminal.write_line(&format!(
        "decisions={} max_depth={} max_spins={} reused={} exhausted={exhausted}",
        stats.decisions, stats.max_depth, stats.max_spins, stats.reused
    ))?;
    Ok(0)
}

fn describe(engine: &ValueEngine, value: &Value) -> String {
    let Some(id) = value.referent().as_instance() else {
        return match value.referent() {
            Value::Scalar(scalar) => format!("{} {scalar}", scalar.tag()),
            _ => "null".to_string(),
        };
    };
    if let Some(text) = engine.text_of(value) {
        return format!("text {text:?}");
    }
    let name = engine.type_name(id).unwrap_or("?");
    if let Some(bytes) = engine.bytes(id) {
        return format!("{name}[{}]", bytes.len());
    }
    if let Some(items) = engine.object::<Vec<i64>>(id) {
        return format!("{name} {items:?}");
    }
    if let Some(bytes) = engine.object::<Vec<u8>>(id) {
        return format!("{name} {bytes:?}");
    }
    if let Some(text) = engine.object::<String>(id) {
        return format!("{name} {text:?}");
    }
    format!("{name}#{}", id.index())
}

fn compare_logs(runtime: &ProductionRuntime, left: &Path, right: &Path) -> Result<i32, FuzzError> {
    let left_bytes = runtime.file_system.read_bytes(left)?;
    let right_bytes = runtime.file_system.read_bytes(right)?;
    let mut left_reader = LogReader::new(left_bytes.as_slice(), left.display().to_string());
    let mut right_reader = LogReader::new(right_bytes.as_slice(), right.display().to_string());

    let mut index = 0u64;
    loop {
        let l = left_reader.next_record()?;
        let r = right_reader.next_record()?;
        match (l, r) {
            (None, None) => break,
            (l, r) if l == r => index += 1,
            (l, r) => {
                let show = |rec: Option<codec::LogRecord>| {
                    rec.map_or_else(|| "<end>".to_string(), |rec| rec.to_string())
                };
                runtime.terminal.write_line(&format!(
                    "logs differ at record {index}: left={} right={}",
                    show(l),
                    show(r)
                ))?;
                return Ok(1);
            }
        }
    }

    if left_bytes != right_bytes {
        runtime.terminal.write_line("logs decode equal but differ in bytes")?;
        return Ok(1);
    }
    runtime
        .terminal
        .write_line(&format!("logs identical ({index} records)"))?;
    Ok(0)
}

fn run_export(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    store: Option<PathBuf>,
    window: Option<usize>,
    output: Option<PathBuf>,
) -> Result<i32, FuzzError> {
    let store_path = store
        .or_else(|| cfg.tree.store_path.clone())
        .ok_or_else(|| FuzzError::Cli("export needs --store or tree.store_path".to_string()))?;
    let tree = TreeStore::open(&store_path)?.load()?;
    let window = window.unwrap_or(cfg.tree.window);
    if window == 0 {
        return Err(FuzzError::InvalidConfig("window must be at least 1".to_string()));
    }

    let mut rows = Vec::new();
    for item in tree.traverse(window) {
        rows.push(serde_json::to_string(&item).map_err(|e| FuzzError::Io(e.to_string()))?);
    }
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                runtime.file_system.create_dir_all(parent)?;
            }
            let mut contents = rows.join("\n");
            contents.push('\n');
            runtime.file_system.write_string(&path, &contents)?;
            runtime.terminal.write_line(&format!(
                "exported {} rows to {}",
                rows.len(),
                path.display()
            ))?;
        }
        None => {
            for row in &rows {
                runtime.terminal.write_line(row)?;
            }
        }
    }
    Ok(0)
}
