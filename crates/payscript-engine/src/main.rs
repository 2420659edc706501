//! PayScript 命令行
//!
//! - `check`：解析并编译规则文件，输出规则概要与引用的外部字段
//! - `eval`：对一次 callout 请求求值，输出字段更新
//! - `stream`：逐行读取 JSON 请求并逐行输出字段更新，可监听规则目录热更新

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use payscript::{
    CalloutRequest, GenericPayScriptCallout, RuleCompiler, RuleDirWatcher, RuleExecutor,
    RuleLoader, RuleRegistry,
};
use payscript_shared::config::AppConfig;
use payscript_shared::observability;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

const SERVICE_NAME: &str = "payscript";

/// PayScript rule engine
#[derive(Parser)]
#[command(name = "payscript", version, about = "PayScript rule engine")]
struct Cli {
    /// Record a step-by-step evaluation trace in logs
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile a rule file
    Check {
        /// Path to the rule source (.ts / .js)
        file: PathBuf,
        /// Process id to compile under (defaults to the file stem)
        #[arg(long)]
        process_id: Option<String>,
    },

    /// Evaluate one callout request `{formValues, gridSelection}`
    Eval {
        /// Rule directory or single rule file (defaults to `rules.dir` from config)
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Request JSON file; reads stdin when omitted
        request: Option<PathBuf>,
    },

    /// Evaluate JSON-lines requests from stdin
    Stream {
        /// Rule directory (defaults to `rules.dir` from config)
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Reload rules when the directory changes
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    if cli.trace {
        config.engine.trace = true;
    }

    let service_name = if config.service_name.is_empty() {
        SERVICE_NAME.to_string()
    } else {
        config.service_name.clone()
    };
    let _guard = observability::init(&service_name, &config.observability).await?;
    if config.is_production() && config.engine.trace {
        warn!(environment = %config.environment, "生产环境开启了求值追踪，日志量会明显增加");
    }

    match cli.command {
        Commands::Check { file, process_id } => check(&file, process_id),
        Commands::Eval { rules, request } => eval(&config, rules, request),
        Commands::Stream { rules, watch } => stream(&config, rules, watch).await,
    }
}

fn check(file: &Path, process_id: Option<String>) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let process_id = match process_id {
        Some(id) => id,
        None => file_stem(file)?,
    };

    let compiled = RuleCompiler::new()
        .compile_source(&process_id, &source)
        .with_context(|| format!("{} does not compile", file.display()))?;
    let definition = &compiled.definition;

    let summary = json!({
        "processId": compiled.id(),
        "compute": definition.compute.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "outputs": definition.output_fields(),
        "validations": definition.validations.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
        "transforms": definition
            .transforms()
            .map(|(kind, step)| format!("{}.{}", kind, step.name))
            .collect::<Vec<_>>(),
        "requiredFields": compiled.required_fields,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn eval(config: &AppConfig, rules: Option<PathBuf>, request: Option<PathBuf>) -> Result<()> {
    let registry = build_registry(config);
    let rules = rules_path(config, rules)?;
    load_rules(&registry, &RuleLoader::from_config(&config.rules), &rules)?;

    let raw = match request {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let request: CalloutRequest =
        serde_json::from_str(&raw).context("request is not a valid callout request")?;

    let callout = build_callout(config, registry);
    let updates = callout.evaluate(&request.form_values, request.grid_selection.as_ref());
    println!("{}", serde_json::to_string_pretty(&updates)?);
    Ok(())
}

async fn stream(config: &AppConfig, rules: Option<PathBuf>, watch: bool) -> Result<()> {
    let registry = build_registry(config);
    let rules = rules_path(config, rules)?;
    let loader = Arc::new(RuleLoader::from_config(&config.rules));
    load_rules(&registry, &loader, &rules)?;

    let watcher = if watch || config.rules.watch {
        if !rules.is_dir() {
            bail!("--watch needs a rule directory, got {}", rules.display());
        }
        let watcher = RuleDirWatcher::new(
            &rules,
            Duration::from_millis(config.rules.debounce_ms),
            loader,
            registry.clone(),
        );
        watcher.start()?;
        Some(watcher)
    } else {
        None
    };

    let callout = build_callout(config, registry);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CalloutRequest>(&line) {
            Ok(request) => serde_json::Value::Object(
                callout.evaluate(&request.form_values, request.grid_selection.as_ref()),
            ),
            Err(e) => {
                warn!(error = %e, "请求解析失败");
                json!({ "error": e.to_string() })
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    Ok(())
}

fn build_registry(config: &AppConfig) -> RuleRegistry {
    RuleRegistry::new().with_snippet_len(config.engine.snippet_len)
}

fn build_callout(config: &AppConfig, registry: RuleRegistry) -> GenericPayScriptCallout {
    let executor = if config.engine.trace {
        RuleExecutor::new().with_trace()
    } else {
        RuleExecutor::new()
    };
    GenericPayScriptCallout::new(registry).with_executor(executor)
}

fn rules_path(config: &AppConfig, rules: Option<PathBuf>) -> Result<PathBuf> {
    match rules.or_else(|| config.rules.dir.clone()) {
        Some(path) => Ok(path),
        None => bail!("no rules given: pass --rules or set rules.dir"),
    }
}

/// 目录按加载器处理，单个文件以文件名为流程 ID 注册
fn load_rules(registry: &RuleRegistry, loader: &RuleLoader, path: &Path) -> Result<()> {
    if path.is_dir() {
        let report = loader
            .load_dir(registry, path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "规则已加载"
        );
        return Ok(());
    }

    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let process_id = file_stem(path)?;
    registry
        .try_register_dsl(&process_id, &source)
        .with_context(|| format!("{} does not compile", path.display()))?;
    Ok(())
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a process id from {}", path.display()))
}
