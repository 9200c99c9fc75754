use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentic_review::completion::build_backend;
use agentic_review::config::{AppConfig, BackendKind, DEFAULT_CONFIG_PATH};
use agentic_review::prompting::compose_requests;
use agentic_review::report::ReportWriter;

struct CliArgs {
    file_to_analyze: PathBuf,
    config_path: PathBuf,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs> {
    let program = args.next().unwrap_or_else(|| "agentic_review".to_string());
    let Some(file) = args.next() else {
        bail!("Usage: {} <file_to_analyze> [config_path]", program);
    };
    let config = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    if let Some(extra) = args.next() {
        bail!("unexpected argument '{}'", extra);
    }
    Ok(CliArgs {
        file_to_analyze: PathBuf::from(file),
        config_path: PathBuf::from(config),
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: CliArgs) -> Result<()> {
    let config = AppConfig::load(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    info!(
        backend = ?config.backend,
        agents = config.agents.len(),
        model = %config.model,
        "configuration loaded"
    );

    // candle's CPU kernels run on rayon's global pool.
    if config.backend == BackendKind::Local && env::var_os("RAYON_NUM_THREADS").is_none() {
        env::set_var("RAYON_NUM_THREADS", config.local.threads.to_string());
    }

    let document = fs::read_to_string(&args.file_to_analyze)
        .with_context(|| format!("reading {}", args.file_to_analyze.display()))?;
    let requests = compose_requests(&config.agents, &document);

    let mut backend = build_backend(&config)?;
    backend.check_ready()?;
    info!(backend = backend.name(), "starting analysis");

    let outcomes =
        backend.tokenize_and_generate(&requests, config.max_tokens, config.failure_policy)?;
    let results: Vec<_> = requests
        .into_iter()
        .map(|r| r.name)
        .zip(outcomes)
        .collect();

    let source = args.file_to_analyze.display().to_string();
    let writer = ReportWriter::new(&config.report_path);
    writer.append(&source, &results)?;

    println!(
        "Analysis complete. Report written to {}",
        writer.path().display()
    );
    Ok(())
}

fn main() -> ExitCode {
    init_logging();

    let outcome = parse_args(env::args()).and_then(run);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn config_path_defaults_to_agents_json() {
        let parsed = parse_args(args(&["agentic_review", "main.c"])).expect("parse");
        assert_eq!(parsed.file_to_analyze, PathBuf::from("main.c"));
        assert_eq!(parsed.config_path, PathBuf::from("agents.json"));
    }

    #[test]
    fn missing_file_prints_usage() {
        let err = parse_args(args(&["agentic_review"])).err().expect("usage error");
        assert!(err.to_string().starts_with("Usage: agentic_review <file_to_analyze>"));
    }

    #[test]
    fn extra_arguments_are_rejected() {
        assert!(parse_args(args(&["x", "a.c", "cfg.toml", "more"])).is_err());
    }
}
