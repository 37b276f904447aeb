//! CLI surface (§6): an external collaborator the core is built for, not
//! part of it — this binary only parses a config path and the
//! `--check-only` / enable / disable controls, wires a line-printing
//! observer to the Event Bus, and runs the Manager until signalled.
//!
//! Grounded on `kftui::cli::args::Cli`'s `clap::Parser` derive style.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kfwd_supervisor::config::ForwardId;
use kfwd_supervisor::{EventKind, ForwardManager, KubeClientPool};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kfwd-supervisor")]
#[command(about = "Supervises a declared set of Kubernetes port forwards")]
#[command(version)]
struct Cli {
    #[arg(value_name = "CONFIG", help = "Path to the YAML configuration file")]
    config: PathBuf,

    #[arg(long, help = "Parse and validate the configuration, then exit")]
    check_only: bool,

    #[arg(long, value_name = "ID", help = "Start with this forward disabled")]
    disable: Vec<String>,

    #[arg(long, value_name = "ID", help = "Force this forward enabled (overrides --disable)")]
    enable: Vec<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            "kfwd_supervisor=info"
                .parse()
                .expect("static directive always parses"),
        ))
        .init();
}

fn read_config(path: &PathBuf) -> Result<String, ExitCode> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("failed to read {}: {e}", path.display());
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let yaml = match read_config(&cli.config) {
        Ok(yaml) => yaml,
        Err(code) => return code,
    };

    let root = match kfwd_supervisor::config::parse(&yaml) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let forwards = match kfwd_supervisor::config::flatten(&root) {
        Ok(forwards) => forwards,
        Err(problems) => {
            for problem in problems {
                eprintln!("configuration error: {problem}");
            }
            return ExitCode::FAILURE;
        }
    };

    if cli.check_only {
        println!("configuration OK: {} forward(s) declared", forwards.len());
        return ExitCode::SUCCESS;
    }

    let pool = match KubeClientPool::from_default() {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            eprintln!("failed to read kubeconfig: {e}");
            return ExitCode::FAILURE;
        }
    };

    let events = Arc::new(kfwd_supervisor::EventBus::new());
    events
        .subscribe_sync(Arc::new(|event: &kfwd_supervisor::Event| {
            info!(forward_id = %event.forward_id, kind = ?event.kind, "{}", describe(event));
        }))
        .await;

    let manager = ForwardManager::new(pool, events);

    if let Err(e) = manager.start(&root).await {
        error!("failed to start: {e}");
        return ExitCode::FAILURE;
    }

    for id in &cli.disable {
        apply_control(&manager, id, false).await;
    }
    for id in &cli.enable {
        apply_control(&manager, id, true).await;
    }

    info!("supervisor running, press ctrl-c to stop");
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler");
    }

    info!("shutting down");
    manager.stop().await;
    ExitCode::SUCCESS
}

async fn apply_control(manager: &ForwardManager, raw_id: &str, enable: bool) {
    let id = ForwardId::new(raw_id);
    let result = if enable { manager.enable(&id).await } else { manager.disable(&id).await };
    if let Err(e) = result {
        error!(id = raw_id, "{e}");
    }
}

fn describe(event: &kfwd_supervisor::Event) -> String {
    match event.kind {
        EventKind::ForwardStarting => "starting".to_string(),
        EventKind::ForwardActive => "active".to_string(),
        EventKind::ForwardReconnecting => "reconnecting".to_string(),
        EventKind::ForwardDisabled => "disabled".to_string(),
        EventKind::ForwardRemoved => "removed".to_string(),
        EventKind::HealthDegraded => "health degraded".to_string(),
        EventKind::HealthFailed => "health failed".to_string(),
        EventKind::Stale => "stale, recycling".to_string(),
        EventKind::WorkerHung => "worker hung".to_string(),
        EventKind::Error => event.fields.get("message").cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn read_config_loads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "contexts: []").unwrap();
        let contents = read_config(&file.path().to_path_buf()).unwrap();
        assert_eq!(contents, "contexts: []");
    }

    #[test]
    fn read_config_reports_missing_file() {
        let missing = PathBuf::from("/nonexistent/kfwd-supervisor-test.yaml");
        assert!(read_config(&missing).is_err());
    }
}
