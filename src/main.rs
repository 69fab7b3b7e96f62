use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use log::info;
use std::sync::Arc;

use quotawarden::audit;
use quotawarden::cli::{Args, Commands};
use quotawarden::collector::{Collector, RealCollector, SyntheticCollector};
use quotawarden::config::{self, Config};
use quotawarden::k8s::K8sClient;
use quotawarden::observability::{self, Metrics};
use quotawarden::reconciler::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    println!("{}", "QuotaWarden - Tenant Quota Reconciler".bright_cyan().bold());
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_cyan());

    let config_text = match &args.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file '{path}'"))?,
        None => String::new(),
    };
    let mut config = Config::from_yaml(&config_text).context("loading controller configuration")?;
    apply_cli_overrides(&mut config, &args)?;

    info!("connecting to cluster");
    let k8s = K8sClient::new(args.kubeconfig.as_deref())
        .await
        .context("constructing Kubernetes client")?;
    if let Some(name) = k8s.cluster_name() {
        println!("   Cluster: {}", name.bright_green());
    }
    println!(
        "   Mode: {}",
        if config.controller.mode.is_dry_run() {
            "dry-run".bright_yellow()
        } else {
            "prod".bright_red()
        }
    );

    let metrics = Metrics::new();
    let collector = match &config.synthetic {
        Some(synthetic_config) => {
            println!("   Collector: {}", "synthetic".bright_yellow());
            Collector::Synthetic(SyntheticCollector::new(synthetic_config))
        }
        None => {
            println!("   Collector: {}", "real".bright_green());
            Collector::Real(RealCollector::new(&config.discovery, metrics.clone()))
        }
    };

    let audit_sink = audit::default_sink();
    let observability_addr = config.observability.listen_addr.clone();
    let observability_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = observability::serve(&observability_addr, observability_metrics).await {
            log::error!("observability server exited: {e:#}");
        }
    });

    let reconciler = Arc::new(Reconciler::new(config, k8s, collector, metrics, audit_sink));

    match args.command {
        Commands::Once => {
            println!("🔁 Running a single reconcile tick...");
            match reconciler.tick_once().await {
                Ok(()) => {
                    println!("{}", "✅ Tick completed".bright_green());
                    Ok(())
                }
                Err(e) => {
                    println!("{}", "❌ Tick failed".bright_red());
                    Err(anyhow::anyhow!("{e}"))
                }
            }
        }
        Commands::Run => {
            println!("🔁 Entering reconcile loop...");
            reconciler.run().await;
            Ok(())
        }
    }
}

/// Apply `--mode`/`--update-interval`/`--namespace`/`--label-selector`/
/// `--dry-run` on top of a loaded config file; CLI flags win on conflict.
/// `--dry-run` always wins over `--mode` since it's the more specific ask.
fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(mode) = &args.mode {
        config.controller.mode = match mode.as_str() {
            "dry-run" => config::ControllerMode::DryRun,
            "prod" => config::ControllerMode::Prod,
            other => anyhow::bail!("invalid --mode '{other}'; expected 'dry-run' or 'prod'"),
        };
    }
    if args.dry_run {
        config.controller.mode = config::ControllerMode::DryRun;
    }
    if let Some(interval) = &args.update_interval {
        config.controller.update_interval = humantime::parse_duration(interval)
            .with_context(|| format!("parsing --update-interval '{interval}'"))?;
    }
    if let Some(namespace) = &args.namespace {
        config.discovery.namespace = Some(namespace.clone());
    }
    if let Some(selector) = &args.label_selector {
        config.discovery.label_selector = Some(selector.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["quotawarden"];
        argv.extend_from_slice(extra);
        argv.push("once");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn mode_override_applies() {
        let mut config = Config::default();
        apply_cli_overrides(&mut config, &args(&["--mode", "prod"])).unwrap();
        assert_eq!(config.controller.mode, config::ControllerMode::Prod);
    }

    #[test]
    fn dry_run_flag_wins_over_mode() {
        let mut config = Config::default();
        apply_cli_overrides(&mut config, &args(&["--mode", "prod", "--dry-run"])).unwrap();
        assert_eq!(config.controller.mode, config::ControllerMode::DryRun);
    }

    #[test]
    fn invalid_mode_errors() {
        let mut config = Config::default();
        assert!(apply_cli_overrides(&mut config, &args(&["--mode", "bogus"])).is_err());
    }

    #[test]
    fn update_interval_override_parses_humantime() {
        let mut config = Config::default();
        apply_cli_overrides(&mut config, &args(&["--update-interval", "45s"])).unwrap();
        assert_eq!(config.controller.update_interval, std::time::Duration::from_secs(45));
    }

    #[test]
    fn namespace_and_label_selector_overrides_apply() {
        let mut config = Config::default();
        apply_cli_overrides(
            &mut config,
            &args(&["--namespace", "monitoring", "--label-selector", "app=cortex"]),
        )
        .unwrap();
        assert_eq!(config.discovery.namespace.as_deref(), Some("monitoring"));
        assert_eq!(config.discovery.label_selector.as_deref(), Some("app=cortex"));
    }
}
