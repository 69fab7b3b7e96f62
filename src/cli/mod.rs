use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Kubernetes-native per-tenant quota reconciler", long_about = None)]
pub struct Args {
    /// Controller configuration file (YAML)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<String>,

    /// Kubernetes config file path; falls back to in-cluster config or KUBECONFIG
    #[arg(long = "kubeconfig", value_name = "PATH")]
    pub kubeconfig: Option<String>,

    /// Force dry-run regardless of what the config file says
    #[arg(long)]
    pub dry_run: bool,

    /// Override controller.mode ("dry-run" or "prod")
    #[arg(long, value_name = "MODE")]
    pub mode: Option<String>,

    /// Override controller.updateInterval (humantime duration, e.g. "60s")
    #[arg(long, value_name = "DURATION")]
    pub update_interval: Option<String>,

    /// Override discovery.namespace
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Override discovery.labelSelector
    #[arg(long, value_name = "SELECTOR")]
    pub label_selector: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconcile loop on the configured update interval until killed
    Run,
    /// Run exactly one reconcile tick and exit
    Once,
}
