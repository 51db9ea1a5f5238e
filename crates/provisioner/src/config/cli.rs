use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "PROVISIONER_KUBE_CONTEXT",
        help = "Kubeconfig context to use instead of the current one"
    )]
    pub context: Option<String>,

    #[arg(
        long,
        global = true,
        help = "Timeout in seconds for reading one Kubernetes API response"
    )]
    pub request_timeout_secs: Option<u64>,

    #[arg(
        long,
        global = true,
        env = "PROVISIONER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the provisioner YAML config, e.g. /etc/provisioner/config.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "PROVISIONER_AUDIT_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Write one audit line per created, rolled back or deleted object to this file"
    )]
    pub audit_log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check whether a single node has room for a resource request
    Check(CheckArgs),
    /// Admit, build and create the objects for a workload request
    Apply(ApplyArgs),
    /// Report the normalized status of one object
    Status(StatusArgs),
    /// Delete every object recorded in an apply result
    Teardown(UnitsArgs),
    /// Change the resources or service port of a running session
    Update(UpdateArgs),
    /// Delete a workload and recreate it under the same names
    Reset(ResetArgs),
}

#[derive(Parser)]
pub struct CheckArgs {
    #[arg(long, default_value = "0", help = "CPU request, e.g. 500m or 2")]
    pub cpu: String,

    #[arg(long, default_value = "0", help = "Memory request, e.g. 512Mi or 8Gi")]
    pub memory: String,

    #[arg(long, default_value = "0", help = "Number of GPUs")]
    pub gpu: u64,
}

#[derive(Parser)]
pub struct ApplyArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Workload request as YAML or JSON"
    )]
    pub request: PathBuf,

    #[arg(
        long,
        help = "Abort after this many seconds; objects created so far are kept"
    )]
    pub timeout_secs: Option<u64>,
}

#[derive(Parser)]
pub struct StatusArgs {
    #[arg(long, help = "Object kind, e.g. pod, notebook, workflow, inferenceservice")]
    pub kind: String,

    #[arg(long, help = "Object namespace")]
    pub namespace: String,

    #[arg(long, help = "Object name")]
    pub name: String,
}

#[derive(Parser)]
pub struct UnitsArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "JSON output of a previous apply"
    )]
    pub units: PathBuf,
}

#[derive(Parser)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub units: UnitsArgs,

    #[arg(long, help = "New CPU request and limit")]
    pub cpu: Option<String>,

    #[arg(long, help = "New memory request and limit")]
    pub memory: Option<String>,

    #[arg(long, help = "New GPU count")]
    pub gpu: Option<u64>,

    #[arg(long, help = "New service port")]
    pub service_port: Option<u16>,
}

#[derive(Parser)]
pub struct ResetArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Workload request the units were created from, as YAML or JSON"
    )]
    pub request: PathBuf,

    #[command(flatten)]
    pub units: UnitsArgs,
}
