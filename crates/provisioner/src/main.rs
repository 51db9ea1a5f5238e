use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use api_types::ResourceQuantity;
use api_types::WorkloadRequest;
use clap::Parser;
use provisioner::admission::AdmissionController;
use provisioner::config::ApplyArgs;
use provisioner::config::CheckArgs;
use provisioner::config::Cli;
use provisioner::config::Commands;
use provisioner::config::ProvisionerConfig;
use provisioner::config::ResetArgs;
use provisioner::config::StatusArgs;
use provisioner::config::UnitsArgs;
use provisioner::config::UpdateArgs;
use provisioner::gateway::KubeGateway;
use provisioner::gateway::ObjectKind;
use provisioner::gateway::ObjectRef;
use provisioner::kube_client::init_kube_client;
use provisioner::kube_client::ClusterConnection;
use provisioner::logging;
use provisioner::quantity::parse_cpu_millis;
use provisioner::quantity::parse_memory_bytes;
use provisioner::ProvisionOutcome;
use provisioner::ProvisionResult;
use provisioner::Provisioner;
use provisioner::SessionUpdate;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utils::version;

/// JSON printed by `apply` and `reset`, and read back by `teardown`, `update` and `reset`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ApplyReport {
    #[serde(default)]
    admitted: bool,
    #[serde(default)]
    created_units: Vec<ObjectRef>,
    #[serde(default)]
    access_endpoint: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<ProvisionResult> for ApplyReport {
    fn from(result: ProvisionResult) -> Self {
        Self {
            admitted: true,
            created_units: result.created_units,
            access_endpoint: result.access_endpoint,
            error: result.error.map(|report| format!("{report:?}")),
        }
    }
}

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guards = logging::init(cli.audit_log.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e:?}"))?;
    tracing::info!("Starting provisioner {}", &**version::VERSION);

    let config = ProvisionerConfig::load(cli.config.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e:?}"))?;
    let connection = ClusterConnection {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
        request_timeout: cli.request_timeout_secs.map(Duration::from_secs),
    };
    let client = init_kube_client(&connection)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e:?}"))?;
    let gateway = KubeGateway::new(client);

    match cli.command {
        Commands::Check(args) => run_check(gateway, args).await,
        Commands::Apply(args) => run_apply(Provisioner::new(gateway, config), args).await,
        Commands::Status(args) => run_status(Provisioner::new(gateway, config), args).await,
        Commands::Teardown(args) => run_teardown(Provisioner::new(gateway, config), args).await,
        Commands::Update(args) => run_update(Provisioner::new(gateway, config), args).await,
        Commands::Reset(args) => run_reset(Provisioner::new(gateway, config), args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value).context("serialize output failed")?;
    println!("{output}");
    Ok(())
}

async fn read_request(path: &Path) -> Result<WorkloadRequest> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read request file {} failed", path.display()))?;
    // JSON documents are valid YAML.
    serde_yaml::from_str(&raw).with_context(|| format!("parse request file {} failed", path.display()))
}

async fn read_units(args: &UnitsArgs) -> Result<Vec<ObjectRef>> {
    let raw = tokio::fs::read_to_string(&args.units)
        .await
        .with_context(|| format!("read units file {} failed", args.units.display()))?;
    let report: ApplyReport = serde_json::from_str(&raw)
        .with_context(|| format!("parse units file {} failed", args.units.display()))?;
    Ok(report.created_units)
}

async fn run_check(gateway: KubeGateway, args: CheckArgs) -> Result<()> {
    let request = ResourceQuantity::new(
        parse_cpu_millis(&args.cpu).map_err(|e| anyhow::anyhow!("{e:?}"))?,
        parse_memory_bytes(&args.memory).map_err(|e| anyhow::anyhow!("{e:?}"))?,
        args.gpu,
    );
    let admitted = AdmissionController::new(gateway)
        .check(&request)
        .await
        .map_err(|e| anyhow::anyhow!("Admission check failed: {e:?}"))?;
    print_json(&serde_json::json!({ "request": request, "admitted": admitted }))
}

async fn run_apply(provisioner: Provisioner<KubeGateway>, args: ApplyArgs) -> Result<()> {
    let request = read_request(&args.request).await?;

    let cancel = CancellationToken::new();
    if let Some(timeout_secs) = args.timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            tracing::warn!("Apply timed out after {timeout_secs}s, cancelling");
            cancel.cancel();
        });
    }

    let outcome = provisioner
        .provision_until_cancelled(&request, &cancel)
        .await
        .map_err(|e| anyhow::anyhow!("Provisioning failed: {e:?}"))?;
    let report = match outcome {
        ProvisionOutcome::Denied { .. } => ApplyReport::default(),
        ProvisionOutcome::Applied(result) => ApplyReport::from(result),
    };
    print_json(&report)?;

    match &report.error {
        Some(_) => Err(anyhow::anyhow!("apply did not complete")),
        None => Ok(()),
    }
}

async fn run_status(provisioner: Provisioner<KubeGateway>, args: StatusArgs) -> Result<()> {
    let kind = ObjectKind::from_short_name(&args.kind)
        .with_context(|| format!("unknown object kind {:?}", args.kind))?;
    let status = provisioner
        .status(&kind, &args.namespace, &args.name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read status: {e:?}"))?;
    print_json(&serde_json::json!({ "status": status, "phase": status.phase() }))
}

async fn run_teardown(provisioner: Provisioner<KubeGateway>, args: UnitsArgs) -> Result<()> {
    let units = read_units(&args).await?;
    provisioner
        .teardown(&units)
        .await
        .map_err(|e| anyhow::anyhow!("Teardown failed: {e:?}"))?;
    tracing::info!("Deleted {} unit(s)", units.len());
    Ok(())
}

async fn run_update(provisioner: Provisioner<KubeGateway>, args: UpdateArgs) -> Result<()> {
    let units = read_units(&args.units).await?;
    let update = SessionUpdate {
        cpu: args.cpu,
        memory: args.memory,
        gpu: args.gpu,
        service_port: args.service_port,
    };
    let replaced = provisioner
        .update_session(&units, &update)
        .await
        .map_err(|e| anyhow::anyhow!("Update failed: {e:?}"))?;
    print_json(&serde_json::json!({ "replaced": replaced }))
}

async fn run_reset(provisioner: Provisioner<KubeGateway>, args: ResetArgs) -> Result<()> {
    let request = read_request(&args.request).await?;
    let units = read_units(&args.units).await?;
    let result = provisioner
        .reset(&request, &units)
        .await
        .map_err(|e| anyhow::anyhow!("Reset failed: {e:?}"))?;
    let report = ApplyReport::from(result);
    print_json(&report)?;

    match &report.error {
        Some(_) => Err(anyhow::anyhow!("reset did not complete")),
        None => Ok(()),
    }
}
