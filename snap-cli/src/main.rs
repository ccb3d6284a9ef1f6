use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};

use clap::{Parser, ValueEnum};
use fc_snap::sdk::{
    DriveConfig, Orchestrator, SnapshotOptions, SnapshotReport, SnapshotType, VmConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "snap-cli",
    version,
    about = "Launch a Firecracker microVM, snapshot it, or restore it from a snapshot"
)]
struct Cli {
    /// Firecracker API socket path.
    #[arg(long)]
    socket: PathBuf,

    /// Snapshot the microVM already serving --socket into <BASE>.mem and <BASE>.file.
    #[arg(
        long = "toSnapshot",
        visible_alias = "to-snapshot",
        value_name = "BASE",
        conflicts_with = "from_snapshot"
    )]
    to_snapshot: Option<PathBuf>,

    /// Restore <BASE>.mem and <BASE>.file into a new Firecracker process.
    #[arg(long = "fromSnapshot", visible_alias = "from-snapshot", value_name = "BASE")]
    from_snapshot: Option<PathBuf>,

    /// Snapshot type written by --toSnapshot.
    #[arg(long, value_enum, default_value_t = SnapshotKind::Diff)]
    snapshot_type: SnapshotKind,

    /// JSON file with the full VM configuration. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Firecracker binary path.
    #[arg(long)]
    firecracker_bin: Option<PathBuf>,

    /// Linux kernel image path.
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Root filesystem path.
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// Kernel boot arguments.
    #[arg(long)]
    boot_args: Option<String>,

    /// Number of vCPUs.
    #[arg(long)]
    vcpu_count: Option<u64>,

    /// Guest memory size (MiB).
    #[arg(long)]
    mem_size_mib: Option<u64>,

    /// Socket readiness timeout (milliseconds).
    #[arg(long)]
    init_timeout_ms: Option<u64>,

    /// Optional microVM identifier.
    #[arg(long)]
    id: Option<String>,

    /// Firecracker log output path.
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Firecracker log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Disable seccomp for the Firecracker process.
    #[arg(long, default_value_t = false)]
    no_seccomp: bool,

    /// Skip local checks of the kernel, drives and machine size.
    #[arg(long, default_value_t = false)]
    disable_validation: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SnapshotKind {
    Full,
    Diff,
}

impl From<SnapshotKind> for SnapshotType {
    fn from(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Full => SnapshotType::Full,
            SnapshotKind::Diff => SnapshotType::Diff,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;
    let orchestrator = Orchestrator::new(config);

    if let Some(base) = &cli.to_snapshot {
        let report = orchestrator
            .create_snapshot_for(base, SnapshotOptions::new(cli.snapshot_type.into()))
            .await?;
        print_report(&report);
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(base) = &cli.from_snapshot {
        println!("socket={}", orchestrator.config().socket_path);
        let outcome = orchestrator.restore_from_snapshot(base).await?;
        print_report(&outcome.report);
        return Ok(exit_code(outcome.exit_status));
    }

    println!("socket={}", orchestrator.config().socket_path);
    let status = orchestrator.launch_fresh().await?;
    Ok(exit_code(status))
}

fn build_config(cli: &Cli) -> Result<VmConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = VmConfig::from_json_file(path)?;
            config.socket_path = cli.socket.clone().into();
            config
        }
        None => VmConfig::new(cli.socket.clone()),
    };

    if let Some(bin) = &cli.firecracker_bin {
        config.firecracker_bin = bin.clone();
    }
    if let Some(kernel) = &cli.kernel {
        config.kernel_image_path = Some(kernel.clone());
    }
    if let Some(rootfs) = &cli.rootfs {
        config.drives.retain(|drive| !drive.is_root_device);
        config.drives.insert(0, DriveConfig::root(rootfs.clone()));
    }
    if let Some(boot_args) = &cli.boot_args {
        config.boot_args = boot_args.clone();
    }
    if let Some(vcpu_count) = cli.vcpu_count {
        config.vcpu_count = vcpu_count;
    }
    if let Some(mem_size_mib) = cli.mem_size_mib {
        config.mem_size_mib = mem_size_mib;
    }
    if let Some(timeout_ms) = cli.init_timeout_ms {
        config.channel.init_timeout_ms = timeout_ms;
    }
    if let Some(id) = &cli.id {
        config.process.id = Some(id.clone());
    }
    if let Some(log_path) = &cli.log_path {
        config.process.log_path = Some(log_path.clone());
    }
    if let Some(log_level) = &cli.log_level {
        config.process.log_level = Some(log_level.clone());
    }
    config.process.no_seccomp |= cli.no_seccomp;
    config.disable_validation |= cli.disable_validation;

    tracing::debug!(?config, "resolved configuration");
    Ok(config)
}

fn print_report(report: &SnapshotReport) {
    println!("snapshot_mem={}", report.artifact.mem_path().display());
    println!("snapshot_state={}", report.artifact.state_path().display());
    if let Some(snapshot_type) = report.snapshot_type {
        println!("snapshot_type={snapshot_type}");
    }
    println!("elapsed_ms={}", report.elapsed.as_millis());
}

fn exit_code(status: ExitStatus) -> ExitCode {
    println!("exit_status={status}");
    if status.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
