use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ipnetwork::Ipv4Network;
use vbox_provision_lib::{
    config::{ImageStrategy, NetworkMatch, NicConfig, ProvisionConfig, DEFAULT_HOSTONLY_NAME},
    logging,
    monitor::{MachineMonitor, OutputFormat},
    vbox::{
        models::{Chipset, PortForward, StorageController, SysBus},
        StartType, VBoxManage,
    },
    vm::Provisioner,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MatchKind {
    Subnet,
    Name,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision, start and watch a VirtualBox machine")]
struct Args {
    /// Machine name; reused as-is when already registered.
    name: String,
    /// Source disk image.
    image: PathBuf,

    #[arg(long, value_enum, default_value = "clone")]
    image_strategy: ImageStrategy,

    /// Host-only network address and prefix.
    #[arg(long, default_value = "172.16.16.1/24")]
    subnet: Ipv4Network,

    #[arg(long, value_enum, default_value = "subnet")]
    network_match: MatchKind,

    /// Adapter name looked up with `--network-match name`.
    #[arg(long, default_value = DEFAULT_HOSTONLY_NAME)]
    network_name: String,

    /// `INDEX:MODE[:HARDWARE]` where MODE is `nat` or `hostonly` and
    /// HARDWARE a `--nictype` name such as `82540EM` or `virtio`. Repeatable.
    #[arg(long = "nic", default_value = "1:hostonly")]
    nics: Vec<NicConfig>,

    /// `NAME:PROTO:HOSTPORT:GUESTPORT` forwarded on the first NAT NIC.
    #[arg(long = "nat-forward")]
    nat_forwards: Vec<PortForward>,

    #[arg(long)]
    base_folder: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "sata")]
    controller_bus: SysBus,

    #[arg(long, value_enum, default_value = "intel-ahci")]
    controller_chipset: Chipset,

    #[arg(long, value_enum, default_value = "headless")]
    start_type: StartType,

    #[arg(long, default_value = "5")]
    interval_secs: u64,

    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    #[arg(long, default_value = "VBoxManage")]
    vboxmanage: PathBuf,

    /// Debug logging, including every VBoxManage invocation.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            image_strategy: self.image_strategy,
            nics: self.nics.clone(),
            port_forwards: self.nat_forwards.clone(),
            subnet: self.subnet,
            network_match: match self.network_match {
                MatchKind::Subnet => NetworkMatch::Subnet,
                MatchKind::Name => NetworkMatch::Name(self.network_name.clone()),
            },
            base_folder: self.base_folder.clone(),
            controller: StorageController {
                sys_bus: self.controller_bus,
                chipset: self.controller_chipset,
                ..StorageController::default()
            },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let provision_config = args.provision_config();
    provision_config
        .validate()
        .context("invalid provisioning options")?;
    tracing::debug!(config = %serde_json::to_string(&provision_config)?, "provisioning");

    let vbox = VBoxManage::new(&args.vboxmanage).verbose(args.verbose);
    let machine = Provisioner::new(&vbox, provision_config)
        .provision(&args.name, &args.image)
        .await
        .with_context(|| format!("failed to provision {}", args.name))
        .inspect_err(|e| tracing::error!("{e:#}"))?;

    let mut monitor = MachineMonitor::new(&vbox, machine)
        .interval(Duration::from_secs(args.interval_secs))
        .format(args.output);

    let mut stdout = std::io::stdout().lock();
    monitor.render(&mut stdout)?;
    monitor
        .start(args.start_type)
        .await
        .with_context(|| format!("failed to start {}", args.name))
        .inspect_err(|e| tracing::error!("{e:#}"))?;

    monitor.run(&mut stdout).await?;
    Ok(())
}
