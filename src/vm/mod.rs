use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    config::{ImageStrategy, NicMode, ProvisionConfig},
    error::{Error, Result},
    net::HostonlyReconciler,
    vbox::{
        models::{Machine, Nic, NicNetwork, StorageMedium},
        VirtualBox,
    },
};

/// Creates a machine with its disk and NICs unless one with that name is
/// already registered.
///
/// There is no rollback: if a step fails, whatever VirtualBox already
/// created stays registered.
pub struct Provisioner<'a, V: VirtualBox + ?Sized> {
    vbox: &'a V,
    config: ProvisionConfig,
}

impl<'a, V: VirtualBox + ?Sized> Provisioner<'a, V> {
    pub fn new(vbox: &'a V, config: ProvisionConfig) -> Self {
        Self { vbox, config }
    }

    /// Returns the machine called `name`, creating it from `image` if it
    /// does not exist yet. An existing machine is returned untouched.
    pub async fn provision(&self, name: &str, image: &Path) -> Result<Machine> {
        self.config.validate()?;

        match self.vbox.get_machine(name).await {
            Ok(machine) => {
                info!(%name, state = %machine.state, "machine already registered");
                return Ok(machine);
            }
            Err(Error::MachineNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(%name, image = %image.display(), "creating machine");
        self.create_with_image(name, image).await?;
        self.configure_nics(name).await?;

        self.vbox.get_machine(name).await
    }

    async fn create_with_image(&self, name: &str, image: &Path) -> Result<Machine> {
        let machine = self
            .vbox
            .create_machine(name, self.config.base_folder.as_deref())
            .await?;

        let controller = &self.config.controller;
        self.vbox.add_storage_controller(name, controller).await?;

        let medium = self.resolve_image(name, image).await?;
        self.vbox
            .attach_storage(
                name,
                &controller.name,
                &StorageMedium {
                    port: 0,
                    device: 0,
                    medium,
                },
            )
            .await?;

        Ok(machine)
    }

    /// Produces the path to attach. Clone and link give the machine its own
    /// file so unregistering it with `--delete` cannot take the source image
    /// with it.
    pub async fn resolve_image(&self, name: &str, image: &Path) -> Result<PathBuf> {
        match self.config.image_strategy {
            ImageStrategy::Direct => Ok(image.to_path_buf()),
            ImageStrategy::Clone => {
                let target = derived_image_path(name, image);
                self.vbox.clone_medium(image, &target).await?;
                info!(source = %image.display(), target = %target.display(), "cloned image");
                Ok(target)
            }
            ImageStrategy::Link => {
                let target = derived_image_path(name, image);
                tokio::fs::hard_link(image, &target).await?;
                info!(source = %image.display(), target = %target.display(), "linked image");
                Ok(target)
            }
        }
    }

    async fn configure_nics(&self, name: &str) -> Result<()> {
        let nat_index = self.config.nat_index();
        let mut hostonly_adapter: Option<String> = None;

        for nic in self.config.ordered_nics() {
            let network = match nic.mode {
                NicMode::Nat => NicNetwork::Nat,
                NicMode::Hostonly => {
                    let adapter = match hostonly_adapter.clone() {
                        Some(adapter) => adapter,
                        None => {
                            let reconciler = HostonlyReconciler::new(
                                self.vbox,
                                self.config.network_match.clone(),
                            );
                            let network = reconciler.reconcile(self.config.subnet).await?;
                            hostonly_adapter = Some(network.name.clone());
                            network.name
                        }
                    };
                    NicNetwork::Hostonly(adapter)
                }
            };

            self.vbox
                .set_nic(
                    name,
                    nic.index,
                    &Nic {
                        network,
                        hardware: nic.hardware,
                    },
                )
                .await?;

            if Some(nic.index) == nat_index {
                for rule in &self.config.port_forwards {
                    self.vbox.add_nat_port_forward(name, nic.index, rule).await?;
                }
            }
        }

        if self.config.nics.is_empty() {
            warn!(%name, "no NICs configured");
        }
        Ok(())
    }
}

/// `<dir>/.<machine>.<image file name>.<uuid>`, next to the source image.
pub fn derived_image_path(name: &str, image: &Path) -> PathBuf {
    let base = image
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = format!(".{}.{}.{}", name, base, uuid::Uuid::new_v4());
    match image.parent() {
        Some(dir) => dir.join(file),
        None => PathBuf::from(file),
    }
}
