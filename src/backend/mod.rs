pub mod qemu;

use std::sync::Arc;

use crate::config::Config;
use crate::hypervisor::Hypervisor;

pub fn create_backend(config: &Config) -> Arc<dyn Hypervisor> {
    Arc::new(qemu::QemuHypervisor::new(config))
}
