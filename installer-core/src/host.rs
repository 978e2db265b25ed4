// SPDX-License-Identifier: GPL-3.0-only

//! The system seams every installation step runs against

use installer_sys::{Clock, CommandRunner, CpuVendor, DeviceQuery, Firmware, PackageInstaller};

/// Borrowed handles to the machine the installer runs on
///
/// Tests build one from the scripted runner, the fake clock and a static
/// device list; the binary builds one from the real implementations.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub runner: &'a dyn CommandRunner,
    pub devices: &'a dyn DeviceQuery,
    pub packages: &'a dyn PackageInstaller,
    pub clock: &'a dyn Clock,
    pub firmware: Firmware,
    /// Decides which microcode package goes into the target
    pub cpu: Option<CpuVendor>,
}

impl std::fmt::Debug for Host<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("firmware", &self.firmware)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}
