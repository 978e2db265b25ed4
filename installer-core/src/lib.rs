// SPDX-License-Identifier: GPL-3.0-only

//! Installation engine
//!
//! Turns an [`installer_types::InstallPlan`] into an installed system:
//!
//! - **planner**: suggests partition, LVM and ZFS layouts for a disk
//! - **apply**: partitions, encrypts and formats according to a layout
//! - **mount**: unlocks and mounts a layout under the target in dependency order
//! - **session**: straps the base system and configures initramfs, swap and services
//! - **bootloader**: installs and configures one of the supported boot loaders
//! - **rescue**: tears a target down again after a failed run
//!
//! Every external effect goes through the [`Host`] traits from `installer-sys`,
//! so the whole engine runs against scripted fakes in tests and in dry runs.

pub mod apply;
pub mod bootloader;
pub mod cmdline;
pub mod error;
pub mod host;
pub mod initramfs;
pub mod keyfile;
pub mod mount;
pub mod planner;
pub mod premount;
pub mod readiness;
pub mod rescue;
pub mod session;
pub mod uki;
pub mod validation;

pub use apply::{apply_layout, with_planned_paths};
pub use bootloader::{BootContext, install_bootloader};
pub use cmdline::{ResolvedRoot, RootIdentity, RootSpec, kernel_params, resolve_root};
pub use error::{ErrorKind, InstallError, Result};
pub use host::Host;
pub use initramfs::Initramfs;
pub use keyfile::{KeyfileReport, generate_key_files};
pub use mount::{MountState, mount_ordered_layout};
pub use planner::{LayoutOptions, LayoutPrompter, Unattended};
pub use premount::detect_premounted_layout;
pub use readiness::{ReadinessOptions, WaitOutcome};
pub use rescue::{TeardownReport, release, teardown, unmount_all};
pub use session::{InstallReport, Installation, perform_installation};
pub use validation::validate_bootloader;
