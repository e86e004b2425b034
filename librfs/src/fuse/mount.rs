//! Mount helpers for starting/stopping the resolving filesystem.
//!
//! Notes:
//! - Only supported on Linux; unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use crate::config::RfsConfig;
use crate::fuse::ResolvingFs;

/// Mount options derived from `config`, owned by the calling user.
pub fn default_mount_options(config: &RfsConfig) -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mo = MountOptions::default();
    mo.fs_name(config.fs_name.as_str())
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    if config.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mounts `fs` on an empty directory through fusermount3.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: ResolvingFs,
    mount_point: impl AsRef<Path>,
    config: &RfsConfig,
) -> std::io::Result<MountHandle> {
    Session::new(default_mount_options(config))
        .mount_with_unprivileged(fs, mount_point)
        .await
}

/// Mounts `fs` directly; needs CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
pub async fn mount(
    fs: ResolvingFs,
    mount_point: impl AsRef<Path>,
    config: &RfsConfig,
) -> std::io::Result<MountHandle> {
    Session::new(default_mount_options(config))
        .mount(fs, mount_point)
        .await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: ResolvingFs,
    _mount_point: impl AsRef<Path>,
    _config: &RfsConfig,
) -> std::io::Result<MountHandle> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
pub async fn mount(
    _fs: ResolvingFs,
    _mount_point: impl AsRef<Path>,
    _config: &RfsConfig,
) -> std::io::Result<MountHandle> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    )
}
