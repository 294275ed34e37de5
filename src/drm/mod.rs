//! Kernel interface: the `v3d` DRM uAPI.
//!
//! The VideoCore VI's compute path is driven through the mainline `v3d`
//! DRM driver: GEM buffer objects for GPU-visible memory, a mmap offset
//! for the host view, and the compute-shader-dispatch (CSD) submit ioctl
//! for execution. This module owns the raw ioctl surface; everything
//! above it works with safe wrappers.
//!
//! Struct layouts and ioctl numbers mirror `include/uapi/drm/v3d_drm.h`;
//! they are ABI and must not be reordered.
//!
//! # Safety
//! All ioctl calls go through [`Device`], which guarantees the file
//! descriptor is a live DRM character device and that argument structs
//! outlive the call. The structs are plain old data; the kernel writes
//! back into them.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

/// DRM ioctl failure. Every variant names the operation so a failed stage
/// is identifiable from the error alone.
#[derive(Debug, Error)]
pub enum DrmError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },

    #[error("no DRM node with driver `v3d` found (set V3D_DEVICE to override probing)")]
    NoDevice,

    #[error("device `{name}` does not support compute shader dispatch")]
    NoCsdSupport { name: String },

    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        source: io::Error,
    },

    #[error("wait timed out after {timeout_ns} ns")]
    Timeout { timeout_ns: u64 },
}

// ---------------------------------------------------------------------------
// ioctl plumbing

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const DRM_IOCTL_TYPE: u32 = b'd' as u32;
const DRM_COMMAND_BASE: u32 = 0x40;

const fn ioc(dir: u32, nr: u32, size: usize) -> u64 {
    ((dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_TYPE << 8) | nr) as u64
}

const fn iowr<T>(nr: u32) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iow<T>(nr: u32) -> u64 {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

// ---------------------------------------------------------------------------
// uAPI structs

#[repr(C)]
#[derive(Debug)]
pub struct DrmVersion {
    pub version_major: libc::c_int,
    pub version_minor: libc::c_int,
    pub version_patchlevel: libc::c_int,
    pub name_len: libc::size_t,
    pub name: *mut libc::c_char,
    pub date_len: libc::size_t,
    pub date: *mut libc::c_char,
    pub desc_len: libc::size_t,
    pub desc: *mut libc::c_char,
}

impl Default for DrmVersion {
    fn default() -> Self {
        // Safety: all-zero is valid for this POD struct (null pointers,
        // zero lengths).
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmV3dCreateBo {
    pub size: u32,
    pub flags: u32,
    /// Returned GEM handle.
    pub handle: u32,
    /// Returned offset of the BO in the V3D address space, which is the
    /// address the hardware uses.
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmV3dMmapBo {
    pub handle: u32,
    pub flags: u32,
    /// Returned fake offset to pass to mmap on the card fd.
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmV3dWaitBo {
    handle: u32,
    pad: u32,
    timeout_ns: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmV3dGetParam {
    param: u32,
    pad: u32,
    value: u64,
}

/// Compute dispatch job. `cfg` holds the seven CSD config registers
/// (workgroup geometry, batch count, code address, uniforms address).
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmV3dSubmitCsd {
    pub cfg: [u32; 7],
    pub coef: [u32; 4],
    /// Userspace pointer to an array of GEM handles the job references.
    pub bo_handles: u64,
    pub bo_handle_count: u32,
    pub in_sync: u32,
    pub out_sync: u32,
    pub perfmon_id: u32,
}

const DRM_IOCTL_VERSION: u64 = iowr::<DrmVersion>(0x00);
const DRM_IOCTL_GEM_CLOSE: u64 = iow::<DrmGemClose>(0x09);

const DRM_IOCTL_V3D_WAIT_BO: u64 = iowr::<DrmV3dWaitBo>(DRM_COMMAND_BASE + 0x01);
const DRM_IOCTL_V3D_CREATE_BO: u64 = iowr::<DrmV3dCreateBo>(DRM_COMMAND_BASE + 0x02);
const DRM_IOCTL_V3D_MMAP_BO: u64 = iowr::<DrmV3dMmapBo>(DRM_COMMAND_BASE + 0x03);
const DRM_IOCTL_V3D_GET_PARAM: u64 = iowr::<DrmV3dGetParam>(DRM_COMMAND_BASE + 0x04);
const DRM_IOCTL_V3D_SUBMIT_CSD: u64 = iow::<DrmV3dSubmitCsd>(DRM_COMMAND_BASE + 0x07);

/// Queryable device parameters (`DRM_V3D_PARAM_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Param {
    UifCfg = 0,
    HubIdent1 = 1,
    HubIdent2 = 2,
    HubIdent3 = 3,
    Core0Ident0 = 4,
    Core0Ident1 = 5,
    Core0Ident2 = 6,
    SupportsTfu = 7,
    SupportsCsd = 8,
    SupportsCacheFlush = 9,
}

// ---------------------------------------------------------------------------
// Device

/// An open v3d DRM node.
pub struct Device {
    file: File,
    path: PathBuf,
}

impl Device {
    /// Open a specific DRM node and verify it is driven by `v3d`.
    pub fn open(path: impl AsRef<Path>) -> Result<Device, DrmError> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DrmError::Open {
                path: path.clone(),
                source,
            })?;
        let dev = Device { file, path };
        let name = dev.driver_name()?;
        if name != "v3d" {
            debug!("{}: driver is `{}`, not v3d", dev.path.display(), name);
            return Err(DrmError::NoDevice);
        }
        if dev.get_param(Param::SupportsCsd)? == 0 {
            return Err(DrmError::NoCsdSupport { name });
        }
        debug!("opened v3d node {}", dev.path.display());
        Ok(dev)
    }

    /// Probe `/dev/dri/card*` for the v3d node.
    pub fn probe() -> Result<Device, DrmError> {
        for n in 0..8 {
            let path = format!("/dev/dri/card{}", n);
            match Device::open(&path) {
                Ok(dev) => return Ok(dev),
                Err(e) => debug!("probe {}: {}", path, e),
            }
        }
        Err(DrmError::NoDevice)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One ioctl round trip, retried on EINTR/EAGAIN the way libdrm does.
    fn ioctl<T>(&self, op: &'static str, request: u64, arg: &mut T) -> Result<(), DrmError> {
        loop {
            // Safety: `request` matches the layout of `T` by construction
            // of the DRM_IOCTL_* constants, and `arg` lives across the
            // call.
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    request as libc::c_ulong,
                    arg as *mut T,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(DrmError::Ioctl { op, source: err }),
            }
        }
    }

    /// Driver name from DRM_IOCTL_VERSION.
    pub fn driver_name(&self) -> Result<String, DrmError> {
        let mut name = vec![0u8; 64];
        let mut version = DrmVersion {
            name_len: name.len(),
            name: name.as_mut_ptr() as *mut libc::c_char,
            ..Default::default()
        };
        self.ioctl("version", DRM_IOCTL_VERSION, &mut version)?;
        name.truncate(version.name_len.min(name.len()));
        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    /// Create a GEM buffer object. Returns the handle and the device
    /// address of the BO in the V3D address space.
    pub fn create_bo(&self, size: u32) -> Result<(u32, u32), DrmError> {
        let mut arg = DrmV3dCreateBo {
            size,
            ..Default::default()
        };
        self.ioctl("create_bo", DRM_IOCTL_V3D_CREATE_BO, &mut arg)?;
        debug!(
            "create_bo: {} bytes, handle {}, bus address {:#010x}",
            size, arg.handle, arg.offset
        );
        Ok((arg.handle, arg.offset))
    }

    /// Fake mmap offset for mapping a BO through the card fd.
    pub fn mmap_bo_offset(&self, handle: u32) -> Result<u64, DrmError> {
        let mut arg = DrmV3dMmapBo {
            handle,
            ..Default::default()
        };
        self.ioctl("mmap_bo", DRM_IOCTL_V3D_MMAP_BO, &mut arg)?;
        Ok(arg.offset)
    }

    /// Block until every job referencing the BO completes, or the timeout
    /// elapses.
    pub fn wait_bo(&self, handle: u32, timeout_ns: u64) -> Result<(), DrmError> {
        let mut arg = DrmV3dWaitBo {
            handle,
            pad: 0,
            timeout_ns,
        };
        match self.ioctl("wait_bo", DRM_IOCTL_V3D_WAIT_BO, &mut arg) {
            Ok(()) => Ok(()),
            Err(DrmError::Ioctl { source, .. })
                if source.raw_os_error() == Some(libc::ETIME) =>
            {
                Err(DrmError::Timeout { timeout_ns })
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_param(&self, param: Param) -> Result<u64, DrmError> {
        let mut arg = DrmV3dGetParam {
            param: param as u32,
            ..Default::default()
        };
        self.ioctl("get_param", DRM_IOCTL_V3D_GET_PARAM, &mut arg)?;
        Ok(arg.value)
    }

    /// Submit a compute dispatch job referencing `bo_handles`.
    pub fn submit_csd(&self, cfg: [u32; 7], bo_handles: &[u32]) -> Result<(), DrmError> {
        let mut arg = DrmV3dSubmitCsd {
            cfg,
            coef: [0; 4],
            bo_handles: bo_handles.as_ptr() as u64,
            bo_handle_count: bo_handles.len() as u32,
            in_sync: 0,
            out_sync: 0,
            perfmon_id: 0,
        };
        debug!(
            "submit_csd: cfg {:08x?}, {} bo handles",
            cfg,
            bo_handles.len()
        );
        self.ioctl("submit_csd", DRM_IOCTL_V3D_SUBMIT_CSD, &mut arg)
    }

    /// Release a GEM handle. Errors are logged, not propagated: close
    /// runs on drop paths where there is nothing left to unwind.
    pub fn gem_close(&self, handle: u32) {
        let mut arg = DrmGemClose { handle, pad: 0 };
        if let Err(e) = self.ioctl("gem_close", DRM_IOCTL_GEM_CLOSE, &mut arg) {
            log::warn!("gem_close({}) failed: {}", handle, e);
        }
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_uapi() {
        // Spot-check against the values the kernel headers produce.
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_V3D_WAIT_BO, 0xc010_6441);
        assert_eq!(DRM_IOCTL_V3D_CREATE_BO, 0xc010_6442);
        assert_eq!(DRM_IOCTL_V3D_MMAP_BO, 0xc010_6443);
        assert_eq!(DRM_IOCTL_V3D_GET_PARAM, 0xc010_6444);
    }

    #[test]
    fn test_submit_csd_layout() {
        // The CSD struct is kernel ABI: 7 cfg words, 4 coef words (the
        // u64 pointer after them forces 4 bytes of padding), the handle
        // array pointer and four u32s.
        assert_eq!(std::mem::size_of::<DrmV3dSubmitCsd>(), 72);
        assert_eq!(std::mem::size_of::<DrmV3dCreateBo>(), 16);
        assert_eq!(std::mem::size_of::<DrmV3dMmapBo>(), 16);
    }

    #[test]
    fn test_probe_without_hardware() {
        // On machines without a v3d node this must fail cleanly, not hang
        // or panic.
        match Device::probe() {
            Ok(dev) => assert_eq!(dev.driver_name().unwrap(), "v3d"),
            Err(DrmError::NoDevice) => {}
            Err(e) => panic!("unexpected probe error: {}", e),
        }
    }
}
