//! Execution driver: program upload, job submission and completion.
//!
//! A [`Driver`] owns one open v3d node and one GPU memory arena. The
//! submit path is compute shader dispatch (CSD): a job carries the code
//! address, the starting uniform address and the thread count, and
//! completion is observed by waiting on the arena's buffer object.
//!
//! One execution is in flight per driver context at a time; the device's
//! thread-ID space and uniform stream state are shared hardware resources
//! with no reentrancy guarantee, so concurrent `execute` calls serialize
//! on an internal lock. A completion timeout wedges the context: the
//! device state is unknown afterwards and only re-initialization (or a
//! device reset) recovers it.
//!
//! ```no_run
//! use v3d_qpu::driver::Driver;
//! use v3d_qpu::asm::R5;
//!
//! let drv = Driver::open()?;
//! let code = drv.program(|asm| {
//!     asm.nop().ldunif();
//!     let entry = asm.begin_loop();
//!     asm.sub(R5, R5, 1).pushn();
//!     entry.branch_back(asm).anyna();
//!     asm.nop();
//!     asm.nop();
//!     asm.nop();
//!     asm.end_program();
//! })?;
//! let mut unif = drv.alloc::<u32>(1)?;
//! unif.as_mut_slice()[0] = 1 << 20;
//! drv.execute(&code, unif.bus_address(), 1)?;
//! # Ok::<(), v3d_qpu::driver::DriverError>(())
//! ```

pub mod memory;
pub mod uniforms;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use crate::asm::{assemble, Assembler, AssemblyError, Program};
use crate::config::Config;
use crate::drm::{Device, DrmError};

pub use memory::{GpuBuffer, MemoryArena, MemoryError};
pub use uniforms::UniformTable;

/// Thread counts the hardware can schedule: one QPU thread, one per core,
/// or two per core.
pub const SUPPORTED_THREAD_COUNTS: [u32; 3] = [1, 8, 16];

/// Pre-submission configuration failure. Reported before any device job
/// is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread count {requested} unsupported; the hardware schedules 1, 8 or 16")]
    InvalidThreadCount { requested: u32 },

    #[error("uniform row {row} has {words} words, expected {expected}")]
    MismatchedUniformRows {
        row: usize,
        words: usize,
        expected: usize,
    },

    #[error("no uniform rows supplied")]
    EmptyUniformTable,
}

/// Any failure surfaced by driver operations, tagged by stage.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("allocation failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("device error: {0}")]
    Drm(#[from] DrmError),

    /// The device did not signal completion in time. The context is
    /// wedged; re-open the driver (and reset the device if it stays
    /// stuck).
    #[error("device unresponsive: no completion within {waited:?}")]
    HardwareUnresponsive { waited: Duration },

    /// An earlier timeout left the context unusable.
    #[error("driver context wedged by an earlier timeout; re-open it")]
    Wedged,
}

/// Reject thread counts the scheduler cannot map onto the cores.
pub fn validate_thread_count(threads: u32) -> Result<(), ConfigError> {
    if SUPPORTED_THREAD_COUNTS.contains(&threads) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreadCount { requested: threads })
    }
}

/// CSD config registers for a QPU dispatch: 16-wide workgroups, 16
/// workgroups per supergroup, one batch per hardware thread.
fn csd_config(code_addr: u32, uniforms_addr: u32, threads: u32) -> [u32; 7] {
    const WG_SIZE: u32 = 16;
    const WGS_PER_SG: u32 = 16;
    let batches_per_sg = (WGS_PER_SG * WG_SIZE).div_ceil(16);
    [
        WG_SIZE << 16,
        1 << 16,
        1 << 16,
        (WGS_PER_SG << 16) | ((batches_per_sg - 1) << 12) | (WG_SIZE & 0xff),
        threads - 1,
        code_addr,
        uniforms_addr,
    ]
}

/// Handle to one open device context.
pub struct Driver {
    dev: Arc<Device>,
    arena: MemoryArena,
    exec: Mutex<()>,
    wedged: AtomicBool,
    timeout: Duration,
}

impl Driver {
    /// Open the device named by the loaded [`Config`] (or probe for it)
    /// and set up the memory arena.
    pub fn open() -> Result<Driver, DriverError> {
        Driver::with_config(Config::get())
    }

    pub fn with_config(config: &Config) -> Result<Driver, DriverError> {
        let dev = Arc::new(match config.device() {
            Some(path) => Device::open(path)?,
            None => Device::probe()?,
        });
        let arena = MemoryArena::new(dev.clone(), config.data_area_size())?;
        Ok(Driver {
            dev,
            arena,
            exec: Mutex::new(()),
            wedged: AtomicBool::new(false),
            timeout: config.exec_timeout(),
        })
    }

    /// The memory arena backing this context's buffers.
    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    /// Allocate a zeroed buffer of `count` elements.
    pub fn alloc<T: zerocopy::AsBytes + zerocopy::FromBytes + Copy>(
        &self,
        count: usize,
    ) -> Result<GpuBuffer<T>, MemoryError> {
        self.arena.alloc(count)
    }

    /// Assemble a program and upload its machine words.
    pub fn program(&self, f: impl FnOnce(&mut Assembler)) -> Result<GpuBuffer<u64>, DriverError> {
        self.upload(&assemble(f)?)
    }

    /// Upload an already-assembled program.
    pub fn upload(&self, program: &Program) -> Result<GpuBuffer<u64>, DriverError> {
        let mut code = self.arena.alloc::<u64>(program.len())?;
        code.write(program.words());
        debug!(
            "uploaded {} instructions at {:#010x}",
            program.len(),
            code.bus_address()
        );
        Ok(code)
    }

    /// Upload a flat uniform stream (the single-thread path: no header,
    /// the program reads these words directly).
    pub fn uniforms(&self, words: &[u32]) -> Result<GpuBuffer<u32>, DriverError> {
        let mut buf = self.arena.alloc::<u32>(words.len())?;
        buf.write(words);
        Ok(buf)
    }

    /// Build a per-thread uniform table plus its 2-word header. All rows
    /// must have the same length.
    pub fn uniform_table(&self, rows: &[Vec<u32>]) -> Result<UniformTable, DriverError> {
        UniformTable::build(&self.arena, rows)
    }

    /// Submit `threads` QPU threads running `code` with the uniform
    /// stream starting at `uniforms_addr`, and block until they complete.
    ///
    /// On return every TMU write the program acknowledged is visible in
    /// mapped buffers.
    pub fn execute(
        &self,
        code: &GpuBuffer<u64>,
        uniforms_addr: u32,
        threads: u32,
    ) -> Result<(), DriverError> {
        validate_thread_count(threads)?;
        if self.wedged.load(Ordering::Acquire) {
            return Err(DriverError::Wedged);
        }

        // One in-flight execution per context.
        let _slot = self.exec.lock().unwrap();

        let cfg = csd_config(code.bus_address(), uniforms_addr, threads);
        self.dev.submit_csd(cfg, &[code.handle()])?;

        let start = Instant::now();
        match self
            .dev
            .wait_bo(self.arena.handle(), self.timeout.as_nanos() as u64)
        {
            Ok(()) => {
                debug!("execution complete in {:?}", start.elapsed());
                Ok(())
            }
            Err(DrmError::Timeout { .. }) => {
                self.wedged.store(true, Ordering::Release);
                Err(DriverError::HardwareUnresponsive {
                    waited: start.elapsed(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True once a completion timeout has invalidated this context.
    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count_validation() {
        for t in SUPPORTED_THREAD_COUNTS {
            assert!(validate_thread_count(t).is_ok());
        }
        for t in [0, 2, 4, 7, 9, 12, 15, 17, 32] {
            assert_eq!(
                validate_thread_count(t),
                Err(ConfigError::InvalidThreadCount { requested: t }),
                "thread count {}",
                t
            );
        }
    }

    #[test]
    fn test_csd_config_fields() {
        let cfg = csd_config(0x4000_0000, 0x4010_0000, 8);
        assert_eq!(cfg[0], 16 << 16);
        assert_eq!(cfg[1], 1 << 16);
        assert_eq!(cfg[2], 1 << 16);
        // 16 wgs/sg, 15 batches-per-sg minus one, wg size 16.
        assert_eq!(cfg[3], (16 << 16) | (15 << 12) | 16);
        assert_eq!(cfg[4], 7); // batches = threads, minus one
        assert_eq!(cfg[5], 0x4000_0000);
        assert_eq!(cfg[6], 0x4010_0000);
    }
}
