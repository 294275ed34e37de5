//! Hardware integration tests.
//!
//! These run real programs on the VideoCore VI and therefore need a v3d
//! DRM node. On machines without one each test logs a skip and passes;
//! run them on a Raspberry Pi 4 to exercise the device path.

use std::time::{Duration, Instant};

use v3d_qpu::asm::{rf, Assembler, R0, R1, R2, R3, R5, R5REP, TMUA, TMUD};
use v3d_qpu::driver::{ConfigError, Driver, DriverError};

fn open_driver() -> Option<Driver> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Driver::open() {
        Ok(drv) => Some(drv),
        Err(e) => {
            eprintln!("skipping hardware test: {}", e);
            None
        }
    }
}

/// Counter kernel: loads an iteration count from the uniform stream and
/// spins it down to zero.
fn qpu_counter(asm: &mut Assembler) {
    asm.nop().ldunif();
    let entry = asm.begin_loop();
    asm.sub(R5, R5, 1).pushn();
    entry.branch_back(asm).anyna();
    asm.nop();
    asm.nop();
    asm.nop();
    asm.end_program();
}

fn time_counter(drv: &Driver, iterations: u32) -> Duration {
    let code = drv.program(qpu_counter).unwrap();
    let uniforms = drv.uniforms(&[iterations]).unwrap();
    let start = Instant::now();
    drv.execute(&code, uniforms.bus_address(), 1).unwrap();
    start.elapsed()
}

/// Scenario A: the loop must run once per uniform count. The absolute
/// clock is board-dependent, so the check is proportionality: doubling
/// the count must roughly double the time, and the implied per-iteration
/// cost must sit in the plausible range for a 5-instruction loop.
#[test]
fn test_counter_iterations_scale_with_uniform() {
    let Some(drv) = open_driver() else { return };

    let f = 1 << 22;
    let t1 = time_counter(&drv, f);
    let t2 = time_counter(&drv, 2 * f);

    let ratio = t2.as_secs_f64() / t1.as_secs_f64();
    assert!(
        (1.5..2.5).contains(&ratio),
        "time did not scale with iteration count: {:?} vs {:?}",
        t1,
        t2
    );

    // 5 instructions per iteration; QPU clocks sit in the hundreds of
    // MHz. Far outside that means the loop count is wrong.
    let per_iter_ns = t1.as_secs_f64() * 1e9 / f as f64;
    assert!(
        (2.0..200.0).contains(&per_iter_ns),
        "implausible per-iteration cost: {} ns",
        per_iter_ns
    );
}

/// Write-pattern kernel: every lane stores `base + 16k + eidx` on loop
/// iteration k.
fn qpu_tmu_write(asm: &mut Assembler) {
    asm.nop().ldunif();
    asm.bor(R1, R5, R5).ldunif();

    // r2 = addr + eidx * 4, rf0 = eidx
    asm.eidx(R0).mov(R2, R5);
    asm.shl(R0, R0, 2).mov(rf(0), R0);
    asm.add(R2, R2, R0);

    let entry = asm.begin_loop();
    {
        // rf0: data to write, r2: destination address.
        asm.sub(R1, R1, 1).pushz().mov(TMUD, rf(0));
        entry.branch_back(asm).anyna();
        asm.sub(rf(0), rf(0), -16).mov(TMUA, R2);
        asm.shl(R0, 4, 4);
        asm.tmuwt().add(R2, R2, R0);
    }

    asm.end_program();
}

/// Scenario B: the destination must hold exactly 0..16n.
#[test]
fn test_tmu_write_pattern() {
    let Some(drv) = open_driver() else { return };

    let n = 4096u32;
    let code = drv.program(qpu_tmu_write).unwrap();
    let mut data = drv.alloc::<u32>(n as usize * 16).unwrap();
    data.as_mut_slice().fill(0xdead_beaf);
    let uniforms = drv.uniforms(&[n, data.bus_address()]).unwrap();

    drv.execute(&code, uniforms.bus_address(), 1).unwrap();

    for (i, &v) in data.as_slice().iter().enumerate() {
        assert_eq!(v, i as u32, "element {}", i);
    }
}

/// Read-modify-write kernel: reads 16-lane vectors, adds one, stores them
/// to the destination.
fn qpu_tmu_read(asm: &mut Assembler) {
    // r0: vector count, r1: source + eidx*4, r2: destination + eidx*4.
    asm.eidx(R2).ldunif();
    asm.nop().ldunif().mov(R0, R5);
    asm.shl(R2, R2, 2).mov(R1, R5);
    asm.add(R1, R1, R2).ldunif();
    asm.add(R2, R5, R2);

    let entry = asm.begin_loop();
    {
        asm.nop().mov(TMUA, R1).thrsw();
        asm.nop();
        asm.nop();
        asm.nop().ldtmu(rf(0));

        asm.sub(R0, R0, 1).pushz().add(TMUD, rf(0), 1);
        entry.branch_back(asm).anyna();
        asm.shl(R3, 4, 4).mov(TMUA, R2);
        asm.add(R1, R1, R3).add(R2, R2, R3);
        asm.tmuwt();
    }

    asm.end_program();
}

/// Scenario C: incrementing 0..16n in place leaves 1..=16n.
#[test]
fn test_tmu_read_modify_write() {
    let Some(drv) = open_driver() else { return };

    let n = 4096u32;
    let code = drv.program(qpu_tmu_read).unwrap();
    let mut data = drv.alloc::<u32>(n as usize * 16).unwrap();
    for (i, v) in data.as_mut_slice().iter_mut().enumerate() {
        *v = i as u32;
    }
    let uniforms = drv
        .uniforms(&[n, data.bus_address(), data.bus_address()])
        .unwrap();

    drv.execute(&code, uniforms.bus_address(), 1).unwrap();

    for (i, &v) in data.as_slice().iter().enumerate() {
        assert_eq!(v, i as u32 + 1, "element {}", i);
    }
}

/// Per-thread row matmul: thread t computes C[t, 0..16] for an 8x16
/// output with depth 16. Each thread reads its parameter row through the
/// uniform-table header ABI: {row base, row words} then
/// `row_base + tidx * row_words * 4`.
fn qpu_row_matmul(asm: &mut Assembler) {
    let a_row = rf(2);
    let b_base = rf(3);
    let b_stride = rf(4);
    let c_row = rf(5);

    // Unpack this thread's parameter row (8 threads, one per core).
    asm.tidx(R0).ldunifrf(rf(0));
    asm.shr(R0, R0, 2);
    asm.mov(R1, 0b1111);
    asm.band(R3, R0, R1).ldunifrf(rf(1));
    asm.shl(R0, rf(1), 2);
    asm.umul24(R0, R0, R3);
    asm.eidx(R1).add(R0, R0, rf(0));
    asm.shl(R1, R1, 2);
    asm.add(R0, R0, R1);
    asm.mov(TMUA, R0).thrsw();
    asm.nop();
    asm.nop();
    asm.nop().ldtmu(R1);
    for (i, reg) in [a_row, b_base, b_stride, c_row].into_iter().enumerate() {
        if i == 0 {
            asm.mov(R5REP, R1);
        } else {
            asm.rotate(R5REP, R1, -(i as i32));
        }
        asm.mov(reg, R5);
    }

    // rf6 = A[t, lane]
    asm.eidx(R0);
    asm.shl(R0, R0, 2);
    asm.add(R0, R0, a_row);
    asm.mov(TMUA, R0).thrsw();
    asm.nop();
    asm.nop();
    asm.nop().ldtmu(rf(6));

    // rf7 = accumulator, rf8 = &B[k, lane]
    asm.mov(rf(7), 0.0);
    asm.eidx(R0);
    asm.shl(R0, R0, 2);
    asm.add(rf(8), b_base, R0);

    for k in 0..16 {
        asm.mov(TMUA, rf(8)).thrsw().add(rf(8), rf(8), b_stride);
        asm.nop();
        if k == 0 {
            asm.mov(R5REP, rf(6));
        } else {
            asm.rotate(R5REP, rf(6), -k);
        }
        asm.nop().ldtmu(R1);
        asm.nop().fmul(R3, R5, R1);
        asm.fadd(rf(7), rf(7), R3);
    }

    // C[t, lane] = rf7
    asm.eidx(R0);
    asm.shl(R0, R0, 2);
    asm.add(R0, R0, c_row);
    asm.mov(TMUD, rf(7));
    asm.mov(TMUA, R0);
    asm.tmuwt();

    asm.end_program();
}

/// Scenario D: the 8-thread partition must agree with the host reference
/// within float tolerance.
#[test]
fn test_threaded_matmul_matches_reference() {
    let Some(drv) = open_driver() else { return };

    const P: usize = 8;
    const Q: usize = 16;
    const R: usize = 16;

    let code = drv.program(qpu_row_matmul).unwrap();
    let mut a = drv.alloc::<f32>(P * Q).unwrap();
    let mut b = drv.alloc::<f32>(Q * R).unwrap();
    let c = drv.alloc::<f32>(P * R).unwrap();

    // Deterministic, sign-varied inputs.
    for (i, v) in a.as_mut_slice().iter_mut().enumerate() {
        *v = ((i * 7 % 23) as f32 - 11.0) / 8.0;
    }
    for (i, v) in b.as_mut_slice().iter_mut().enumerate() {
        *v = ((i * 5 % 19) as f32 - 9.0) / 16.0;
    }

    let rows: Vec<Vec<u32>> = (0..P)
        .map(|t| {
            vec![
                a.address_of(t * Q),
                b.bus_address(),
                (R * 4) as u32,
                c.address_of(t * R),
            ]
        })
        .collect();
    let uniforms = drv.uniform_table(&rows).unwrap();
    assert_eq!(uniforms.row_words(), 4);

    drv.execute(&code, uniforms.address(), 8).unwrap();

    for i in 0..P {
        for j in 0..R {
            let mut want = 0.0f32;
            for k in 0..Q {
                want += a.as_slice()[i * Q + k] * b.as_slice()[k * R + j];
            }
            let got = c.as_slice()[i * R + j];
            assert!(
                (got - want).abs() <= 1e-4 * want.abs().max(1.0),
                "C[{},{}]: got {}, want {}",
                i,
                j,
                got,
                want
            );
        }
    }
}

/// Bad thread counts must be rejected before any job is issued, even with
/// a live device.
#[test]
fn test_invalid_thread_count_rejected() {
    let Some(drv) = open_driver() else { return };

    let code = drv.program(qpu_counter).unwrap();
    let uniforms = drv.uniforms(&[1]).unwrap();
    for threads in [0, 2, 4, 12, 17] {
        match drv.execute(&code, uniforms.bus_address(), threads) {
            Err(DriverError::Config(ConfigError::InvalidThreadCount { requested })) => {
                assert_eq!(requested, threads)
            }
            other => panic!("thread count {}: unexpected result {:?}", threads, other),
        }
    }
}
