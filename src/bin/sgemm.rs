//! Tiled single-precision matrix multiply on the QPUs, checked against a
//! host reference.
//!
//! Computes `C = alpha * A * B + beta * C` with eight hardware threads,
//! each owning a 2x4 block partition of the output. Usage:
//!
//! ```text
//! sgemm [P Q R]    # defaults to 256 256 256; P % 32 == 0, R % 64 == 0
//! ```

use std::env;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use v3d_qpu::asm::{rf, Assembler, Reg, R0, R1, R3, R4, R5, R5REP, TMUA, TMUD};
use v3d_qpu::driver::Driver;

/// Stream this thread's parameter row into `regs`.
///
/// The driver hands thread 0's uniform stream a 2-word header
/// `{row base, row words}`; every thread derives its own row address as
/// `row_base + thread_index * row_words * 4` and fetches the row through
/// the TMU, 16 words per transaction, spreading them over `regs` via the
/// broadcast register.
fn load_params(asm: &mut Assembler, threads: u32, regs: &[Reg]) {
    match threads {
        1 => {
            asm.bxor(R0, R0, R0).ldunifrf(rf(0));
        }
        8 => {
            // 8 threads, one per core: thread index in tidx[4:2].
            asm.tidx(R0).ldunifrf(rf(0));
            asm.shr(R0, R0, 2);
            asm.mov(R1, 0b1111);
        }
        16 => {
            // 16 threads, two per core: thread index in tidx[4:1].
            asm.tidx(R0).ldunifrf(rf(0));
            asm.shr(R0, R0, 1).mov(R1, 1);
            asm.shl(R1, R1, 5);
            asm.sub(R1, R1, 1);
        }
        _ => unreachable!("validated by the driver"),
    }

    // r0 = row base + thread_index * row_words * 4 + eidx * 4
    asm.band(R3, R0, R1).ldunifrf(rf(1));
    asm.shl(R0, rf(1), 2);
    asm.umul24(R0, R0, R3);
    asm.eidx(R1).add(R0, R0, rf(0));
    asm.shl(R1, R1, 2);
    asm.shl(R3, 4, 4).add(R0, R0, R1);

    let n = regs.len();
    asm.mov(TMUA, R0).thrsw().add(R0, R0, R3);
    asm.nop();
    asm.nop();
    asm.nop().ldtmu(R1);
    for i in 0..n {
        if i % 16 == 0 {
            asm.mov(R5REP, R1);
            asm.mov(regs[i], R5);
        } else if i % 16 == 15 && i != n - 1 {
            asm.mov(TMUA, R0).thrsw().add(R0, R0, R3);
            asm.rotate(R5REP, R1, -((i % 16) as i32));
            asm.mov(regs[i], R5);
            asm.nop().ldtmu(R1);
        } else {
            asm.rotate(R5REP, R1, -((i % 16) as i32));
            asm.mov(regs[i], R5);
        }
    }
}

/// The naive row-times-column kernel: each thread walks its block of C in
/// 16x16 tiles, accumulating one column vector of partial sums in
/// rf0-rf15 (with rf16-rf31 as the beta staging area).
fn qpu_sgemm(asm: &mut Assembler, threads: u32) {
    // Parameter registers, in row order, above the accumulator window.
    let reg_p = rf(32);
    let reg_q = rf(33);
    let reg_r = rf(34);
    let reg_a_base = rf(35);
    let reg_a_stride = rf(36);
    let reg_b_base = rf(37);
    let reg_b_stride = rf(38);
    let reg_c_base = rf(39);
    let reg_c_stride = rf(40);
    let reg_alpha = rf(41);
    let reg_beta = rf(42);
    let reg_a_cur = rf(43);
    let reg_b_cur = rf(44);
    let reg_c_cur = rf(45);
    let reg_i = rf(46);
    let reg_j = rf(47);
    let reg_k = rf(48);

    let params = [
        reg_p,
        reg_q,
        reg_r,
        reg_a_base,
        reg_a_stride,
        reg_b_base,
        reg_b_stride,
        reg_c_base,
        reg_c_stride,
        reg_alpha,
        reg_beta,
    ];
    load_params(asm, threads, &params);

    // Bias the base pointers to the far corner of the block so the loop
    // counters can walk down to zero.
    asm.add(R0, reg_p, 15);
    asm.shr(R0, R0, 4);
    asm.shl(R0, R0, 4);
    asm.add(R1, reg_r, 15);
    asm.shr(R1, R1, 4);
    asm.shl(R1, R1, 6);
    asm.umul24(R3, R0, reg_a_stride);
    asm.add(reg_a_base, reg_a_base, R3);
    asm.add(reg_b_base, reg_b_base, R1);
    asm.umul24(R3, R0, reg_c_stride);
    asm.add(reg_c_base, reg_c_base, R3);
    asm.add(reg_c_base, reg_c_base, R1);

    for i in 0..16 {
        asm.mov(rf(i), 0.0).mov(rf(i + 16), 0.0);
    }

    // i = (P + 15) / 16
    asm.add(R0, reg_p, 15);
    asm.shr(reg_i, R0, 4);
    let li = asm.begin_loop();
    {
        // j = (R + 15) / 16
        asm.add(R0, reg_r, 15);
        asm.shr(reg_j, R0, 4);
        let lj = asm.begin_loop();
        {
            asm.shl(R0, reg_i, 4);
            asm.umul24(R3, R0, reg_c_stride);
            asm.shl(R1, reg_j, 6);
            asm.sub(reg_c_cur, reg_c_base, R3);
            asm.sub(reg_c_cur, reg_c_cur, R1);
            asm.umul24(R3, R0, reg_a_stride);
            asm.sub(reg_a_cur, reg_a_base, R3);
            asm.sub(reg_b_cur, reg_b_base, R1);

            asm.mov(reg_k, reg_q);
            let lk = asm.begin_loop();
            {
                // Fetch one column of A and one row of B.
                asm.eidx(R0);
                asm.umul24(R1, R0, reg_a_stride);
                asm.add(R1, R1, reg_a_cur).add(reg_a_cur, reg_a_cur, 4);
                asm.mov(TMUA, R1).thrsw();
                asm.shl(R1, R0, 2);
                asm.add(R1, R1, reg_b_cur).add(reg_b_cur, reg_b_cur, reg_b_stride);
                asm.mov(TMUA, R1).thrsw();

                asm.nop().ldtmu(R0);
                asm.mov(R5REP, R0);
                asm.nop().ldtmu(R4);
                asm.nop().fmul(R3, R5, R4);
                for i in 1..16 {
                    asm.rotate(R5REP, R0, -i);
                    asm.fadd(rf((i - 1) as u8), rf((i - 1) as u8), R3).fmul(R3, R5, R4);
                }
                asm.fadd(rf(15), rf(15), R3);

                asm.sub(reg_k, reg_k, 1).pushz();
                lk.branch_back(asm).anyna();
                asm.nop(); // delay slot
                asm.nop(); // delay slot
                asm.nop(); // delay slot
            }

            // Scale by alpha while the old C tile streams in, fold in
            // beta, and write the tile back.
            asm.eidx(R0);
            asm.shl(R0, R0, 2);
            asm.add(R1, reg_c_cur, R0);
            asm.mov(TMUA, R1).thrsw().add(R1, R1, reg_c_stride);
            asm.fmul(rf(0), rf(0), reg_alpha);
            for i in 1..16u8 {
                asm.mov(TMUA, R1).thrsw().add(R1, R1, reg_c_stride);
                asm.fmul(rf(i), rf(i), reg_alpha).ldtmu(rf(i + 15));
            }
            asm.mov(R0, reg_beta).fmul(R3, rf(16), reg_beta).ldtmu(rf(31));
            for i in 0..16u8 {
                asm.fadd(rf(i), rf(i), R3).fmul(R3, rf(i + 17), R0);
            }

            asm.eidx(R0);
            asm.shl(R0, R0, 2);
            asm.add(R1, reg_c_cur, R0);
            for i in 0..16u8 {
                asm.mov(TMUD, rf(i));
                asm.mov(TMUA, R1).add(R1, R1, reg_c_stride);
                asm.mov(rf(i), 0.0).mov(rf(i + 16), 0.0);
                asm.tmuwt();
            }

            asm.sub(reg_j, reg_j, 1).pushz();
            lj.branch_back(asm).anyna();
            asm.nop();
            asm.nop();
            asm.nop();
        }

        asm.sub(reg_i, reg_i, 1).pushz();
        li.branch_back(asm).anyna();
        asm.nop();
        asm.nop();
        asm.nop();
    }

    asm.end_program();
}

/// Deterministic pseudorandom floats in [-1, 1).
struct Lcg(u32);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.0 >> 8) as f32 / (1u32 << 23) as f32 - 1.0
    }
}

fn host_sgemm(p: usize, q: usize, r: usize, alpha: f32, beta: f32, a: &[f32], b: &[f32], c: &mut [f32]) {
    for i in 0..p {
        for j in 0..r {
            let mut acc = 0.0f32;
            for k in 0..q {
                acc += a[i * q + k] * b[k * r + j];
            }
            c[i * r + j] = alpha * acc + beta * c[i * r + j];
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<usize> = env::args()
        .skip(1)
        .map(|a| a.parse().context("dimensions must be integers"))
        .collect::<Result<_>>()?;
    let (p, q, r) = match args.as_slice() {
        [] => (256, 256, 256),
        [p, q, r] => (*p, *q, *r),
        _ => bail!("usage: sgemm [P Q R]"),
    };
    let threads = 8u32;
    if p % 32 != 0 || r % 64 != 0 {
        bail!("need P % 32 == 0 and R % 64 == 0 for the 2x4 block partition");
    }

    let drv = Driver::open().context("opening the v3d device")?;
    let code = drv.program(|asm| qpu_sgemm(asm, threads))?;

    let mut a = drv.alloc::<f32>(p * q)?;
    let mut b = drv.alloc::<f32>(q * r)?;
    let mut c = drv.alloc::<f32>(p * r)?;

    let mut rng = Lcg(0x2357_1113);
    let alpha = rng.next_f32();
    let beta = rng.next_f32();
    for v in a.as_mut_slice() {
        *v = rng.next_f32();
    }
    for v in b.as_mut_slice() {
        *v = rng.next_f32();
    }
    for v in c.as_mut_slice() {
        *v = rng.next_f32();
    }

    let mut c_ref: Vec<f32> = c.as_slice().to_vec();
    let start = Instant::now();
    host_sgemm(p, q, r, alpha, beta, a.as_slice(), b.as_slice(), &mut c_ref);
    let time_ref = start.elapsed();

    // One parameter row per thread; thread t owns block (t / 4, t % 4).
    let tile_p = p / 2;
    let tile_r = r / 4;
    let rows: Vec<Vec<u32>> = (0..threads as usize)
        .map(|t| {
            let (bi, bj) = (t / 4, t % 4);
            vec![
                tile_p as u32,
                q as u32,
                tile_r as u32,
                a.address_of(tile_p * bi * q),
                (q * 4) as u32,
                b.address_of(tile_r * bj),
                (r * 4) as u32,
                c.address_of(tile_p * bi * r + tile_r * bj),
                (r * 4) as u32,
                alpha.to_bits(),
                beta.to_bits(),
            ]
        })
        .collect();
    let uniforms = drv.uniform_table(&rows)?;

    let start = Instant::now();
    drv.execute(&code, uniforms.address(), threads)?;
    let time_gpu = start.elapsed();

    let mut max_err = 0.0f32;
    for (got, want) in c.as_slice().iter().zip(&c_ref) {
        max_err = max_err.max((got - want).abs());
    }

    let gflops = |secs: f64| (2.0 * (p * q * r) as f64 + 3.0 * (p * r) as f64) / secs * 1e-9;
    println!("==== sgemm ({}x{} times {}x{}) ====", p, q, q, r);
    println!(
        "host: {:9.4?}, {:7.3} Gflop/s",
        time_ref,
        gflops(time_ref.as_secs_f64())
    );
    println!(
        "QPU:  {:9.4?}, {:7.3} Gflop/s",
        time_gpu,
        gflops(time_gpu.as_secs_f64())
    );
    println!("maximum absolute error: {:e}", max_err);

    if max_err > 1e-2 {
        bail!("result diverges from the host reference");
    }
    Ok(())
}
