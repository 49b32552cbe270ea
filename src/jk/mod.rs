//! JK builder: simultaneous assembly of the Coulomb (J) and exchange (K)
//! matrices from a density-fitting three-index integral tensor and a set of
//! one-particle density matrices.
//!
//! The driver calls, per SCF iteration and integral block,
//! [`Device::init_get_jk`] followed by [`Device::get_jk`]. J is produced by
//! two einsum-style contractions on the host; K is produced per density by a
//! symmetric-matrix transform of every auxiliary slab ([`fdrv`]), an unpack
//! of the packed integrals, a permutation that makes the contracted axis
//! contiguous, and one fused GEMM on the accelerator.
//!
//! All scratch is owned by the [`Device`] and grows monotonically: a call
//! with smaller shapes reuses the existing allocations. The pool is not
//! thread-safe; a single driver thread is assumed.

use itertools::izip;
use rayon::prelude::*;

use crate::dev_array::{DevArray2D, DevArray3D};
use crate::pm::{BlasHandle, DevSlice, PM};

/// The J contractions are always evaluated alongside K.
const WITH_J: bool = true;

/// Scratch lifecycle and kernel entry points for one accelerator context.
///
/// Holds the platform layer, the lazily created stream and BLAS handle, and
/// every pooled buffer together with its high-water mark. Buffers are
/// released on drop.
pub struct Device {
    pm: PM,
    handle: Option<BlasHandle>,

    /// Auxiliary blocksize the scratch is currently sized for.
    blksize: usize,

    size_rho: usize,
    rho: Vec<f64>,

    size_vj: usize,
    vj: Vec<f64>,

    size_vk: usize,
    /// Host mirror of `d_vkk` in the device layout: K blocks interleaved
    /// along the leading dimension, tile `k` at offset `k * nao` with row
    /// stride `nset * nao`.
    vk_stage: Vec<f64>,
    d_vkk: Option<DevSlice>,

    size_buf: usize,
    /// Two halves: `buf1` (transform output) and `buf2` (unpacked integrals).
    buf_tmp: Vec<f64>,
    /// Permutation of `buf1` with the contracted axis contiguous.
    buf3: Vec<f64>,
    /// Reserved for a second reshape buffer in a later refactor of the final
    /// GEMM; sized with the pool but not read or written.
    #[allow(dead_code)]
    buf4: Vec<f64>,
    d_buf2: Option<DevSlice>,
    d_buf3: Option<DevSlice>,

    size_fdrv: usize,
    /// Per-worker unpack scratch, `4 * nao * nao` doubles per worker.
    buf_fdrv: Vec<f64>,

    #[cfg(feature = "simple-timer")]
    timer: crate::utilities::TimeRecords,
}

impl Device {
    pub fn new() -> Device {
        #[cfg(feature = "simple-timer")]
        let timer = {
            let mut timer = crate::utilities::TimeRecords::new();
            timer.new_item("jk init", "pool sizing and handle setup");
            timer.new_item("jk rho", "rho intermediate");
            timer.new_item("jk vj", "coulomb update");
            timer.new_item("jk fdrv", "per-density symmetric transform");
            timer.new_item("jk unpack", "three-index unpack");
            timer.new_item("jk transpose", "transform slab permutation");
            timer.new_item("jk gemm", "device staging and exchange gemm");
            timer
        };

        Device {
            pm: PM::new(),
            handle: None,
            blksize: 0,
            size_rho: 0,
            rho: Vec::new(),
            size_vj: 0,
            vj: Vec::new(),
            size_vk: 0,
            vk_stage: Vec::new(),
            d_vkk: None,
            size_buf: 0,
            buf_tmp: Vec::new(),
            buf3: Vec::new(),
            buf4: Vec::new(),
            d_buf2: None,
            d_buf3: None,
            size_fdrv: 0,
            buf_fdrv: Vec::new(),
            #[cfg(feature = "simple-timer")]
            timer,
        }
    }

    /// Sizes the buffer pool for the given shapes, zeroes the `vj` scratch up
    /// to its current extent, and makes sure the stream and BLAS handle
    /// exist. Buffers only ever grow; a request not exceeding the recorded
    /// high-water mark reuses the existing allocation.
    pub fn init_get_jk(
        &mut self,
        eri1: &[f64],
        dmtril: &[f64],
        blksize: usize,
        nset: usize,
        nao: usize,
    ) {
        #[cfg(feature = "simple-timer")]
        self.timer.count_start("jk init");

        self.blksize = blksize;
        let nao_pair = nao * (nao + 1) / 2;
        debug_assert!(dmtril.len() >= nset * nao_pair);
        debug_assert!(eri1.len() % nao_pair == 0);

        let size_vj = nset * nao_pair;
        if size_vj > self.size_vj {
            self.size_vj = size_vj;
            self.vj = self.pm.alloc_host(size_vj);
        }
        self.vj[..size_vj].fill(0.0);

        let size_vk = nset * nao * nao;
        if size_vk > self.size_vk {
            self.size_vk = size_vk;
            self.vk_stage = self.pm.alloc_host(size_vk);
            self.d_vkk = Some(self.pm.alloc_dev(size_vk));
        }

        let size_buf = blksize * nao * nao;
        if size_buf > self.size_buf {
            self.size_buf = size_buf;
            self.buf_tmp = self.pm.alloc_host(2 * size_buf);
            self.buf3 = self.pm.alloc_host(size_buf);
            self.buf4 = self.pm.alloc_host(size_buf);
            self.d_buf2 = Some(self.pm.alloc_dev(size_buf));
            self.d_buf3 = Some(self.pm.alloc_dev(size_buf));
        }

        let size_fdrv = 4 * nao * nao * rayon::current_num_threads();
        if size_fdrv > self.size_fdrv {
            self.size_fdrv = size_fdrv;
            self.buf_fdrv = self.pm.alloc_host(size_fdrv);
        }

        self.pm.stream_create();
        if self.handle.is_none() {
            self.handle = Some(self.pm.blas_create());
        }

        #[cfg(feature = "simple-timer")]
        self.timer.count("jk init");
    }

    /// Retained for symmetry with [`Device::init_get_jk`]; pooled buffers
    /// live until the `Device` is dropped.
    pub fn free_get_jk(&mut self) {}

    /// One JK build.
    ///
    /// `eri1` is the `(naux, nao*(nao+1)/2)` packed integral block, `dmtril`
    /// the `(nset, nao*(nao+1)/2)` packed densities, `dms` the `nset` dense
    /// symmetric `(nao, nao)` densities. `vj` is accumulated in place;
    /// `vk` is overwritten when `count == 0` and accumulated otherwise.
    ///
    /// Shapes are the caller's contract and are checked only by debug
    /// assertions; `naux` must not exceed the blocksize the pool was sized
    /// for.
    #[allow(clippy::too_many_arguments)]
    pub fn get_jk(
        &mut self,
        naux: usize,
        nao: usize,
        nset: usize,
        eri1: &[f64],
        dmtril: &[f64],
        dms: &[&[f64]],
        vj: &mut [f64],
        vk: &mut [f64],
        count: usize,
    ) {
        let nao_pair = nao * (nao + 1) / 2;
        debug_assert!(naux <= self.blksize);
        debug_assert!(eri1.len() >= naux * nao_pair);
        debug_assert!(dmtril.len() >= nset * nao_pair);
        debug_assert!(dms.len() == nset);
        debug_assert!(vj.len() >= nset * nao_pair);
        debug_assert!(vk.len() >= nset * nao * nao);

        let size_rho = nset * naux;
        if size_rho > self.size_rho {
            self.size_rho = size_rho;
            self.rho = self.pm.alloc_host(size_rho);
        }

        let da_eri1 = DevArray2D::new(eri1, naux, nao_pair);

        if WITH_J {
            #[cfg(feature = "simple-timer")]
            self.timer.count_start("jk rho");

            let da_dmtril = DevArray2D::new(dmtril, nset, nao_pair);

            // rho[s, i] = sum_p dmtril[s, p] * eri1[i, p]
            self.rho[..size_rho]
                .par_iter_mut()
                .enumerate()
                .for_each(|(si, out)| {
                    let (s, i) = (si / naux, si % naux);
                    *out = izip!(da_dmtril.row(s), da_eri1.row(i))
                        .map(|(d, e)| d * e)
                        .sum();
                });

            #[cfg(feature = "simple-timer")]
            {
                self.timer.count("jk rho");
                self.timer.count_start("jk vj");
            }

            let da_rho = DevArray2D::new(&self.rho, nset, naux);

            // vj[s, p] += sum_i rho[s, i] * eri1[i, p]
            vj[..nset * nao_pair]
                .par_iter_mut()
                .enumerate()
                .for_each(|(sp, out)| {
                    let (s, p) = (sp / nao_pair, sp % nao_pair);
                    *out += (0..naux)
                        .map(|i| da_rho.at(s, i) * da_eri1.at(i, p))
                        .sum::<f64>();
                });

            #[cfg(feature = "simple-timer")]
            self.timer.count("jk vj");
        }

        let blksize = self.blksize;
        let handle = match self.handle.as_ref() {
            Some(handle) => handle,
            None => panic!("Device :: get_jk called before init_get_jk"),
        };
        let (d_buf2, d_buf3, d_vkk) = match (
            self.d_buf2.as_mut(),
            self.d_buf3.as_mut(),
            self.d_vkk.as_mut(),
        ) {
            (Some(b2), Some(b3), Some(vkk)) => (b2, b3, vkk),
            _ => panic!("Device :: get_jk called before init_get_jk"),
        };
        let (buf1_full, buf2_full) = self.buf_tmp.split_at_mut(blksize * nao * nao);

        for (idm, dm) in dms.iter().enumerate() {
            debug_assert!(dm.len() >= nao * nao);
            let orbs_slice = [0, nao, 0, nao];

            #[cfg(feature = "simple-timer")]
            self.timer.count_start("jk fdrv");

            // buf1[i] = D . S_i for every auxiliary slab
            fdrv(
                buf1_full,
                &eri1[..naux * nao_pair],
                dm,
                naux,
                nao,
                orbs_slice,
                &mut self.buf_fdrv,
            );

            #[cfg(feature = "simple-timer")]
            {
                self.timer.count("jk fdrv");
                self.timer.count_start("jk unpack");
            }

            // buf2[i] = both triangles of the packed row i
            buf2_full[..naux * nao * nao]
                .par_chunks_mut(nao * nao)
                .enumerate()
                .for_each(|(i, slab)| unpack_tril(da_eri1.row(i), slab, nao));

            #[cfg(feature = "simple-timer")]
            {
                self.timer.count("jk unpack");
                self.timer.count_start("jk transpose");
            }

            // buf3[a, i, j] = buf1[i, j, a]: the contracted (i, j) axis
            // becomes contiguous for the gemm below
            let da_buf1 = DevArray3D::new(buf1_full, naux, nao, nao);
            self.buf3[..nao * naux * nao]
                .par_chunks_mut(naux * nao)
                .enumerate()
                .for_each(|(a, out_a)| {
                    for i in 0..naux {
                        for j in 0..nao {
                            out_a[i * nao + j] = da_buf1.at(i, j, a);
                        }
                    }
                });

            #[cfg(feature = "simple-timer")]
            {
                self.timer.count("jk transpose");
                self.timer.count_start("jk gemm");
            }

            // scatter the caller's vk block into its interleaved device tile
            let da_vk = DevArray3D::new(vk, nset, nao, nao);
            for a in 0..nao {
                for b in 0..nao {
                    self.vk_stage[a * nset * nao + idm * nao + b] = da_vk.at(idm, a, b);
                }
            }

            self.pm.push_async(d_buf2, buf2_full, blksize * nao * nao);
            self.pm.push_async(d_buf3, &self.buf3, blksize * nao * nao);
            self.pm.push(d_vkk, &self.vk_stage, nset * nao * nao);
            self.pm.stream_wait();

            let m = nao as i32;
            let n = nao as i32;
            let k = (naux * nao) as i32;
            let lda = (naux * nao) as i32;
            let ldb = nao as i32;
            let ldc = (nset * nao) as i32;
            let beta = if count == 0 { 0.0 } else { 1.0 };

            self.pm.dgemm_nn(
                handle,
                m,
                n,
                k,
                1.0,
                d_buf2,
                ldb,
                d_buf3,
                lda,
                beta,
                d_vkk,
                idm * nao,
                ldc,
            );

            self.pm.pull(&mut self.vk_stage, d_vkk, nset * nao * nao);

            // gather the tile back into the caller's dense block
            let da_stage = DevArray3D::new(&self.vk_stage, nao, nset, nao);
            for a in 0..nao {
                for b in 0..nao {
                    vk[(idm * nao + a) * nao + b] = da_stage.at(a, idm, b);
                }
            }

            #[cfg(feature = "simple-timer")]
            self.timer.count("jk gemm");
        }
    }

    #[cfg(feature = "simple-timer")]
    pub fn report_timings(&self) {
        self.timer.report_all();
    }
}

impl Default for Device {
    fn default() -> Device {
        Device::new()
    }
}

/// Symmetric-matrix transform driver.
///
/// For each auxiliary index `i < nij`, unpacks the packed lower-triangle row
/// `vin[i, :]` into a symmetric `nao x nao` matrix `S_i` and writes
/// `vout[i] = S_i . mo_coeff[:, i_start..i_start + i_count]` through a
/// symmetric-left multiply, producing an `(i_count, nao)` slab per index in
/// the row-major output.
///
/// `orbs_slice` is `[i_start, i_stop, ket_start, ket_stop]`; the ket range is
/// carried for the caller but must equal the full basis range — sub-ranges do
/// not narrow the multiply strides. `buf` is the pooled scratch, one
/// `4 * nao * nao` partition per worker.
pub fn fdrv(
    vout: &mut [f64],
    vin: &[f64],
    mo_coeff: &[f64],
    nij: usize,
    nao: usize,
    orbs_slice: [usize; 4],
    buf: &mut [f64],
) {
    if nij == 0 {
        return;
    }

    let bra_start = orbs_slice[0];
    let bra_count = orbs_slice[1] - orbs_slice[0];
    debug_assert_eq!(orbs_slice[2], 0);
    debug_assert_eq!(orbs_slice[3], nao);

    let ij_pair = bra_count * nao;
    let nao2 = nao * (nao + 1) / 2;
    debug_assert!(vin.len() >= nij * nao2);
    debug_assert!(mo_coeff.len() >= nao * nao);

    let scratch = 4 * nao * nao;
    let nworker = buf.len() / scratch;
    debug_assert!(nworker >= 1);
    let chunk = nij.div_ceil(nworker);

    vout[..nij * ij_pair]
        .par_chunks_mut(chunk * ij_pair)
        .zip(buf.par_chunks_mut(scratch))
        .enumerate()
        .for_each(|(w, (vout_w, buf_w))| {
            for (ii, vout_i) in vout_w.chunks_mut(ij_pair).enumerate() {
                let i = w * chunk + ii;
                let tril = &vin[nao2 * i..nao2 * (i + 1)];

                // row-major lower triangle doubles as the column-major upper
                // triangle read by dsymm
                let mut ij = 0;
                for a in 0..nao {
                    for b in 0..=a {
                        buf_w[a * nao + b] = tril[ij];
                        ij += 1;
                    }
                }

                unsafe {
                    blas::dsymm(
                        b'L',
                        b'U',
                        nao as i32,
                        bra_count as i32,
                        1.0,
                        buf_w,
                        nao as i32,
                        &mo_coeff[bra_start * nao..],
                        nao as i32,
                        0.0,
                        vout_i,
                        nao as i32,
                    );
                }
            }
        });
}

/// Unpacks one packed lower-triangle row (`pair(a, b) = a*(a+1)/2 + b`,
/// `a >= b`) into a full square slab, filling both triangles.
pub fn unpack_tril(tril: &[f64], out: &mut [f64], nao: usize) {
    let mut ij = 0;
    for a in 0..nao {
        for b in 0..=a {
            out[a * nao + b] = tril[ij];
            out[b * nao + a] = tril[ij];
            ij += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::prelude::*;

    const EPS_J: f64 = 1e-10;
    const EPS_K: f64 = 1e-9;

    /// Deterministic pseudo-data in (-1, 1).
    fn seq(n: usize, seed: usize) -> Vec<f64> {
        (0..n)
            .map(|t| (((t + 3) * (t + seed + 7)) as f64 * 0.37).sin())
            .collect()
    }

    fn pack_tril(m: ArrayView2<f64>) -> Vec<f64> {
        let nao = m.nrows();
        let mut out = Vec::with_capacity(nao * (nao + 1) / 2);
        for a in 0..nao {
            for b in 0..=a {
                out.push(m[[a, b]]);
            }
        }
        out
    }

    fn symmetric(nao: usize, seed: usize) -> Array2<f64> {
        let raw = Array2::from_shape_vec((nao, nao), seq(nao * nao, seed)).unwrap();
        0.5 * (&raw + &raw.t())
    }

    fn unpack_square(tril: &[f64], nao: usize) -> Array2<f64> {
        let mut out = vec![0.0; nao * nao];
        unpack_tril(tril, &mut out, nao);
        Array2::from_shape_vec((nao, nao), out).unwrap()
    }

    /// Dense einsum oracles for the J and K contractions.
    fn ref_jk(
        eri1: &[f64],
        dmtril: &[f64],
        dms: &[&[f64]],
        naux: usize,
        nao: usize,
        nset: usize,
    ) -> (Vec<f64>, Vec<f64>) {
        let nao_pair = nao * (nao + 1) / 2;
        let eri = ArrayView2::from_shape((naux, nao_pair), &eri1[..naux * nao_pair]).unwrap();
        let dm_t = ArrayView2::from_shape((nset, nao_pair), dmtril).unwrap();
        let rho = dm_t.dot(&eri.t());
        let vj = rho.dot(&eri);

        let mut vk = vec![0.0; nset * nao * nao];
        for s in 0..nset {
            let d = ArrayView2::from_shape((nao, nao), dms[s]).unwrap();
            let mut acc = Array2::<f64>::zeros((nao, nao));
            for i in 0..naux {
                let s_i = unpack_square(eri.row(i).as_slice().unwrap(), nao);
                acc = acc + d.dot(&s_i).dot(&s_i);
            }
            vk[s * nao * nao..(s + 1) * nao * nao]
                .copy_from_slice(acc.as_slice().unwrap());
        }
        (vj.iter().cloned().collect(), vk)
    }

    fn assert_close(got: &[f64], want: &[f64], eps: f64) {
        assert_eq!(got.len(), want.len());
        let norm: f64 = want.iter().map(|x| x * x).sum::<f64>().sqrt().max(1.0);
        for (g, w) in got.iter().zip(want) {
            assert!(
                (g - w).abs() <= eps * norm,
                "mismatch: got {}, want {} (norm {})",
                g,
                w,
                norm
            );
        }
    }

    fn fdrv_scratch(nao: usize) -> Vec<f64> {
        vec![0.0; 4 * nao * nao * rayon::current_num_threads()]
    }

    #[test]
    fn unpack_round_trip() {
        let nao = 5;
        let m = symmetric(nao, 11);
        let packed = pack_tril(m.view());
        assert_eq!(packed.len(), nao * (nao + 1) / 2);
        let back = unpack_square(&packed, nao);
        assert_eq!(back, m);
    }

    #[test]
    fn fdrv_matches_dense_product() {
        let nao = 4;
        let naux = 3;
        let nao_pair = nao * (nao + 1) / 2;

        let slabs: Vec<Array2<f64>> = (0..naux).map(|i| symmetric(nao, 20 + i)).collect();
        let mut eri = Vec::with_capacity(naux * nao_pair);
        for s in &slabs {
            eri.extend_from_slice(&pack_tril(s.view()));
        }
        let d = symmetric(nao, 5);
        let d_raw: Vec<f64> = d.iter().cloned().collect();

        let mut out = vec![0.0; naux * nao * nao];
        let mut scratch = fdrv_scratch(nao);
        fdrv(&mut out, &eri, &d_raw, naux, nao, [0, nao, 0, nao], &mut scratch);

        for (i, s_i) in slabs.iter().enumerate() {
            // row-major slab i holds (S_i . D) transposed, i.e. D . S_i
            let want = d.dot(s_i);
            let got = ArrayView2::from_shape(
                (nao, nao),
                &out[i * nao * nao..(i + 1) * nao * nao],
            )
            .unwrap();
            for a in 0..nao {
                for b in 0..nao {
                    assert!((got[[a, b]] - want[[a, b]]).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn scenario_single_density() {
        let nao = 2;
        let naux = 1;
        let nset = 1;
        let eri = vec![1.0, 0.0, 1.0];
        let dmtril = vec![2.0, 0.0, 2.0];
        let d0 = vec![2.0, 0.0, 0.0, 2.0];
        let dms: Vec<&[f64]> = vec![&d0];

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; 3];
        let mut vk = vec![7.7; 4];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        assert_close(&vj, &[4.0, 0.0, 4.0], EPS_J);
        assert_close(&vk, &[2.0, 0.0, 0.0, 2.0], EPS_K);
    }

    #[test]
    fn scenario_two_densities() {
        let nao = 2;
        let naux = 2;
        let nset = 2;
        let eri = vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let dmtril = vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let eye = vec![1.0, 0.0, 0.0, 1.0];
        let dms: Vec<&[f64]> = vec![&eye, &eye];

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; 6];
        let mut vk = vec![0.0; 8];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        assert_close(&vj, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], EPS_J);
        let (_, vk_ref) = ref_jk(&eri, &dmtril, &dms, naux, nao, nset);
        assert_close(&vk, &vk_ref, EPS_K);
    }

    #[test]
    fn general_shapes_match_oracle() {
        let nao = 5;
        let naux = 4;
        let nset = 2;
        let nao_pair = nao * (nao + 1) / 2;

        let mut eri = Vec::with_capacity(naux * nao_pair);
        for i in 0..naux {
            eri.extend_from_slice(&pack_tril(symmetric(nao, 40 + i).view()));
        }
        let mut dmtril = Vec::with_capacity(nset * nao_pair);
        let mut dms_data = Vec::with_capacity(nset);
        for s in 0..nset {
            let d = symmetric(nao, 60 + s);
            dmtril.extend_from_slice(&pack_tril(d.view()));
            dms_data.push(d.iter().cloned().collect::<Vec<f64>>());
        }
        let dms: Vec<&[f64]> = dms_data.iter().map(|d| d.as_slice()).collect();

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nset * nao_pair];
        let mut vk = vec![3.3; nset * nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        let (vj_ref, vk_ref) = ref_jk(&eri, &dmtril, &dms, naux, nao, nset);
        assert_close(&vj, &vj_ref, EPS_J);
        assert_close(&vk, &vk_ref, EPS_K);
    }

    #[test]
    fn accumulation_over_two_calls() {
        let nao = 3;
        let naux = 2;
        let nset = 1;
        let nao_pair = nao * (nao + 1) / 2;

        let mut eri = Vec::new();
        for i in 0..naux {
            eri.extend_from_slice(&pack_tril(symmetric(nao, 80 + i).view()));
        }
        let d = symmetric(nao, 90);
        let dmtril = pack_tril(d.view());
        let d_raw: Vec<f64> = d.iter().cloned().collect();
        let dms: Vec<&[f64]> = vec![&d_raw];

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nao_pair];
        let mut vk = vec![0.0; nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);
        let vj_single = vj.clone();
        let vk_single = vk.clone();

        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 1);

        let vj_double: Vec<f64> = vj_single.iter().map(|x| 2.0 * x).collect();
        let vk_double: Vec<f64> = vk_single.iter().map(|x| 2.0 * x).collect();
        assert_close(&vj, &vj_double, EPS_J);
        assert_close(&vk, &vk_double, EPS_K);
    }

    #[test]
    fn vk_blocks_stay_symmetric() {
        let nao = 4;
        let naux = 3;
        let nset = 2;
        let nao_pair = nao * (nao + 1) / 2;

        let mut eri = Vec::new();
        for i in 0..naux {
            eri.extend_from_slice(&pack_tril(symmetric(nao, 100 + i).view()));
        }
        let mut dmtril = Vec::new();
        let mut dms_data = Vec::new();
        for s in 0..nset {
            let d = symmetric(nao, 120 + s);
            dmtril.extend_from_slice(&pack_tril(d.view()));
            dms_data.push(d.iter().cloned().collect::<Vec<f64>>());
        }
        let dms: Vec<&[f64]> = dms_data.iter().map(|d| d.as_slice()).collect();

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nset * nao_pair];
        let mut vk = vec![0.0; nset * nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        for s in 0..nset {
            let block = &vk[s * nao * nao..(s + 1) * nao * nao];
            for a in 0..nao {
                for b in 0..nao {
                    assert!((block[a * nao + b] - block[b * nao + a]).abs() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn monotonic_allocation_reuses_buffers() {
        let big = (8usize, 4usize, 1usize); // (nao, naux, nset)
        let small = (4usize, 2usize, 1usize);

        let build = |nao: usize, naux: usize, nset: usize, seed: usize| {
            let mut eri = Vec::new();
            for i in 0..naux {
                eri.extend_from_slice(&pack_tril(symmetric(nao, seed + i).view()));
            }
            let mut dmtril = Vec::new();
            let mut dms_data = Vec::new();
            for s in 0..nset {
                let d = symmetric(nao, seed + 50 + s);
                dmtril.extend_from_slice(&pack_tril(d.view()));
                dms_data.push(d.iter().cloned().collect::<Vec<f64>>());
            }
            (eri, dmtril, dms_data)
        };

        let mut dev = Device::new();

        let (nao, naux, nset) = big;
        let (eri, dmtril, dms_data) = build(nao, naux, nset, 200);
        let dms: Vec<&[f64]> = dms_data.iter().map(|d| d.as_slice()).collect();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nset * nao * (nao + 1) / 2];
        let mut vk = vec![0.0; nset * nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        let ptr_buf_tmp = dev.buf_tmp.as_ptr();
        let ptr_buf3 = dev.buf3.as_ptr();
        let ptr_fdrv = dev.buf_fdrv.as_ptr();
        let len_buf_tmp = dev.buf_tmp.len();

        // smaller shapes must not touch the allocations
        let (nao, naux, nset) = small;
        let (eri, dmtril, dms_data) = build(nao, naux, nset, 300);
        let dms: Vec<&[f64]> = dms_data.iter().map(|d| d.as_slice()).collect();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nset * nao * (nao + 1) / 2];
        let mut vk = vec![0.0; nset * nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        assert_eq!(ptr_buf_tmp, dev.buf_tmp.as_ptr());
        assert_eq!(ptr_buf3, dev.buf3.as_ptr());
        assert_eq!(ptr_fdrv, dev.buf_fdrv.as_ptr());
        assert_eq!(len_buf_tmp, dev.buf_tmp.len());

        // and the small-shape results stay correct on the reused scratch
        let (vj_ref, vk_ref) = ref_jk(&eri, &dmtril, &dms, naux, nao, nset);
        assert_close(&vj, &vj_ref, EPS_J);
        assert_close(&vk, &vk_ref, EPS_K);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn pulled_vk_matches_device_accumulator() {
        let nao = 3;
        let naux = 2;
        let nset = 2;
        let nao_pair = nao * (nao + 1) / 2;

        let mut eri = Vec::new();
        for i in 0..naux {
            eri.extend_from_slice(&pack_tril(symmetric(nao, 140 + i).view()));
        }
        let mut dmtril = Vec::new();
        let mut dms_data = Vec::new();
        for s in 0..nset {
            let d = symmetric(nao, 160 + s);
            dmtril.extend_from_slice(&pack_tril(d.view()));
            dms_data.push(d.iter().cloned().collect::<Vec<f64>>());
        }
        let dms: Vec<&[f64]> = dms_data.iter().map(|d| d.as_slice()).collect();

        let mut dev = Device::new();
        dev.init_get_jk(&eri, &dmtril, naux, nset, nao);
        let mut vj = vec![0.0; nset * nao_pair];
        let mut vk = vec![0.0; nset * nao * nao];
        dev.get_jk(naux, nao, nset, &eri, &dmtril, &dms, &mut vj, &mut vk, 0);

        // host-visible vk must agree with the device-side accumulator
        // contents at the moment of the final pull
        let d_vkk = dev.d_vkk.as_ref().unwrap();
        assert_eq!(&dev.vk_stage[..nset * nao * nao], &d_vkk[..nset * nao * nao]);
        for s in 0..nset {
            for a in 0..nao {
                for b in 0..nao {
                    let staged = dev.vk_stage[a * nset * nao + s * nao + b];
                    assert!((vk[(s * nao + a) * nao + b] - staged).abs() < 1e-15);
                }
            }
        }
    }
}
