//! Platform memory management: host and device allocation, synchronous and
//! asynchronous transfers, stream and BLAS-handle lifecycle, and the one
//! double-precision GEMM the JK kernel issues.
//!
//! Two builds share the same surface. With the `cuda` feature the device side
//! is backed by cudarc (context at ordinal 0, one non-default stream, cuBLAS
//! handle bound to that stream). Without it the "device" buffers are host
//! vectors, transfers are memcpys, stream operations are no-ops, and the GEMM
//! runs through the Fortran BLAS binding with the identical argument tuple.
//!
//! Every failure is fatal: the platform layer prints a diagnostic and aborts.

#[cfg(feature = "cuda")]
mod pm_cuda {
    use anyhow::Context;
    use cudarc::cublas::sys::cublasOperation_t;
    use cudarc::cublas::{CudaBlas, Gemm, GemmConfig};
    use cudarc::driver::{CudaContext, CudaSlice, CudaStream};
    use std::sync::Arc;

    pub type DevSlice = CudaSlice<f64>;
    pub type BlasHandle = CudaBlas;

    pub struct PM {
        ctx: Arc<CudaContext>,
        stream: Option<Arc<CudaStream>>,
    }

    impl PM {
        pub fn new() -> PM {
            let ctx = CudaContext::new(0)
                .context("device context creation at ordinal 0")
                .unwrap_or_else(|e| panic!("PM :: {:?}", e));
            PM { ctx, stream: None }
        }

        fn stream(&self) -> &Arc<CudaStream> {
            match self.stream.as_ref() {
                Some(s) => s,
                None => panic!("PM :: stream used before stream_create"),
            }
        }

        pub fn alloc_host(&self, n: usize) -> Vec<f64> {
            vec![0.0; n]
        }

        pub fn alloc_dev(&self, n: usize) -> DevSlice {
            self.ctx
                .default_stream()
                .alloc_zeros::<f64>(n)
                .unwrap_or_else(|e| panic!("PM :: device allocation of {} doubles failed: {:?}", n, e))
        }

        pub fn stream_create(&mut self) {
            if self.stream.is_none() {
                let stream = self
                    .ctx
                    .new_stream()
                    .unwrap_or_else(|e| panic!("PM :: stream creation failed: {:?}", e));
                self.stream = Some(stream);
            }
        }

        pub fn stream_wait(&self) {
            self.stream()
                .synchronize()
                .unwrap_or_else(|e| panic!("PM :: stream synchronization failed: {:?}", e));
        }

        pub fn blas_create(&self) -> BlasHandle {
            CudaBlas::new(self.stream().clone())
                .unwrap_or_else(|e| panic!("PM :: cublas handle creation failed: {:?}", e))
        }

        pub fn push_async(&self, dst: &mut DevSlice, src: &[f64], n: usize) {
            let mut view = dst.slice_mut(0..n);
            self.stream()
                .memcpy_htod(&src[..n], &mut view)
                .unwrap_or_else(|e| panic!("PM :: H2D transfer of {} doubles failed: {:?}", n, e));
        }

        pub fn push(&self, dst: &mut DevSlice, src: &[f64], n: usize) {
            self.push_async(dst, src, n);
            self.stream_wait();
        }

        pub fn pull(&self, dst: &mut [f64], src: &DevSlice, n: usize) {
            let view = src.slice(0..n);
            self.stream()
                .memcpy_dtoh(&view, &mut dst[..n])
                .unwrap_or_else(|e| panic!("PM :: D2H transfer of {} doubles failed: {:?}", n, e));
            self.stream_wait();
        }

        /// `C := alpha * A . B + beta * C` on column-major views of the device
        /// buffers, `op(A) = op(B) = N`, with `C` addressed at `c_offset`
        /// elements into `c`.
        #[allow(clippy::too_many_arguments)]
        pub fn dgemm_nn(
            &self,
            handle: &BlasHandle,
            m: i32,
            n: i32,
            k: i32,
            alpha: f64,
            a: &DevSlice,
            lda: i32,
            b: &DevSlice,
            ldb: i32,
            beta: f64,
            c: &mut DevSlice,
            c_offset: usize,
            ldc: i32,
        ) {
            let cfg = GemmConfig {
                transa: cublasOperation_t::CUBLAS_OP_N,
                transb: cublasOperation_t::CUBLAS_OP_N,
                m,
                n,
                k,
                alpha,
                lda,
                ldb,
                beta,
                ldc,
            };
            let mut c_view = c.slice_mut(c_offset..);
            unsafe { handle.gemm(cfg, a, b, &mut c_view) }
                .unwrap_or_else(|e| panic!("PM :: cublas dgemm failed: {:?}", e));
        }
    }
}

#[cfg(not(feature = "cuda"))]
mod pm_host {
    /// Host mirror of a device buffer.
    pub type DevSlice = Vec<f64>;

    /// Host stand-in for the cuBLAS handle; the GEMM goes through the
    /// Fortran binding instead.
    pub struct BlasHandle;

    pub struct PM {
        stream: bool,
    }

    impl PM {
        pub fn new() -> PM {
            PM { stream: false }
        }

        pub fn alloc_host(&self, n: usize) -> Vec<f64> {
            vec![0.0; n]
        }

        pub fn alloc_dev(&self, n: usize) -> DevSlice {
            vec![0.0; n]
        }

        pub fn stream_create(&mut self) {
            self.stream = true;
        }

        pub fn stream_wait(&self) {
            debug_assert!(self.stream, "PM :: stream used before stream_create");
        }

        pub fn blas_create(&self) -> BlasHandle {
            BlasHandle
        }

        pub fn push_async(&self, dst: &mut DevSlice, src: &[f64], n: usize) {
            dst[..n].copy_from_slice(&src[..n]);
        }

        pub fn push(&self, dst: &mut DevSlice, src: &[f64], n: usize) {
            self.push_async(dst, src, n);
        }

        pub fn pull(&self, dst: &mut [f64], src: &DevSlice, n: usize) {
            dst[..n].copy_from_slice(&src[..n]);
        }

        /// `C := alpha * A . B + beta * C` on column-major views of the host
        /// mirrors, `op(A) = op(B) = N`, with `C` addressed at `c_offset`
        /// elements into `c`.
        #[allow(clippy::too_many_arguments)]
        pub fn dgemm_nn(
            &self,
            _handle: &BlasHandle,
            m: i32,
            n: i32,
            k: i32,
            alpha: f64,
            a: &DevSlice,
            lda: i32,
            b: &DevSlice,
            ldb: i32,
            beta: f64,
            c: &mut DevSlice,
            c_offset: usize,
            ldc: i32,
        ) {
            unsafe {
                blas::dgemm(
                    b'N',
                    b'N',
                    m,
                    n,
                    k,
                    alpha,
                    a,
                    lda,
                    b,
                    ldb,
                    beta,
                    &mut c[c_offset..],
                    ldc,
                );
            }
        }
    }
}

#[cfg(feature = "cuda")]
pub use pm_cuda::*;
#[cfg(not(feature = "cuda"))]
pub use pm_host::*;
