//! # rijk
//!
//! GPU-offload builder for the Coulomb (J) and exchange (K) matrices arising
//! in density-fitting SCF iterations. The host numerical driver supplies the
//! packed three-index integral tensor together with one or more one-particle
//! density matrices, and receives J and K accumulated into its own arrays;
//! this crate owns the scratch lifecycle, the per-auxiliary symmetric
//! transforms, and the fused exchange GEMM on the accelerator.
//!
//! The driver-facing surface is [`jk::Device`]:
//! - [`jk::Device::init_get_jk`] sizes the buffer pool for the given shapes,
//! - [`jk::Device::get_jk`] performs one JK build,
//! - [`jk::Device::free_get_jk`] is retained for symmetry.
//!
//! ### Build variants
//!   1) `cuda`: offload the exchange GEMM through cuBLAS; without it the same
//!      call sequence runs against a host mirror of the device buffers.
//!   2) `mpi`: back the rank facade in [`mpi_io`] with the real bindings
//!      instead of the single-process stub.
//!   3) `simple-timer`: accumulate coarse per-phase wall-clock timings on the
//!      [`jk::Device`], reported via `Device::report_timings`.
//!
//! None of the variants alter numerical semantics.

extern crate blas_src;

pub mod constants;
pub mod dev_array;
pub mod jk;
pub mod mpi_io;
pub mod pm;
pub mod utilities;

pub use jk::Device;
