//! Collective-communication facade.
//!
//! The default build ships a single-process stub: rank 0 of size 1, no-op
//! init/barrier/finalize, and a hard check that the communicator argument is
//! the well-known sentinel [`crate::constants::COMM_WORLD`] — anything else
//! means an MPI-enabled driver was pointed at the stub, which is fatal. The
//! `mpi` feature replaces the stub with the real bindings.

#[cfg(not(feature = "mpi"))]
mod mpi_stub {
    use crate::constants::COMM_WORLD;

    /// Opaque handle the driver holds for rank discovery.
    pub struct MPIData {
        pub rank: usize,
        pub size: usize,
    }

    impl MPIData {
        pub fn initialization() -> Option<MPIData> {
            init();
            Some(MPIData {
                rank: comm_rank(COMM_WORLD),
                size: comm_size(COMM_WORLD),
            })
        }

        pub fn barrier(&self) {
            barrier(COMM_WORLD);
        }
    }

    pub fn init() {}

    pub fn comm_rank(comm: i32) -> usize {
        if comm != COMM_WORLD {
            panic!(
                "mpi_io :: comm_rank :: invalid communicator {}; \
                 is an MPI-enabled driver running against the stub facade?",
                comm
            );
        }
        0
    }

    pub fn comm_size(comm: i32) -> usize {
        if comm != COMM_WORLD {
            panic!(
                "mpi_io :: comm_size :: invalid communicator {}; \
                 is an MPI-enabled driver running against the stub facade?",
                comm
            );
        }
        1
    }

    pub fn barrier(_comm: i32) {}

    pub fn finalize() {}
}

#[cfg(not(feature = "mpi"))]
pub use mpi_stub::*;

#[cfg(feature = "mpi")]
mod mpi_real {
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// Opaque handle the driver holds for rank discovery; finalization
    /// happens when the universe is dropped.
    pub struct MPIData {
        _universe: Universe,
        world: SimpleCommunicator,
        pub rank: usize,
        pub size: usize,
    }

    impl MPIData {
        pub fn initialization() -> Option<MPIData> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(MPIData {
                _universe: universe,
                world,
                rank,
                size,
            })
        }

        pub fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi")]
pub use mpi_real::*;
