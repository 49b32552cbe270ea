/// Well-known communicator sentinel accepted by the rank facade in
/// [`crate::mpi_io`].
pub const COMM_WORLD: i32 = 0;
