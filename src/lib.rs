pub mod packet_io;
pub mod simcast;
pub mod util;
pub mod test_util;
