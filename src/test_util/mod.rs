//! Utilities for testing code based on simulated multicast. They are used for testing the
//!  crate itself, but they are also exported for application testing.

pub mod datagram;
pub mod endpoint;
pub mod multicast;


#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
