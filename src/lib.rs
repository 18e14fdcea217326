pub mod config;
pub mod messaging;
pub mod network_system;
pub mod replication;
#[cfg(test)]
pub(crate) mod test_util;
pub mod transport;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
