//! A process-wide client.
//!
//! Libraries that cannot be handed a [`Client`] explicitly can fetch the one installed here. Nothing is installed by
//! default: the application builds a client with the configuration it wants and installs it once at startup.
use parking_lot::{const_rwlock, RwLock};

use crate::{client::Client, error::Error};

static GLOBAL: RwLock<Option<Client>> = const_rwlock(None);

/// Installs `client` as the process-wide client.
///
/// # Errors
///
/// If a client is already installed, `client` is handed back unchanged.
pub fn install(client: Client) -> Result<(), Client> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(client);
    }
    *global = Some(client);
    Ok(())
}

/// Returns the process-wide client, if one is installed.
pub fn get() -> Option<Client> {
    GLOBAL.read().clone()
}

/// Removes the process-wide client and closes its pipeline.
///
/// Does nothing if no client is installed. Handles obtained earlier keep working until the close completes, after
/// which their updates are dropped.
///
/// # Errors
///
/// If the final write of the pipeline failed, that error is returned.
pub fn shutdown() -> Result<(), Error> {
    let client = GLOBAL.write().take();
    match client {
        Some(client) => client.close(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        builder::PipelineBuilder,
        client::Client,
        test_util::{LineProtocol, MemoryDialer},
    };

    fn client(dialer: &MemoryDialer) -> Client {
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(Duration::from_secs(3600))
            .build(dialer.clone(), LineProtocol)
            .unwrap();
        Client::new(pipeline)
    }

    // The global client is process-wide state, so its whole lifecycle is exercised in a single test.
    #[test]
    fn install_get_and_shutdown() {
        assert!(super::get().is_none());
        assert!(super::shutdown().is_ok());

        let dialer = MemoryDialer::new();
        super::install(client(&dialer)).unwrap();

        let rejected = super::install(client(&MemoryDialer::new())).unwrap_err();
        rejected.close().unwrap();

        let global = super::get().expect("client should be installed");
        global.counter("installed", [("via", "global")]).increment();

        super::shutdown().unwrap();
        assert!(super::get().is_none());
        assert!(global.pipeline().is_closed());
        assert_eq!(dialer.written_lines().len(), 1);
    }
}
