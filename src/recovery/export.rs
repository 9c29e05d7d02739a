//! Server-side export of a client connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::ExportDisconnector;

/// A peer's connection as seen from the serving side.
pub struct Export {
    uuid: Uuid,
    client: String,
    failed: AtomicBool,
    disconnector: Arc<dyn ExportDisconnector>,
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("uuid", &self.uuid)
            .field("client", &self.client)
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl Export {
    pub fn new(client: impl Into<String>, disconnector: Arc<dyn ExportDisconnector>) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            client: client.into(),
            failed: AtomicBool::new(false),
            disconnector,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Mark the export failed and disconnect it.
    ///
    /// Only the first call disconnects; later calls are no-ops. The
    /// disconnector gets its own reference, so the export stays alive
    /// until this call returns whatever the disconnector does with it.
    pub fn fail(self: &Arc<Self>) {
        if self.failed.swap(true, Ordering::AcqRel) {
            debug!(uuid = %self.uuid, client = %self.client, "export already failed");
            return;
        }
        info!(uuid = %self.uuid, client = %self.client, "failing export");
        if let Err(e) = self.disconnector.disconnect(self.clone()) {
            error!(uuid = %self.uuid, client = %self.client, error = %e, "failed to disconnect export");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ExportDisconnector for Counting {
        fn disconnect(&self, export: Arc<Export>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(export.is_failed());
            if self.fail {
                return Err(Error::Transport("already gone".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_fail_is_idempotent() {
        let disconnector = Arc::new(Counting::default());
        let export = Export::new("client-a", disconnector.clone());
        export.fail();
        export.fail();
        assert!(export.is_failed());
        assert_eq!(disconnector.calls.load(Ordering::SeqCst), 1);
        // the disconnector's reference was released
        assert_eq!(Arc::strong_count(&export), 1);
    }

    #[test]
    fn test_disconnect_error_is_swallowed() {
        let disconnector = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let export = Export::new("client-b", disconnector.clone());
        export.fail();
        export.fail();
        assert_eq!(disconnector.calls.load(Ordering::SeqCst), 1);
    }
}
