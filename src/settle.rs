//! Device settle gate
//!
//! After a zvol is created or destroyed, udev creates or removes the
//! `/dev/zvol/...` node asynchronously. Nothing may bind a LUN to a device
//! path until that has happened, so every mutating backend call ends with
//! [`UdevSettle::settle`].

use crate::command::CommandRunner;
use crate::error::ProvisionResult;

/// Default udevadm location
pub const DEFAULT_UDEVADM: &str = "/usr/sbin/udevadm";

/// Global, blocking barrier over udev event processing
#[derive(Debug, Clone)]
pub struct UdevSettle {
    udevadm: String,
}

impl Default for UdevSettle {
    fn default() -> Self {
        Self::new(DEFAULT_UDEVADM)
    }
}

impl UdevSettle {
    pub fn new(udevadm: impl Into<String>) -> Self {
        Self {
            udevadm: udevadm.into(),
        }
    }

    /// Rescan block devices, then wait for the event queue to drain.
    ///
    /// There is no timeout: a stalled rescan stalls the caller.
    pub fn settle<R: CommandRunner + ?Sized>(&self, runner: &R) -> ProvisionResult<()> {
        runner.run_checked(
            &self.udevadm,
            &["trigger".to_string(), "--subsystem-match=block".to_string()],
        )?;
        runner.run_checked(&self.udevadm, &["settle".to_string()])?;
        log::debug!("udev settled");
        Ok(())
    }
}
