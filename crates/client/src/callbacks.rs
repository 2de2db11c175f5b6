use crate::ClientError;

/// Hooks around the client's relay sessions.
///
/// `network` is always `"tcp"` and `addr` is the relay's advertised address.
pub trait ClientCallbacks: Send + Sync {
    /// Called before a relay is dialed. An error vetoes the dial.
    fn on_session_dial(&self, network: &str, addr: &str) -> Result<(), String> {
        let _ = (network, addr);
        Ok(())
    }

    /// Called when a session attempt fails or an established session ends.
    fn on_session_disconnect(&self, network: &str, addr: &str, err: &ClientError) {
        let _ = (network, addr, err);
    }
}

pub struct NoopCallbacks;

impl ClientCallbacks for NoopCallbacks {}
