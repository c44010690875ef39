// Suspend/resume notifications from systemd-logind

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{PowerguardError, Result};
use crate::events::ControlEvent;

const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const LOGIND_MANAGER: &str = "org.freedesktop.login1.Manager";
const PREPARE_FOR_SLEEP: &str = "PrepareForSleep";

/// `PrepareForSleep(false)` is sent once the system is running again
fn resume_event(preparing_for_sleep: bool) -> Option<ControlEvent> {
    (!preparing_for_sleep).then_some(ControlEvent::Resume)
}

/// Posts [`ControlEvent::Resume`] after every wake-up
pub struct ResumeWatcher {
    events: mpsc::Sender<ControlEvent>,
}

impl ResumeWatcher {
    pub fn new(events: mpsc::Sender<ControlEvent>) -> Self {
        Self { events }
    }

    /// Watch until cancelled
    ///
    /// A failed subscription disables forced reapply for the lifetime of the
    /// process; periodic enforcement is not affected.
    pub async fn run(self, cancel: CancellationToken) {
        if let Err(e) = self.watch(cancel).await {
            let e = match e {
                PowerguardError::DBusError(e) => PowerguardError::EventSubscription(e.to_string()),
                other => other,
            };
            tracing::warn!("{}. Voltage planes will not be reapplied on resume", e);
        }
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        let connection = zbus::Connection::system().await?;
        let proxy =
            zbus::Proxy::new(&connection, LOGIND_SERVICE, LOGIND_PATH, LOGIND_MANAGER).await?;
        let mut signals = proxy.receive_signal(PREPARE_FOR_SLEEP).await?;
        tracing::info!("Listening for {} signals", PREPARE_FOR_SLEEP);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = signals.next() => message,
            };
            let Some(message) = message else {
                return Err(PowerguardError::EventSubscription(format!(
                    "{PREPARE_FOR_SLEEP} signal stream ended"
                )));
            };

            let preparing = match message.body().deserialize::<bool>() {
                Ok(preparing) => preparing,
                Err(e) => {
                    tracing::debug!("Ignoring malformed {} signal: {}", PREPARE_FOR_SLEEP, e);
                    continue;
                }
            };
            if let Some(event) = resume_event(preparing) {
                if self.events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_wakeup_posts_resume() {
        assert!(resume_event(true).is_none());
        assert!(matches!(resume_event(false), Some(ControlEvent::Resume)));
    }
}
