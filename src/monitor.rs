use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::info;

use crate::broadcast::{Broadcaster, STATUS_CHANGE_EVENT};
use crate::error;
use crate::poller::{Cycle, Poller};
use crate::status::UpsState;
use crate::store::StateStore;
use crate::ups::Fetcher;

/// The face the host sees: lifecycle, the state query and event registration.
///
/// Owns the shared [`StateStore`] and at most one running [`Poller`].
pub struct UpsMonitor {
    store: Arc<StateStore>,
    broadcaster: Arc<dyn Broadcaster>,
    interval: Duration,
    event: Mutex<String>,
    poller: Mutex<Option<Poller>>,
}

impl UpsMonitor {
    pub fn new(fetcher: Fetcher, broadcaster: Arc<dyn Broadcaster>, interval: Duration) -> UpsMonitor {
        UpsMonitor {
            store: Arc::new(StateStore::new(Arc::new(fetcher))),
            broadcaster,
            interval,
            event: Mutex::new(STATUS_CHANGE_EVENT.to_string()),
            poller: Mutex::new(None),
        }
    }

    /// Records the name the host registered for status change events.
    /// Takes effect on the next [`UpsMonitor::start`].
    pub fn on_event_registered(&self, name: impl Into<String>) {
        let name = name.into();
        info!(event = %name, "Registered status change event");
        *self.event.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }

    pub fn registered_events(&self) -> Vec<String> {
        vec![self.event.lock().unwrap_or_else(PoisonError::into_inner).clone()]
    }

    /// Starts polling. Does nothing if already running.
    pub fn start(&self) -> error::Result<()> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Ok(());
        }

        let event = self.event.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let cycle = Cycle::new(self.store.clone(), self.broadcaster.clone(), event);
        *poller = Some(Poller::start(cycle, self.interval)?);
        Ok(())
    }

    /// Stops polling, waiting for an in-flight cycle to finish.
    pub fn stop(&self) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut poller) = poller {
            poller.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, Poller::is_running)
    }

    /// Current state for the query surface. May block on one fetch if no poll has completed yet.
    pub fn handle_query(&self) -> UpsState {
        self.store.current()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

impl Drop for UpsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::broadcast::testing::Recorder;
    use crate::error::{ConfigError, Error};
    use crate::status::UpsStatus;
    use crate::ups::testing::{raw, ScriptedSource};

    fn monitor(source: ScriptedSource, interval: Duration) -> (Arc<Recorder>, UpsMonitor) {
        let recorder = Arc::new(Recorder::default());
        let monitor = UpsMonitor::new(Fetcher::new(source), recorder.clone(), interval);
        (recorder, monitor)
    }

    #[test]
    fn query_before_first_poll_fetches() {
        let (recorder, monitor) = monitor(
            ScriptedSource::new(vec![Ok(raw(&[("ups.status", "OL"), ("battery.runtime", "600")]))]),
            Duration::from_secs(60),
        );

        assert_eq!(monitor.handle_query(), UpsState::new(UpsStatus::Online, -1, 600));
        // The on-demand read is not a broadcast.
        assert!(recorder.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn transitions_use_registered_name() {
        let (recorder, monitor) = monitor(
            ScriptedSource::new(vec![
                Ok(raw(&[("ups.status", "OL")])),
                Ok(raw(&[("ups.status", "OB")])),
            ]),
            Duration::from_millis(5),
        );
        monitor.on_event_registered("power_changed");
        assert_eq!(monitor.registered_events(), vec!["power_changed".to_string()]);

        monitor.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.transitions().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.stop();

        let messages = recorder.messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.event() == "power_changed"));
    }

    #[test]
    fn start_twice_and_stop_twice() {
        let (_, monitor) = monitor(ScriptedSource::new(Vec::new()), Duration::from_secs(60));
        monitor.start().unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn bad_interval_leaves_queries_working() {
        let (_, monitor) = monitor(ScriptedSource::new(Vec::new()), Duration::ZERO);
        assert!(matches!(
            monitor.start(),
            Err(Error::Config(ConfigError::InvalidInterval))
        ));
        assert!(!monitor.is_running());
        assert_eq!(monitor.handle_query(), UpsState::unknown());
    }
}
