use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info};

use crate::broadcast::{Broadcaster, Message};
use crate::error::{self, ConfigError, Error};
use crate::status::UpsState;
use crate::store::StateStore;
use crate::transition::should_fire;

/// One fetch, normalize, store, broadcast pass.
pub struct Cycle {
    store: Arc<StateStore>,
    broadcaster: Arc<dyn Broadcaster>,
    event: String,
}

impl Cycle {
    pub fn new(store: Arc<StateStore>, broadcaster: Arc<dyn Broadcaster>, event: impl Into<String>) -> Cycle {
        Cycle {
            store,
            broadcaster,
            event: event.into(),
        }
    }

    /// Runs the pipeline once and returns the new state. Never fails: an
    /// unreachable ups just produces the unknown state.
    pub fn run(&self) -> UpsState {
        let state = self.store.fetcher().fetch_state();
        debug!(?state, "Current state");

        let previous = self.store.update(state);
        self.broadcaster.publish(&Message::Snapshot(state));

        if should_fire(previous.as_ref(), &state) {
            info!(
                from = ?previous.map(|p| p.status),
                to = ?state.status,
                "Firing ups status change event"
            );
            self.broadcaster.publish(&Message::Transition {
                event: self.event.clone(),
                state,
            });
        }

        state
    }
}

/// Runs [`Cycle`]s on a background thread at a fixed interval.
///
/// The first cycle runs straight away; later ones start `interval` after the
/// previous one finished, so cycles never overlap. [`Poller::stop`] lets an
/// in-flight cycle finish and prevents any further ones.
pub struct Poller {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn start(cycle: Cycle, interval: Duration) -> error::Result<Poller> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidInterval.into());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("ups-poller".to_string())
            .spawn(move || run(cycle, interval, stop_rx))
            .map_err(Error::Spawn)?;

        info!(interval_secs = interval.as_secs_f64(), "Poller started");
        Ok(Poller {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stops future cycles and waits for the current one to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Poller thread panicked");
            }
            info!("Poller stopped");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(cycle: Cycle, interval: Duration, stop: mpsc::Receiver<()>) {
    loop {
        cycle.run();

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::broadcast::testing::Recorder;
    use crate::nut::NutError;
    use crate::status::{RawTelemetry, UpsStatus};
    use crate::ups::testing::{raw, GatedSource, ScriptedSource};
    use crate::ups::Fetcher;

    fn setup(replies: Vec<Result<RawTelemetry, NutError>>) -> (Arc<ScriptedSource>, Arc<Recorder>, Cycle) {
        let source = Arc::new(ScriptedSource::new(replies));
        let store = Arc::new(StateStore::new(Arc::new(Fetcher::new(source.clone()))));
        let recorder = Arc::new(Recorder::default());
        let cycle = Cycle::new(store, recorder.clone(), "ups_status_change");
        (source, recorder, cycle)
    }

    #[test]
    fn unreachable_twice_reports_unknown_without_transition() {
        let (_, recorder, cycle) = setup(vec![Err(NutError::Timeout), Err(NutError::Closed)]);

        assert_eq!(cycle.run(), UpsState::unknown());
        assert_eq!(cycle.run(), UpsState::unknown());

        assert_eq!(recorder.snapshots(), vec![UpsState::unknown(); 2]);
        assert!(recorder.transitions().is_empty());
    }

    #[test]
    fn online_to_battery_fires_once() {
        let (_, recorder, cycle) = setup(vec![
            Ok(raw(&[("ups.status", "OL"), ("battery.charge", "100")])),
            Ok(raw(&[("ups.status", "OB DISCHRG"), ("battery.charge", "99")])),
            Ok(raw(&[("ups.status", "OB DISCHRG"), ("battery.charge", "97")])),
        ]);

        cycle.run();
        cycle.run();
        cycle.run();

        let on_battery = UpsState::new(UpsStatus::OnBattery, 99, -1);
        assert_eq!(recorder.transitions(), vec![on_battery]);
        assert_eq!(recorder.snapshots().len(), 3);
    }

    #[test]
    fn snapshot_precedes_transition() {
        let (_, recorder, cycle) = setup(vec![
            Ok(raw(&[("ups.status", "OB")])),
            Ok(raw(&[("ups.status", "OL")])),
        ]);
        cycle.run();
        cycle.run();

        let messages = recorder.messages.lock().unwrap();
        let events: Vec<&str> = messages.iter().map(|m| m.event()).collect();
        assert_eq!(events, ["state", "state", "ups_status_change"]);
    }

    #[test]
    fn outage_between_flips_is_silent() {
        let (_, recorder, cycle) = setup(vec![
            Ok(raw(&[("ups.status", "OL")])),
            Err(NutError::Timeout),
            Ok(raw(&[("ups.status", "OL")])),
        ]);
        for _ in 0..3 {
            cycle.run();
        }
        assert!(recorder.transitions().is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (_, _, cycle) = setup(Vec::new());
        assert!(matches!(
            Poller::start(cycle, Duration::ZERO),
            Err(Error::Config(ConfigError::InvalidInterval))
        ));
    }

    #[test]
    fn polls_until_stopped() {
        let (source, recorder, cycle) = setup(Vec::new());
        let mut poller = Poller::start(cycle, Duration::from_millis(10)).unwrap();
        assert!(poller.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.requests() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        poller.stop();
        assert!(!poller.is_running());

        let polled = source.requests();
        assert!(polled >= 3);
        assert_eq!(recorder.snapshots().len(), polled);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(source.requests(), polled);

        // Stopping twice is harmless.
        poller.stop();
    }

    #[test]
    fn first_cycle_runs_immediately() {
        let (source, _, cycle) = setup(Vec::new());
        let mut poller = Poller::start(cycle, Duration::from_secs(3600)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.requests() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        poller.stop();
        assert_eq!(source.requests(), 1);
    }

    #[test]
    fn stop_lets_inflight_cycle_finish() {
        let (source, entered) = GatedSource::new(raw(&[("ups.status", "OB")]));
        let source = Arc::new(source);
        let store = Arc::new(StateStore::new(Arc::new(Fetcher::new(source.clone()))));
        store.update(UpsState::new(UpsStatus::Online, 100, -1));
        let recorder = Arc::new(Recorder::default());
        let cycle = Cycle::new(store, recorder.clone(), "ups_status_change");

        let mut poller = Poller::start(cycle, Duration::from_secs(3600)).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopping = thread::spawn(move || {
            poller.stop();
            poller
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!stopping.is_finished());
        assert!(recorder.snapshots().is_empty());

        source.release();
        let poller = stopping.join().unwrap();
        assert!(!poller.is_running());

        let on_battery = UpsState::new(UpsStatus::OnBattery, -1, -1);
        assert_eq!(recorder.snapshots(), vec![on_battery]);
        assert_eq!(recorder.transitions(), vec![on_battery]);
        assert_eq!(source.requests(), 1);
    }
}
