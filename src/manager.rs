use std::future::Future;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::engine::{Clock, LatestReading, OccupancySink, PresenceEngine, SystemClock};
use crate::messages::EngineCommand;
use crate::mqtt::MqttClient;

pub struct Manager {
    engine: PresenceEngine<SystemClock, MqttClient>,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    tick_interval: Duration,
}

impl Manager {
    pub fn new(
        engine: PresenceEngine<SystemClock, MqttClient>,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
        tick_interval: Duration,
    ) -> Self {
        Manager {
            engine,
            mqtt_client,
            mqtt_event_loop,
            tick_interval,
        }
    }

    pub async fn run_loop(self) -> Result<(), rumqttc::ClientError> {
        let Manager {
            mut engine,
            mqtt_client,
            mut mqtt_event_loop,
            tick_interval,
        } = self;

        let (tx, rx) = broadcast::channel(64);

        // Handle incoming MQTT messages (energy readings and calibration)
        let event_client = mqtt_client.clone();
        tokio::task::spawn(async move {
            event_client.event_loop(&mut mqtt_event_loop, tx).await;
        });

        let mut latest = LatestReading::default();
        engine.initialize();
        drive(&mut engine, &mut latest, rx, tick_interval, shutdown_signal()).await;
        info!("Exiting manager event loop");

        mqtt_client.disconnect().await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(err) => {
            error!("Unable to listen for Ctrl-C: {:?}", err);
            std::future::pending::<()>().await;
        }
    }
}

/// Runs the engine until `shutdown` resolves or the command channel closes.
///
/// A due tick is served before pending commands, so a burst of readings can't
/// hold off debounce evaluation. The interval skips missed ticks, which keeps
/// the command channel from starving in turn.
async fn drive<C, O>(
    engine: &mut PresenceEngine<C, O>,
    latest: &mut LatestReading,
    mut rx: broadcast::Receiver<EngineCommand>,
    tick_interval: Duration,
    shutdown: impl Future<Output = ()>,
) where
    C: Clock,
    O: OccupancySink,
{
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Some(transition) = engine.tick(&*latest) {
                    if transition.from.is_occupied() != transition.to.is_occupied() {
                        info!("Bed is now {}", transition.to);
                    }
                }
            }
            msg = rx.recv() => match msg {
                Ok(command) => apply_command(engine, latest, command),
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Command channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Command receiver lagged, skipped {} messages", skipped);
                }
            },
        }
    }

    // Nothing is persisted, so leave the last calibration in the log.
    info!(
        "Stopping in state {} with {:?} and {:?}",
        engine.state(),
        engine.thresholds(),
        engine.debounce_durations()
    );
}

fn apply_command<C, O>(
    engine: &mut PresenceEngine<C, O>,
    latest: &mut LatestReading,
    command: EngineCommand,
) where
    C: Clock,
    O: OccupancySink,
{
    match command {
        EngineCommand::Energy(energy) => latest.update(energy),
        EngineCommand::UpdateThresholds { occupied, vacant } => {
            engine.update_thresholds(occupied, vacant);
            let thresholds = engine.thresholds();
            if thresholds.vacant >= thresholds.occupied {
                warn!(
                    "Vacant threshold {} is not below occupied threshold {}; hysteresis is disabled",
                    thresholds.vacant, thresholds.occupied
                );
            }
        }
        EngineCommand::UpdateDebounce {
            occupied_ms,
            vacant_ms,
        } => engine.update_debounce_durations(occupied_ms, vacant_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DebounceDurations, EnergySource, PresenceState, Thresholds};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Published(Rc<RefCell<Vec<bool>>>);

    impl OccupancySink for Published {
        fn publish_occupancy(&self, occupied: bool) {
            self.0.borrow_mut().push(occupied);
        }
    }

    fn instant_engine(published: &Published) -> PresenceEngine<SystemClock, Published> {
        let mut engine = PresenceEngine::new(SystemClock::new(), published.clone())
            .with_debounce_durations(DebounceDurations {
                occupied_ms: 0,
                vacant_ms: 0,
            });
        engine.initialize();
        engine
    }

    #[tokio::test]
    async fn test_calibration_commands_update_engine() {
        let published = Published::default();
        let mut engine = instant_engine(&published);
        let (tx, rx) = broadcast::channel(8);

        tx.send(EngineCommand::UpdateThresholds {
            occupied: 70,
            vacant: 10,
        })
        .unwrap();
        tx.send(EngineCommand::UpdateDebounce {
            occupied_ms: 1000,
            vacant_ms: 9000,
        })
        .unwrap();
        drop(tx);

        drive(
            &mut engine,
            &mut LatestReading::default(),
            rx,
            Duration::from_secs(60),
            std::future::pending::<()>(),
        )
        .await;

        assert_eq!(
            engine.thresholds(),
            Thresholds {
                occupied: 70,
                vacant: 10
            }
        );
        assert_eq!(
            engine.debounce_durations(),
            DebounceDurations {
                occupied_ms: 1000,
                vacant_ms: 9000
            }
        );
        assert_eq!(engine.state(), PresenceState::Vacant);
    }

    #[tokio::test]
    async fn test_ticks_feed_latest_reading() {
        let published = Published::default();
        let mut engine = instant_engine(&published);
        let (tx, rx) = broadcast::channel(8);

        tx.send(EngineCommand::Energy(80.0)).unwrap();

        drive(
            &mut engine,
            &mut LatestReading::default(),
            rx,
            Duration::from_millis(1),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;

        assert_eq!(engine.state(), PresenceState::Occupied);
        assert_eq!(*published.0.borrow(), vec![false, true]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_due_tick_runs_before_queued_commands() {
        let published = Published::default();
        let mut engine = instant_engine(&published);
        let mut latest = LatestReading::default();
        latest.update(80.0);
        let (tx, rx) = broadcast::channel(64);

        // The first tick is due immediately, alongside a queue of low readings.
        for _ in 0..32 {
            tx.send(EngineCommand::Energy(0.0)).unwrap();
        }
        drop(tx);

        drive(
            &mut engine,
            &mut latest,
            rx,
            Duration::from_secs(60),
            std::future::pending::<()>(),
        )
        .await;

        assert_eq!(engine.state(), PresenceState::DebouncingOccupied);
        assert_eq!(latest.reading(), 0.0);
    }

    #[test]
    fn test_inverted_calibration_is_still_applied() {
        let published = Published::default();
        let mut engine = instant_engine(&published);
        let mut latest = LatestReading::default();

        apply_command(
            &mut engine,
            &mut latest,
            EngineCommand::UpdateThresholds {
                occupied: 20,
                vacant: 40,
            },
        );
        assert_eq!(
            engine.thresholds(),
            Thresholds {
                occupied: 20,
                vacant: 40
            }
        );
        assert!(!latest.has_reading());
    }

    #[tokio::test]
    async fn test_ticks_without_reading_hold_state() {
        let published = Published::default();
        let mut engine = instant_engine(&published);
        let (tx, rx) = broadcast::channel::<EngineCommand>(8);

        drive(
            &mut engine,
            &mut LatestReading::default(),
            rx,
            Duration::from_millis(1),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;

        assert_eq!(engine.state(), PresenceState::Vacant);
        assert_eq!(*published.0.borrow(), vec![false]);
        drop(tx);
    }
}
