//! Connection lifecycle and telemetry for one puck.
//!
//! A [`PuckSession`] owns exactly one [`GattTransport`] and everything
//! derived from it. `connect()` brings the link up and runs the setup
//! sequence; while connected, two background activities run scoped to the
//! connection's cancellation token: a notification pump feeding the gyro and
//! battery streams, and an RSSI poller on a fixed cadence. `disconnect()`
//! (or an unsolicited link drop) cancels both — background work never
//! outlives its connection.
//!
//! Telemetry is exposed as read-only observable views: `watch` receivers for
//! the scalar fields, where a new subscriber immediately sees the latest
//! value, and a `broadcast` receiver for the live gyro vectors. The battery
//! view is seeded by an explicit read at connect time and then kept current
//! by notifications, so subscribers never distinguish the two sources.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::WriteType;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{PuckError, Result};
use crate::protocol::{self, PuckCharacteristic};
use crate::transport::GattTransport;
use crate::types::{ConnectionState, Vector3};

/// Capacity of the gyro broadcast channel. A slow subscriber lags rather
/// than backpressuring the notification pump.
const GYRO_CHANNEL_CAPACITY: usize = 64;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cadence of the background signal-strength poll. Default: 5 seconds.
    pub rssi_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rssi_interval: Duration::from_secs(5),
        }
    }
}

/// Session manager for one puck: connection lifecycle, sampling
/// configuration, and live telemetry streams.
///
/// `connect()` is not guarded against concurrent invocation — two overlapping
/// calls issue two setup sequences. One caller per instance.
pub struct PuckSession {
    transport: Arc<dyn GattTransport>,
    rssi_interval: Duration,
    state_tx: watch::Sender<ConnectionState>,
    battery_tx: watch::Sender<Option<u8>>,
    rssi_tx: watch::Sender<Option<i16>>,
    period_tx: watch::Sender<Option<Duration>>,
    gyro_tx: broadcast::Sender<Vector3>,
    /// Cancellation token scoping the current connection's background work.
    /// `None` whenever no connection is active.
    link: Mutex<Option<CancellationToken>>,
}

impl PuckSession {
    pub fn new(transport: Arc<dyn GattTransport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (battery_tx, _) = watch::channel(None);
        let (rssi_tx, _) = watch::channel(None);
        let (period_tx, _) = watch::channel(None);
        let (gyro_tx, _) = broadcast::channel(GYRO_CHANNEL_CAPACITY);
        Self {
            transport,
            rssi_interval: config.rssi_interval,
            state_tx,
            battery_tx,
            rssi_tx,
            period_tx,
            gyro_tx,
            link: Mutex::new(None),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Bring the link up and run the setup sequence: read the battery level,
    /// read the current sampling period, enable the movement stream — in
    /// that order. On success the RSSI poller and notification pump start.
    ///
    /// Any failure tears the half-open link down (defensive transport
    /// disconnect included), leaves the session Disconnected, and re-raises
    /// the original error.
    ///
    /// The stream is enabled before the caller has a chance to write a
    /// custom period, so the device may briefly report at its power-on
    /// default rate until [`write_gyro_period`](Self::write_gyro_period) is
    /// called.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to puck");
        self.state_tx.send_replace(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => {
                self.state_tx.send_replace(ConnectionState::Connected);
                info!("Connected");
                Ok(())
            }
            Err(e) => {
                error!("Connection attempt failed: {e}");
                self.halt_background().await;
                if let Err(de) = self.transport.disconnect().await {
                    warn!("Disconnect after failed connect also failed: {de}");
                }
                self.state_tx.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.transport.connect().await?;

        // Setup sequence. Strictly ordered: enabling the stream before the
        // period is known would race the device's power-on default rate.
        self.read_battery_level().await?;
        self.read_gyro_period().await?;
        self.enable_gyro().await?;

        self.transport
            .subscribe(PuckCharacteristic::MovementData)
            .await?;
        self.transport
            .subscribe(PuckCharacteristic::BatteryLevel)
            .await?;

        let token = CancellationToken::new();
        {
            let mut link = self.link.lock().await;
            if let Some(stale) = link.take() {
                stale.cancel();
            }
            *link = Some(token.clone());
        }

        self.spawn_notification_pump(token.clone()).await?;
        self.spawn_link_watcher(token.clone());
        self.spawn_rssi_monitor(token);
        Ok(())
    }

    /// Release the transport link. Idempotent; background work scoped to the
    /// connection is cancelled before the transport is touched, so nothing
    /// leaks even if the release itself fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.state_tx.send_replace(ConnectionState::Disconnecting);
        self.halt_background().await;
        let released = self.transport.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        released
    }

    /// Cancel the current connection's background activities, if any.
    /// Safe to call at any point, including when setup never completed.
    async fn halt_background(&self) {
        if let Some(token) = self.link.lock().await.take() {
            token.cancel();
        }
    }

    // ── Background activities ─────────────────────────────────────────────────

    /// Decode inbound notifications into the gyro and battery streams. No
    /// blocking work happens in the delivery path — values are transformed
    /// and published, nothing more.
    async fn spawn_notification_pump(&self, token: CancellationToken) -> Result<()> {
        let mut notifications = self.transport.notifications().await?;
        let battery_tx = self.battery_tx.clone();
        let gyro_tx = self.gyro_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = notifications.next() => match next {
                        Some(n) if n.uuid == protocol::MOVEMENT_DATA_CHARACTERISTIC => {
                            match protocol::decode_vector3(&n.value) {
                                // A send error only means nobody is
                                // subscribed right now.
                                Ok(v) => { let _ = gyro_tx.send(v); }
                                Err(e) => warn!("Bad movement payload: {e}"),
                            }
                        }
                        Some(n) if n.uuid == protocol::BATTERY_LEVEL_CHARACTERISTIC => {
                            match protocol::decode_battery_level(&n.value) {
                                Ok(level) => { battery_tx.send_replace(Some(level)); }
                                Err(e) => warn!("Bad battery payload: {e}"),
                            }
                        }
                        Some(n) => debug!("Unhandled notification from {}", n.uuid),
                        None => {
                            info!("Notification stream ended");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Flip the session to Disconnected if the stack reports the link
    /// dropped out from under us.
    fn spawn_link_watcher(&self, token: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = transport.closed() => {
                    info!("Link dropped by peripheral");
                    token.cancel();
                    state_tx.send_replace(ConnectionState::Disconnected);
                }
            }
        });
    }

    /// Poll signal strength on a fixed cadence for the lifetime of the
    /// connection. The first poll fires immediately, so a value is available
    /// well within the first interval. Poll failures have no caller to
    /// surface to; they are logged and the cached value goes stale until the
    /// next success.
    fn spawn_rssi_monitor(&self, token: CancellationToken) {
        let transport = Arc::clone(&self.transport);
        let rssi_tx = self.rssi_tx.clone();
        let interval = self.rssi_interval;
        tokio::spawn(async move {
            loop {
                match transport.rssi().await {
                    Ok(rssi) => {
                        debug!("RSSI: {rssi}");
                        rssi_tx.send_replace(Some(rssi));
                    }
                    Err(e) => warn!("RSSI poll failed: {e}"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    // ── Peripheral accessors ──────────────────────────────────────────────────

    /// Validate, encode, and write a new sampling period.
    ///
    /// Out-of-range periods are rejected before any transport traffic. The
    /// cached period moves only after the write succeeds; a transport
    /// failure leaves the previous value untouched.
    pub async fn write_gyro_period(&self, period: Duration) -> Result<()> {
        let byte = protocol::encode_period(period)?;
        self.transport
            .write(
                PuckCharacteristic::MovementPeriod,
                &[byte],
                WriteType::WithResponse,
            )
            .await?;
        self.period_tx.send_replace(Some(period));
        Ok(())
    }

    /// Read the sampling period from the device, refresh the cache, and
    /// return it.
    pub async fn read_gyro_period(&self) -> Result<Duration> {
        let data = self
            .transport
            .read(PuckCharacteristic::MovementPeriod)
            .await?;
        let byte = *data.first().ok_or(PuckError::ShortPayload {
            expected: 1,
            actual: 0,
        })?;
        let period = protocol::decode_period(byte);
        self.period_tx.send_replace(Some(period));
        Ok(period)
    }

    /// Start the movement stream.
    pub async fn enable_gyro(&self) -> Result<()> {
        self.transport
            .write(
                PuckCharacteristic::MovementConfig,
                &protocol::GYRO_ENABLE,
                WriteType::WithResponse,
            )
            .await
    }

    /// Stop the movement stream.
    pub async fn disable_gyro(&self) -> Result<()> {
        self.transport
            .write(
                PuckCharacteristic::MovementConfig,
                &protocol::GYRO_DISABLE,
                WriteType::WithResponse,
            )
            .await
    }

    /// Read the battery percentage, refresh the cache, and return it.
    pub async fn read_battery_level(&self) -> Result<u8> {
        let data = self.transport.read(PuckCharacteristic::BatteryLevel).await?;
        let level = protocol::decode_battery_level(&data)?;
        self.battery_tx.send_replace(Some(level));
        Ok(level)
    }

    /// Query signal strength, refresh the cache, and return it.
    pub async fn read_rssi(&self) -> Result<i16> {
        let rssi = self.transport.rssi().await?;
        self.rssi_tx.send_replace(Some(rssi));
        Ok(rssi)
    }

    // ── Telemetry views ───────────────────────────────────────────────────────

    /// Observable connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Observable battery percentage (0–100). Seeded by the read at connect
    /// time and kept current by notifications; `None` until first seeded.
    pub fn battery(&self) -> watch::Receiver<Option<u8>> {
        self.battery_tx.subscribe()
    }

    /// Observable signal strength in dBm, refreshed by the background
    /// poller; `None` until the first poll completes.
    pub fn rssi(&self) -> watch::Receiver<Option<i16>> {
        self.rssi_tx.subscribe()
    }

    /// Observable sampling period, updated whenever written or read back;
    /// repeated queries cost no wire round-trip.
    pub fn period(&self) -> watch::Receiver<Option<Duration>> {
        self.period_tx.subscribe()
    }

    /// Live movement samples. Subscribing or dropping the receiver has no
    /// effect on the underlying connection.
    pub fn gyro(&self) -> broadcast::Receiver<Vector3> {
        self.gyro_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures::stream::BoxStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::Notification;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Connect,
        Disconnect,
        Read(PuckCharacteristic),
        Write(PuckCharacteristic, Vec<u8>),
        Subscribe(PuckCharacteristic),
        Rssi,
    }

    /// Scripted transport double: records every operation, serves canned
    /// payloads, and lets tests inject notifications and failures.
    struct RecordingTransport {
        ops: StdMutex<Vec<Op>>,
        battery_payload: Vec<u8>,
        period_payload: Vec<u8>,
        fail_connect: bool,
        fail_period_read: bool,
        fail_period_write: AtomicBool,
        notif_rx: StdMutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    }

    impl RecordingTransport {
        fn build(
            fail_connect: bool,
            fail_period_read: bool,
        ) -> (Arc<Self>, mpsc::UnboundedSender<Notification>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                ops: StdMutex::new(Vec::new()),
                battery_payload: vec![80],
                period_payload: vec![25], // 250 ms
                fail_connect,
                fail_period_read,
                fail_period_write: AtomicBool::new(false),
                notif_rx: StdMutex::new(Some(rx)),
            });
            (transport, tx)
        }

        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Notification>) {
            Self::build(false, false)
        }

        fn failing_connect() -> Arc<Self> {
            Self::build(true, false).0
        }

        fn failing_period_read() -> Arc<Self> {
            Self::build(false, true).0
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn rssi_polls(&self) -> usize {
            self.ops().iter().filter(|op| **op == Op::Rssi).count()
        }

        fn io_error() -> PuckError {
            PuckError::Transport(btleplug::Error::RuntimeError("scripted failure".into()))
        }
    }

    #[async_trait::async_trait]
    impl GattTransport for RecordingTransport {
        async fn connect(&self) -> Result<()> {
            self.ops.lock().unwrap().push(Op::Connect);
            if self.fail_connect {
                return Err(Self::io_error());
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.ops.lock().unwrap().push(Op::Disconnect);
            Ok(())
        }

        async fn read(&self, characteristic: PuckCharacteristic) -> Result<Vec<u8>> {
            self.ops.lock().unwrap().push(Op::Read(characteristic));
            match characteristic {
                PuckCharacteristic::BatteryLevel => Ok(self.battery_payload.clone()),
                PuckCharacteristic::MovementPeriod => {
                    if self.fail_period_read {
                        Err(Self::io_error())
                    } else {
                        Ok(self.period_payload.clone())
                    }
                }
                other => panic!("unexpected read of {other:?}"),
            }
        }

        async fn write(
            &self,
            characteristic: PuckCharacteristic,
            payload: &[u8],
            _mode: WriteType,
        ) -> Result<()> {
            if characteristic == PuckCharacteristic::MovementPeriod
                && self.fail_period_write.load(Ordering::SeqCst)
            {
                return Err(Self::io_error());
            }
            self.ops
                .lock()
                .unwrap()
                .push(Op::Write(characteristic, payload.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, characteristic: PuckCharacteristic) -> Result<()> {
            self.ops.lock().unwrap().push(Op::Subscribe(characteristic));
            Ok(())
        }

        async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
            match self.notif_rx.lock().unwrap().take() {
                Some(rx) => Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|n| (n, rx))
                }))),
                None => Ok(Box::pin(futures::stream::pending())),
            }
        }

        async fn rssi(&self) -> Result<i16> {
            self.ops.lock().unwrap().push(Op::Rssi);
            Ok(-60)
        }

        async fn closed(&self) {
            std::future::pending::<()>().await;
        }
    }

    fn session(transport: Arc<RecordingTransport>) -> PuckSession {
        PuckSession::new(transport, SessionConfig::default())
    }

    /// Let spawned tasks and paused-clock timers run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_runs_setup_sequence_in_order() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(Arc::clone(&transport));

        session.connect().await.unwrap();

        assert_eq!(
            transport.ops()[..6],
            [
                Op::Connect,
                Op::Read(PuckCharacteristic::BatteryLevel),
                Op::Read(PuckCharacteristic::MovementPeriod),
                Op::Write(
                    PuckCharacteristic::MovementConfig,
                    protocol::GYRO_ENABLE.to_vec()
                ),
                Op::Subscribe(PuckCharacteristic::MovementData),
                Op::Subscribe(PuckCharacteristic::BatteryLevel),
            ]
        );
        assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);

        // Setup seeded the caches.
        assert_eq!(*session.battery().borrow(), Some(80));
        assert_eq!(*session.period().borrow(), Some(Duration::from_millis(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn rssi_available_within_first_interval() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(transport);

        session.connect().await.unwrap();
        assert_eq!(*session.rssi().borrow(), None);

        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*session.rssi().borrow(), Some(-60));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_tears_down_and_surfaces_error() {
        let transport = RecordingTransport::failing_connect();
        let session = session(Arc::clone(&transport));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, PuckError::Transport(_)));
        assert_eq!(
            *session.connection_state().borrow(),
            ConnectionState::Disconnected
        );
        // Defensive disconnect released the transport.
        assert_eq!(transport.ops(), [Op::Connect, Op::Disconnect]);

        // No polling activity was left running.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.rssi_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_disconnects_transport() {
        let transport = RecordingTransport::failing_period_read();
        let session = session(Arc::clone(&transport));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, PuckError::Transport(_)));
        assert_eq!(
            *session.connection_state().borrow(),
            ConnectionState::Disconnected
        );
        assert_eq!(transport.ops().last(), Some(&Op::Disconnect));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.rssi_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn period_write_updates_cache_on_success_only() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(Arc::clone(&transport));
        session.connect().await.unwrap();

        session
            .write_gyro_period(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(*session.period().borrow(), Some(Duration::from_millis(500)));
        assert!(transport.ops().contains(&Op::Write(
            PuckCharacteristic::MovementPeriod,
            vec![50]
        )));

        // A failing write leaves the previous cached value untouched.
        transport.fail_period_write.store(true, Ordering::SeqCst);
        let err = session
            .write_gyro_period(Duration::from_millis(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, PuckError::Transport(_)));
        assert_eq!(*session.period().borrow(), Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_period_rejected_before_io() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(Arc::clone(&transport));

        let err = session
            .write_gyro_period(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PuckError::InvalidPeriod { .. }));
        // Nothing reached the transport.
        assert!(transport.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_rssi_polling() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(Arc::clone(&transport));
        session.connect().await.unwrap();

        // Polls at 0 s, 5 s, 10 s.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let polls_before = transport.rssi_polls();
        assert!(polls_before >= 2, "expected polls, saw {polls_before}");

        session.disconnect().await.unwrap();
        assert_eq!(
            *session.connection_state().borrow(),
            ConnectionState::Disconnected
        );
        assert_eq!(transport.ops().last(), Some(&Op::Disconnect));

        // No further polls after the connection ended.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.rssi_polls(), polls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_notification_supersedes_seed() {
        let (transport, notif) = RecordingTransport::new();
        let session = session(transport);
        session.connect().await.unwrap();

        // Seeded from the connect-time read.
        assert_eq!(*session.battery().borrow(), Some(80));

        notif
            .send(Notification {
                uuid: protocol::BATTERY_LEVEL_CHARACTERISTIC,
                value: vec![42],
            })
            .unwrap();
        settle().await;

        // Subscribers observe the notification without querying anything.
        assert_eq!(*session.battery().borrow(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn gyro_notifications_are_decoded_and_broadcast() {
        let (transport, notif) = RecordingTransport::new();
        let session = session(transport);
        session.connect().await.unwrap();

        let mut gyro = session.gyro();
        notif
            .send(Notification {
                uuid: protocol::MOVEMENT_DATA_CHARACTERISTIC,
                value: vec![1, 0, 2, 0, 3, 0],
            })
            .unwrap();

        let v = gyro.recv().await.unwrap();
        assert_eq!(v, Vector3 { x: 1.0, y: 2.0, z: 3.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn undersized_gyro_payload_is_dropped_not_broadcast() {
        let (transport, notif) = RecordingTransport::new();
        let session = session(transport);
        session.connect().await.unwrap();

        let mut gyro = session.gyro();
        notif
            .send(Notification {
                uuid: protocol::MOVEMENT_DATA_CHARACTERISTIC,
                value: vec![1, 0, 2],
            })
            .unwrap();
        notif
            .send(Notification {
                uuid: protocol::MOVEMENT_DATA_CHARACTERISTIC,
                value: vec![7, 0, 8, 0, 9, 0],
            })
            .unwrap();

        // The short payload produced nothing; the next good one came through.
        let v = gyro.recv().await.unwrap();
        assert_eq!(v, Vector3 { x: 7.0, y: 8.0, z: 9.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (transport, _notif) = RecordingTransport::new();
        let session = session(transport);

        // Never connected: still succeeds and ends Disconnected.
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(
            *session.connection_state().borrow(),
            ConnectionState::Disconnected
        );
    }
}
