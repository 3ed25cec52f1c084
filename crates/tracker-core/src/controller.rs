// Bike Tracker - Wake/Sleep Controller
//
// One `Tracker` per boot.  `boot` decides what kind of session this wake is,
// `tick` runs one loop iteration:
//
//   1. apply every queued link event (connect/disconnect, BLE writes)
//   2. sample motion and presence
//   3. recompute the device mode
//   4. connected: notify status changes; disconnected: alert if due
//   5. decide whether to sleep, and how
//
// The firmware owns the radios and the sleep call; it only acts on the
// `TickReport` this returns.

use log::{info, warn};

use crate::alert::{self, AlertContext, Alerter, Delivery};
use crate::events::{LinkEvent, Notification};
use crate::history::{FixHistory, FixSource, DEFAULT_CAPACITY};
use crate::mode::{DeviceMode, ModeInputs};
use crate::modem::{AtChannel, CellModem};
use crate::motion::{Accelerometer, MotionDetector};
use crate::position::{PositionFix, Positioning};
use crate::presence::{PresenceDebouncer, RangeSensor};
use crate::protocol::{self, Command, ConfigWrite, StatusNotifier, StatusSnapshot};
use crate::retained::CrossSleepState;
use crate::settings::Configuration;
use crate::store::KvStore;
use crate::tuning::Tuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    ColdBoot,
    /// Accelerometer interrupt on the wake GPIO.
    Motion,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Normal,
    /// Woken by motion; the alert waits for the reconnect grace window.
    MotionWake,
    /// Timer wake after an alert: report again and go back to sleep.
    AlertRetry,
}

impl Session {
    pub fn starts_ble(self) -> bool {
        self != Session::AlertRetry
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SleepPlan {
    /// Deep sleep until the accelerometer wake interrupt fires.
    MotionOnly { threshold_g: f32 },
    /// Deep sleep for a fixed time; the next wake reports again.
    Timer { seconds: u32 },
}

#[derive(Debug, Default)]
pub struct TickReport {
    /// To be written to the matching characteristic, in order.
    pub notifications: Vec<Notification>,
    pub sleep: Option<SleepPlan>,
}

/// The peripherals a tracker drives.
pub struct Hardware<S, A, R, C> {
    pub store: S,
    pub accelerometer: A,
    pub range_sensor: R,
    pub modem: C,
}

pub struct Tracker<S, A, R, C>
where
    S: KvStore,
    A: Accelerometer,
    R: RangeSensor,
    C: AtChannel,
{
    tuning: Tuning,
    store: S,
    accelerometer: A,
    range_sensor: R,
    modem: CellModem<C>,

    config: Configuration,
    retained: CrossSleepState,
    history: FixHistory,
    current_fix: Option<PositionFix>,

    motion: MotionDetector,
    presence: PresenceDebouncer,
    positioning: Positioning,
    alerter: Alerter,
    notifier: StatusNotifier,

    session: Session,
    mode: DeviceMode,
    link: bool,
    boot_ms: u64,
    quiet_since_ms: u64,
    alert_not_before_ms: u64,
    retry_done: bool,
    failed_alerts: u32,
    /// The stored fix predates this power cycle; the wall clock restarted
    /// since, so its age cannot be known.
    stored_fix_undated: bool,
    test_sms_requested: bool,
    sync_on_connect: bool,
}

impl<S, A, R, C> Tracker<S, A, R, C>
where
    S: KvStore,
    A: Accelerometer,
    R: RangeSensor,
    C: AtChannel,
{
    /// Restore persistent state and classify this wake.  `saved` is the
    /// decoded RTC image; it is ignored on a cold boot.
    pub fn boot(
        hardware: Hardware<S, A, R, C>,
        tuning: Tuning,
        cause: WakeCause,
        saved: Option<CrossSleepState>,
        now_ms: u64,
    ) -> Self {
        let Hardware {
            store,
            accelerometer,
            range_sensor,
            modem,
        } = hardware;

        let config = Configuration::load(&store);
        let history = FixHistory::load(&store, DEFAULT_CAPACITY);
        let current_fix = PositionFix::load(&store).unwrap_or_else(|e| {
            warn!("Stored fix unreadable: {e:#}");
            None
        });

        let mut retained = match cause {
            WakeCause::ColdBoot => CrossSleepState::default(),
            WakeCause::Motion | WakeCause::Timer => saved.unwrap_or_else(|| {
                warn!("RTC state lost across sleep, starting from defaults");
                CrossSleepState::default()
            }),
        };

        let session = match cause {
            WakeCause::ColdBoot => Session::Normal,
            WakeCause::Timer if retained.already_alerted => Session::AlertRetry,
            WakeCause::Motion | WakeCause::Timer => {
                retained.pending_motion_alert = true;
                Session::MotionWake
            }
        };
        info!(
            "Wake cause {cause:?}, session {session:?}, {} logged fixes",
            history.len()
        );

        let stored_fix_undated = cause == WakeCause::ColdBoot && current_fix.is_some();

        let mut modem = CellModem::new(modem);
        if session == Session::MotionWake {
            if let Err(e) = modem.init() {
                warn!("Modem not primed: {e:#}");
            }
        }

        // Give the phone a chance to (re)connect before alerting.
        let alert_not_before_ms = match session {
            Session::AlertRetry => now_ms,
            Session::Normal | Session::MotionWake => now_ms + tuning.reconnect_grace_ms,
        };

        Self {
            motion: MotionDetector::new(&tuning, config.motion_sensitivity),
            presence: PresenceDebouncer::new(&tuning),
            positioning: Positioning::new(&tuning),
            alerter: Alerter::new(&tuning),
            notifier: StatusNotifier::new(&tuning),
            tuning,
            store,
            accelerometer,
            range_sensor,
            modem,
            config,
            retained,
            history,
            current_fix,
            session,
            mode: DeviceMode::Disconnected,
            link: false,
            boot_ms: now_ms,
            quiet_since_ms: now_ms,
            alert_not_before_ms,
            retry_done: false,
            failed_alerts: 0,
            stored_fix_undated,
            test_sms_requested: false,
            sync_on_connect: false,
        }
    }

    // ---- accessors --------------------------------------------------------

    pub fn session(&self) -> Session {
        self.session
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// What must be written back to RTC memory before sleeping.
    pub fn retained(&self) -> CrossSleepState {
        self.retained
    }

    pub fn current_fix(&self) -> Option<&PositionFix> {
        self.current_fix.as_ref()
    }

    pub fn history(&self) -> &FixHistory {
        &self.history
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn modem(&self) -> &CellModem<C> {
        &self.modem
    }

    pub fn modem_mut(&mut self) -> &mut CellModem<C> {
        &mut self.modem
    }

    pub fn accelerometer_mut(&mut self) -> &mut A {
        &mut self.accelerometer
    }

    pub fn range_sensor_mut(&mut self) -> &mut R {
        &mut self.range_sensor
    }

    // ---- loop -------------------------------------------------------------

    pub fn tick(&mut self, events: impl IntoIterator<Item = LinkEvent>, now_ms: u64) -> TickReport {
        let mut report = TickReport::default();

        for event in events {
            self.handle_event(event, now_ms, &mut report);
        }

        self.sense(now_ms);
        self.update_mode();

        if self.mode.is_connected() {
            self.connected_tick(now_ms, &mut report);
            return report;
        }

        if self.alert_due(now_ms) {
            if let Some(plan) = self.alert_path(now_ms) {
                report.sleep = Some(plan);
                return report;
            }
        }

        if self.retained.already_alerted {
            report.sleep = Some(self.prepare_sleep(now_ms));
        } else if self.is_idle(now_ms) {
            info!("Idle for {} ms, going to sleep", self.tuning.idle_sleep_ms);
            report.sleep = Some(self.prepare_sleep(now_ms));
        }
        report
    }

    fn mode_inputs(&self) -> ModeInputs {
        ModeInputs {
            link: self.link,
            moving: self.motion.is_moving(),
            present: self.presence.is_present(),
            alerted: self.retained.already_alerted,
            pending: self.retained.pending_motion_alert,
        }
    }

    fn update_mode(&mut self) {
        self.mode = self.mode.next(self.mode_inputs());
    }

    fn sense(&mut self, now_ms: u64) {
        match self.accelerometer.read_sample() {
            Ok(Some(sample)) => {
                self.motion.update(sample, now_ms);
            }
            Ok(None) => {}
            Err(e) => warn!("Accelerometer read failed: {e:#}"),
        }
        self.presence.poll(&mut self.range_sensor, now_ms);
    }

    fn is_idle(&self, now_ms: u64) -> bool {
        let idle = self.tuning.idle_sleep_ms;
        self.mode == DeviceMode::Disconnected
            && !self.motion.is_moving()
            && self.motion.ms_since_motion(now_ms) >= idle
            && now_ms.saturating_sub(self.quiet_since_ms) >= idle
    }

    // ---- link events ------------------------------------------------------

    fn handle_event(&mut self, event: LinkEvent, now_ms: u64, report: &mut TickReport) {
        match event {
            LinkEvent::Connected => {
                info!("Companion connected");
                self.link = true;
                self.failed_alerts = 0;
                if self.session == Session::AlertRetry {
                    self.retained.pending_motion_alert = false;
                    self.retained.consecutive_cached_fixes = 0;
                } else {
                    self.retained.end_episode();
                }
                self.sync_on_connect = true;
            }
            LinkEvent::Disconnected => {
                if self.link {
                    info!("Companion disconnected");
                }
                self.link = false;
                self.quiet_since_ms = now_ms;
                self.alert_not_before_ms = now_ms + self.tuning.reconnect_grace_ms;
            }
            LinkEvent::ConfigWritten(bytes) => self.handle_config(&bytes),
            LinkEvent::CommandReceived(bytes) => match protocol::parse_command(&bytes) {
                Ok(command) => self.handle_command(command, report),
                Err(e) => warn!("Command rejected: {e:#}"),
            },
            LinkEvent::LocationWritten(bytes) => match protocol::decode_location(&bytes) {
                Ok(location) => self.record_fix(location.into_fix(now_ms), FixSource::Phone),
                Err(e) => warn!("Location rejected: {e:#}"),
            },
        }
    }

    fn handle_config(&mut self, bytes: &[u8]) {
        let changed = match protocol::decode_config(bytes) {
            Ok(ConfigWrite::Clear) => {
                info!("Configuration cleared");
                self.retained.end_episode();
                let cleared = Configuration::default();
                let changed = self.config != cleared;
                self.config = cleared;
                changed
            }
            Ok(ConfigWrite::Update { updates, rejected }) => {
                if !rejected.is_empty() {
                    warn!("Config write: rejected {}", rejected.join(", "));
                }
                self.config.apply(&updates)
            }
            Err(e) => {
                warn!("Config write ignored: {e:#}");
                false
            }
        };

        if changed {
            if let Err(e) = self.config.save(&mut self.store) {
                warn!("Persisting configuration failed: {e:#}");
            }
            self.motion
                .set_threshold(self.tuning.motion_detect.threshold_g(self.config.motion_sensitivity));
        }
    }

    fn handle_command(&mut self, command: Command, report: &mut TickReport) {
        let json = match command {
            Command::Sync => self.history_push(),
            Command::Page(page) => {
                protocol::history_page_json(&self.history, &self.store, page, self.tuning.history_page_len)
            }
            Command::ClearHistory => {
                info!("Clearing fix history");
                if let Err(e) = self.history.clear(&mut self.store) {
                    warn!("Clearing history failed: {e:#}");
                }
                self.history_push()
            }
            Command::TestSms => {
                self.test_sms_requested = true;
                return;
            }
        };
        match json {
            Ok(json) => report.notifications.push(Notification::History(json)),
            Err(e) => warn!("History read failed: {e:#}"),
        }
    }

    fn history_push(&self) -> anyhow::Result<String> {
        protocol::history_push_json(&self.history, &self.store, self.tuning.history_push_len)
    }

    fn record_fix(&mut self, fix: PositionFix, source: FixSource) {
        info!("Fix from {source:?}: {}, {}", fix.lat_str(), fix.lon_str());
        if let Err(e) = fix.save(&mut self.store) {
            warn!("Persisting fix failed: {e:#}");
        }
        if let Err(e) = self.history.append_fix(&mut self.store, &fix, source) {
            warn!("Logging fix failed: {e:#}");
        }
        self.current_fix = Some(fix);
        self.stored_fix_undated = false;
    }

    // ---- connected --------------------------------------------------------

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::new(
            &self.config,
            self.link,
            self.presence.is_present(),
            self.motion.is_moving(),
            self.mode,
            self.current_fix.as_ref(),
        )
    }

    fn connected_tick(&mut self, now_ms: u64, report: &mut TickReport) {
        if self.test_sms_requested {
            self.test_sms_requested = false;
            self.send_test_sms(now_ms);
        }

        let snapshot = self.snapshot();
        let status = if self.sync_on_connect {
            self.notifier.force(snapshot).map(Some)
        } else {
            self.notifier.offer(snapshot)
        };
        match status {
            Ok(Some(json)) => report.notifications.push(Notification::Status(json)),
            Ok(None) => {}
            Err(e) => warn!("Status encode failed: {e:#}"),
        }

        if std::mem::take(&mut self.sync_on_connect) {
            match self.history_push() {
                Ok(json) => report.notifications.push(Notification::History(json)),
                Err(e) => warn!("History read failed: {e:#}"),
            }
        }
    }

    fn send_test_sms(&mut self, now_ms: u64) {
        if !self.config.phone_configured() {
            warn!("Test SMS requested without a phone number");
            return;
        }
        let message = alert::test_message(now_ms.saturating_sub(self.boot_ms) / 1_000);
        let delivery = self
            .alerter
            .dispatch(&mut self.modem, &self.config.phone_number, &[message]);
        info!("Test SMS: {delivery:?}");
    }

    // ---- disconnected -----------------------------------------------------

    fn alert_due(&self, now_ms: u64) -> bool {
        match self.session {
            Session::AlertRetry => !self.retry_done,
            Session::Normal | Session::MotionWake => {
                self.mode == DeviceMode::Alert && now_ms >= self.alert_not_before_ms
            }
        }
    }

    /// Run one alert.  Returns the sleep plan when the session is over.
    fn alert_path(&mut self, now_ms: u64) -> Option<SleepPlan> {
        if !self.config.can_alert() {
            if self.retained.pending_motion_alert || self.session == Session::AlertRetry {
                info!("Alerts disabled or no phone number, dropping alert");
            }
            self.retained.pending_motion_alert = false;
            if self.session == Session::AlertRetry {
                self.retained.end_episode();
                self.retry_done = true;
                return Some(self.prepare_sleep(now_ms));
            }
            self.update_mode();
            return None;
        }

        info!("Alert: locating and sending SMS");
        let acquired = self
            .positioning
            .acquire(&mut self.modem, &mut self.store, &mut self.history, now_ms);
        let stored = self.current_fix.clone();
        let stored_dated = !self.stored_fix_undated;
        if let Some(fix) = &acquired {
            self.current_fix = Some(fix.clone());
            self.stored_fix_undated = false;
        }
        let outcome = self
            .positioning
            .classify(acquired, stored, stored_dated, now_ms, &mut self.retained);

        let messages = alert::compose(
            &outcome,
            &AlertContext {
                user_present: self.presence.is_present(),
                interval_s: self.config.report_interval_s,
                now_ms,
                last_known_dated: stored_dated,
            },
        );
        let delivery = self
            .alerter
            .dispatch(&mut self.modem, &self.config.phone_number, &messages);

        if delivery != Delivery::Failed {
            self.retained.already_alerted = true;
            self.retained.last_alert_ms = now_ms;
            self.retained.pending_motion_alert = false;
        }
        self.update_mode();

        match self.session {
            Session::AlertRetry => {
                self.retry_done = true;
                Some(self.prepare_sleep(now_ms))
            }
            _ if delivery.delivered() => Some(self.prepare_sleep(now_ms)),
            _ => {
                self.failed_alerts += 1;
                if self.failed_alerts >= self.tuning.alert_session_attempts {
                    warn!(
                        "Alert failed {} times, retrying after {} s of sleep",
                        self.failed_alerts, self.config.report_interval_s
                    );
                    self.retained.pending_motion_alert = true;
                    return Some(self.prepare_sleep(now_ms));
                }
                warn!("Alert failed, retrying in {} ms", self.tuning.alert_backoff_ms);
                self.alert_not_before_ms = now_ms + self.tuning.alert_backoff_ms;
                None
            }
        }
    }

    // ---- sleep ------------------------------------------------------------

    fn power_down_modem(&mut self) {
        let state = self.modem.rf_state();
        if state.gnss_powered {
            if let Err(e) = self.modem.disable_gnss() {
                warn!("GNSS power-off before sleep failed: {e:#}");
            }
        }
        if state.rf_ready {
            if let Err(e) = self.modem.disable_rf() {
                warn!("RF power-off before sleep failed: {e:#}");
            }
        }
    }

    /// Pick the sleep mode and get the hardware ready for it.
    fn prepare_sleep(&mut self, now_ms: u64) -> SleepPlan {
        self.power_down_modem();
        let timer = SleepPlan::Timer {
            seconds: self.config.report_interval_s,
        };

        if self.retained.already_alerted || self.retained.pending_motion_alert {
            info!("Sleeping for {} s until the next report", self.config.report_interval_s);
            return timer;
        }

        let threshold_g = self
            .tuning
            .motion_wake
            .threshold_g(self.config.motion_sensitivity);
        // Reprogramming the wake engine can itself latch an event.
        let armed = self
            .accelerometer
            .clear_latched()
            .and_then(|_| self.accelerometer.arm_wake(threshold_g))
            .and_then(|_| self.accelerometer.clear_latched());
        match armed {
            Ok(()) => {
                self.retained.motion_sensor_ready = true;
                self.motion.reset(now_ms);
                info!("Sleeping until motion above {threshold_g:.3} g");
                SleepPlan::MotionOnly { threshold_g }
            }
            Err(e) => {
                warn!("Wake interrupt not armed ({e:#}), falling back to timer wake");
                self.retained.motion_sensor_ready = false;
                timer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::RfState;
    use crate::store::MemoryStore;
    use crate::testing::{ScriptedAccel, ScriptedModem, ScriptedRange, WakeCall};

    type TestTracker = Tracker<MemoryStore, ScriptedAccel, ScriptedRange, ScriptedModem>;

    const GOOD: &str = "+CGNSINF: 1,1,20240301120000.000,52.520008,13.404954,34.5,12.40,87.0,0\r\nOK";
    const PHONE: &str = "+15550001";

    fn configured_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        Configuration {
            phone_number: PHONE.into(),
            ..Configuration::default()
        }
        .save(&mut store)
        .unwrap();
        store
    }

    fn boot_with(
        store: MemoryStore,
        modem: ScriptedModem,
        cause: WakeCause,
        saved: Option<CrossSleepState>,
    ) -> TestTracker {
        let tuning = Tuning {
            fix_attempts: 3,
            ..Tuning::default()
        };
        Tracker::boot(
            Hardware {
                store,
                accelerometer: ScriptedAccel::new(),
                range_sensor: ScriptedRange::far(),
                modem,
            },
            tuning,
            cause,
            saved,
            0,
        )
    }

    fn boot(cause: WakeCause, saved: Option<CrossSleepState>) -> TestTracker {
        boot_with(configured_store(), ScriptedModem::new(), cause, saved)
    }

    fn alerted() -> CrossSleepState {
        CrossSleepState {
            already_alerted: true,
            motion_sensor_ready: true,
            ..CrossSleepState::default()
        }
    }

    fn no_events() -> Vec<LinkEvent> {
        Vec::new()
    }

    #[test]
    fn cold_boot_discards_rtc_state() {
        let t = boot(WakeCause::ColdBoot, Some(alerted()));
        assert_eq!(t.session(), Session::Normal);
        assert_eq!(t.retained(), CrossSleepState::default());
    }

    #[test]
    fn timer_wake_after_alert_skips_ble() {
        let t = boot(WakeCause::Timer, Some(alerted()));
        assert_eq!(t.session(), Session::AlertRetry);
        assert!(!t.session().starts_ble());

        let t = boot(WakeCause::Timer, Some(CrossSleepState::default()));
        assert_eq!(t.session(), Session::MotionWake);
        assert!(t.retained().pending_motion_alert);
    }

    #[test]
    fn still_and_disconnected_sleeps_on_motion_after_idle_window() {
        let mut t = boot(WakeCause::ColdBoot, None);
        assert!(t.tick(no_events(), 0).sleep.is_none());
        assert!(t.tick(no_events(), 9_000).sleep.is_none());

        let plan = t.tick(no_events(), 10_000).sleep;
        let expected = Tuning::default().motion_wake.threshold_g(0.5);
        assert_eq!(plan, Some(SleepPlan::MotionOnly { threshold_g: expected }));
        assert_eq!(
            t.accelerometer_mut().wake_calls,
            vec![WakeCall::Clear, WakeCall::Arm(expected), WakeCall::Clear]
        );
        assert!(t.retained().motion_sensor_ready);
        assert!(!t.modem().rf_state().rf_ready);
    }

    #[test]
    fn never_sleeps_while_connected() {
        let mut t = boot(WakeCause::ColdBoot, None);
        t.tick([LinkEvent::Connected], 0);
        for now in [10_000, 60_000, 600_000] {
            assert!(t.tick(no_events(), now).sleep.is_none());
        }
        assert_eq!(t.mode(), DeviceMode::Away);
    }

    #[test]
    fn mode_follows_link_motion_and_presence() {
        let mut t = boot(WakeCause::ColdBoot, None);
        t.range_sensor_mut().distance_mm = 300;
        t.tick([LinkEvent::Connected], 0);
        assert_eq!(t.mode(), DeviceMode::LinkReady);

        t.range_sensor_mut().distance_mm = 2_000;
        t.tick(no_events(), 100);
        t.tick(no_events(), 400);
        assert_eq!(t.mode(), DeviceMode::Away);

        t.accelerometer_mut().shake(4);
        t.tick([LinkEvent::Disconnected], 500);
        t.tick(no_events(), 520);
        assert_eq!(t.mode(), DeviceMode::Alert);
    }

    #[test]
    fn accelerometer_errors_keep_motion_state() {
        let mut t = boot(WakeCause::ColdBoot, None);
        t.tick(no_events(), 0);
        t.accelerometer_mut().shake(1);
        t.tick(no_events(), 10);
        assert_eq!(t.mode(), DeviceMode::Alert);

        t.accelerometer_mut().fail_reads = true;
        assert!(t.tick(no_events(), 5_000).sleep.is_none());
        assert_eq!(t.mode(), DeviceMode::Alert);
    }

    #[test]
    fn connect_forces_status_and_pushes_history() {
        let mut t = boot(WakeCause::ColdBoot, None);
        let report = t.tick([LinkEvent::Connected], 0);

        assert!(matches!(report.notifications[0], Notification::Status(_)));
        assert!(matches!(report.notifications[1], Notification::History(_)));

        // Nothing changed: no churn.
        assert!(t.tick(no_events(), 100).notifications.is_empty());
    }

    #[test]
    fn motion_wake_waits_for_reconnect_grace() {
        let mut t = boot(WakeCause::Motion, Some(CrossSleepState::default()));
        t.tick(no_events(), 0);
        assert_eq!(t.mode(), DeviceMode::Alert);
        assert!(t.tick(no_events(), 5_000).sleep.is_none());

        // Owner's phone comes back inside the window: no SMS, episode over.
        t.tick([LinkEvent::Connected], 6_000);
        assert!(!t.retained().pending_motion_alert);
        assert!(t.modem_mut().channel_mut().messages().is_empty());
    }

    #[test]
    fn motion_wake_alerts_after_grace_then_sleeps_on_timer() {
        let mut modem = ScriptedModem::new();
        modem.gnss_responses([GOOD]);
        let mut t = boot_with(configured_store(), modem, WakeCause::Motion, Some(CrossSleepState::default()));

        assert!(t.tick(no_events(), 1_000).sleep.is_none());
        let plan = t.tick(no_events(), 20_000).sleep;

        assert_eq!(plan, Some(SleepPlan::Timer { seconds: 300 }));
        let messages = t.modem_mut().channel_mut().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "geo:52.520008,13.404954");
        assert!(messages[1].contains("tampering"));

        let state = t.retained();
        assert!(state.already_alerted);
        assert!(!state.pending_motion_alert);
        assert_eq!(state.last_alert_ms, 20_000);
        assert_eq!(t.mode(), DeviceMode::Reporting);
        assert_eq!(t.history().len(), 1);
    }

    #[test]
    fn gnss_and_cellular_rf_never_overlap_during_an_alert() {
        let mut modem = ScriptedModem::new();
        modem.gnss_responses([GOOD]);
        let mut t = boot_with(configured_store(), modem, WakeCause::Motion, Some(CrossSleepState::default()));
        t.tick(no_events(), 20_000);

        assert!(t.modem().rf_trace().all(RfState::is_consistent));
        let sent = t.modem_mut().channel_mut().sent_lines();
        let gnss_on = sent.iter().position(|l| l == "AT+CGNSPWR=1").unwrap();
        let gnss_off = sent.iter().position(|l| l == "AT+CGNSPWR=0").unwrap();
        let rf_on = sent.iter().position(|l| l == "AT+CFUN=1").unwrap();
        let first_sms = sent.iter().position(|l| l.starts_with("AT+CMGS=")).unwrap();
        assert!(gnss_on < gnss_off && gnss_off < rf_on && rf_on < first_sms);
        assert_eq!(sent.last().map(String::as_str), Some("AT+CFUN=0"));
    }

    #[test]
    fn alert_retry_session_reports_and_sleeps_again() {
        let mut t = boot(WakeCause::Timer, Some(alerted()));
        let plan = t.tick(no_events(), 0).sleep;

        assert_eq!(plan, Some(SleepPlan::Timer { seconds: 300 }));
        // No fix ever: a single "never acquired" message.
        let messages = t.modem_mut().channel_mut().messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("never acquired"));
        assert!(t.retained().already_alerted);
    }

    #[test]
    fn failed_retry_session_still_sleeps() {
        let mut modem = ScriptedModem::new();
        modem.sms_results([false, false, false]);
        let mut t = boot_with(configured_store(), modem, WakeCause::Timer, Some(alerted()));

        assert_eq!(t.tick(no_events(), 0).sleep, Some(SleepPlan::Timer { seconds: 300 }));
        assert!(t.retained().already_alerted);
    }

    #[test]
    fn failed_first_alert_backs_off() {
        let mut modem = ScriptedModem::new();
        modem.sms_results([false; 6]);
        let mut t = boot_with(configured_store(), modem, WakeCause::Motion, Some(CrossSleepState::default()));

        assert!(t.tick(no_events(), 20_000).sleep.is_none());
        assert_eq!(t.modem_mut().channel_mut().messages().len(), 3);
        assert!(t.retained().pending_motion_alert);

        t.tick(no_events(), 50_000);
        assert_eq!(t.modem_mut().channel_mut().messages().len(), 3, "still backing off");
        t.tick(no_events(), 80_000);
        assert_eq!(t.modem_mut().channel_mut().messages().len(), 6);
    }

    #[test]
    fn repeated_alert_failures_end_the_wake_on_a_timer() {
        let mut modem = ScriptedModem::new();
        modem.sms_results([false; 9]);
        let mut t = boot_with(configured_store(), modem, WakeCause::Motion, Some(CrossSleepState::default()));

        assert!(t.tick(no_events(), 20_000).sleep.is_none());
        assert!(t.tick(no_events(), 80_000).sleep.is_none());
        let plan = t.tick(no_events(), 140_000).sleep;

        assert_eq!(plan, Some(SleepPlan::Timer { seconds: 300 }));
        assert_eq!(t.modem_mut().channel_mut().messages().len(), 9);
        let state = t.retained();
        assert!(state.pending_motion_alert);
        assert!(!state.already_alerted);

        // The timer wake picks the alert up again.
        let t = boot(WakeCause::Timer, Some(state));
        assert_eq!(t.session(), Session::MotionWake);
    }

    #[test]
    fn fix_stored_before_a_cold_boot_is_never_cached() {
        let mut store = configured_store();
        PositionFix::new(48.1, 11.5, 5_000).save(&mut store).unwrap();
        let mut t = boot_with(store, ScriptedModem::new(), WakeCause::ColdBoot, None);

        t.tick(no_events(), 0);
        t.accelerometer_mut().shake(2);
        t.tick(no_events(), 10);
        assert_eq!(t.mode(), DeviceMode::Alert);
        t.tick(no_events(), 20_000);

        let messages = t.modem_mut().channel_mut().messages();
        assert_eq!(messages[0], "geo:48.100000,11.500000");
        assert!(messages[1].contains("outdated (age unknown)"));
        assert!(!messages[1].contains("Cached fix"));
        assert_eq!(t.retained().consecutive_cached_fixes, 0);
    }

    #[test]
    fn cached_fix_used_while_young_and_counter_reset_on_connect() {
        let mut store = configured_store();
        PositionFix::new(48.1, 11.5, 0).save(&mut store).unwrap();
        let saved = CrossSleepState {
            consecutive_cached_fixes: 1,
            ..alerted()
        };
        let mut t = boot_with(store, ScriptedModem::new(), WakeCause::Timer, Some(saved));

        t.tick(no_events(), 60_000);
        let messages = t.modem_mut().channel_mut().messages();
        assert_eq!(messages[0], "geo:48.100000,11.500000");
        assert!(messages[1].contains("Cached fix"));
        assert_eq!(t.retained().consecutive_cached_fixes, 2);

        t.tick([LinkEvent::Connected], 61_000);
        assert_eq!(t.retained().consecutive_cached_fixes, 0);
        // A retry session keeps the episode open.
        assert!(t.retained().already_alerted);
    }

    #[test]
    fn no_phone_means_no_alert() {
        let mut t = boot_with(
            MemoryStore::new(),
            ScriptedModem::new(),
            WakeCause::Motion,
            Some(CrossSleepState::default()),
        );
        t.tick(no_events(), 20_000);
        assert!(t.modem_mut().channel_mut().messages().is_empty());
        assert!(!t.retained().pending_motion_alert);
        assert_eq!(t.mode(), DeviceMode::Disconnected);
    }

    #[test]
    fn identical_config_write_is_persisted_once() {
        let mut t = boot_with(MemoryStore::new(), ScriptedModem::new(), WakeCause::ColdBoot, None);
        let write = br#"{"phone_number":"+4915550","update_interval":120}"#.to_vec();

        t.tick([LinkEvent::Connected, LinkEvent::ConfigWritten(write.clone())], 0);
        let writes = t.store().write_count();
        let report = t.tick([LinkEvent::ConfigWritten(write)], 100);

        assert_eq!(t.store().write_count(), writes);
        assert!(report.notifications.is_empty());
        assert_eq!(t.config().report_interval_s, 120);
    }

    #[test]
    fn config_clear_ends_the_episode() {
        let mut t = boot(WakeCause::Timer, Some(CrossSleepState::default()));
        t.tick([LinkEvent::Connected, LinkEvent::ConfigWritten(b"CLEAR".to_vec())], 0);

        assert_eq!(*t.config(), Configuration::default());
        assert!(!t.retained().already_alerted);
        assert!(!t.retained().pending_motion_alert);
        assert_eq!(
            Configuration::load(t.store()),
            Configuration::default()
        );
    }

    #[test]
    fn commands_answer_on_the_history_characteristic() {
        let mut t = boot(WakeCause::ColdBoot, None);
        t.tick([LinkEvent::Connected], 0);

        let location = br#"{"lat":48.1,"lon":11.5}"#.to_vec();
        t.tick([LinkEvent::LocationWritten(location)], 100);
        assert_eq!(t.history().len(), 1);

        let report = t.tick([LinkEvent::CommandReceived(b"GPS_PAGE:0".to_vec())], 200);
        let Notification::History(json) = &report.notifications[0] else {
            panic!("expected history, got {:?}", report.notifications);
        };
        assert!(json.contains(r#""totalPoints":1"#));
        assert!(json.contains(r#""src":0"#));

        t.tick([LinkEvent::CommandReceived(b"CLEAR_HISTORY".to_vec())], 300);
        assert!(t.history().is_empty());
    }

    #[test]
    fn test_sms_goes_to_configured_phone() {
        let mut t = boot(WakeCause::ColdBoot, None);
        t.tick([LinkEvent::Connected, LinkEvent::CommandReceived(b"TEST_SMS".to_vec())], 5_000);

        let messages = t.modem_mut().channel_mut().messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Bike Tracker Test SMS"));
        assert!(messages[0].contains("Time: 5 seconds"));
        assert!(!t.modem().rf_state().rf_ready);
    }
}
