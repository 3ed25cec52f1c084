// Bike Tracker - SMS Alerting
//
// An alert is a pair: the bare geo URI first (phones turn it into a map
// link only when it stands alone), then a context message.  The modem RF is
// brought up for the attempt and always taken down afterwards.

use std::fmt::Write as _;

use log::{info, warn};

use crate::modem::{AtChannel, CellModem};
use crate::position::{FixOutcome, PositionFix};
use crate::tuning::Tuning;

const PAIR_GAP_MS: u32 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every message went out.
    Sent,
    /// The location went out but the context message did not.
    Partial,
    Failed,
}

impl Delivery {
    pub fn delivered(self) -> bool {
        matches!(self, Delivery::Sent | Delivery::Partial)
    }
}

/// What the alert has to say besides the position.
#[derive(Debug, Clone, Copy)]
pub struct AlertContext {
    pub user_present: bool,
    pub interval_s: u32,
    pub now_ms: u64,
    /// False when the last known fix predates the current wall-clock epoch.
    pub last_known_dated: bool,
}

fn age_text(fix: &PositionFix, now_ms: u64) -> String {
    match fix.age_ms(now_ms) {
        Some(age) if age < 60_000 => format!("{} sec old", age / 1_000),
        Some(age) => format!("{} min old", age / 60_000),
        None => "age unknown".to_owned(),
    }
}

fn status_block(body: &mut String, ctx: &AlertContext) {
    body.push_str("\n\nDevice Status\n");
    if ctx.user_present {
        body.push_str("User: Present");
    } else {
        body.push_str("User: Away\nBike moved with nobody nearby, possible tampering");
    }
    let _ = write!(body, "\nSMS Interval: {} sec", ctx.interval_s);
}

/// Build the messages for one alert, in send order.
pub fn compose(outcome: &FixOutcome, ctx: &AlertContext) -> Vec<String> {
    let (fix, note) = match outcome {
        FixOutcome::Fresh(fix) => (fix, None),
        FixOutcome::Cached(fix) => (fix, Some(format!("Cached fix, {}", age_text(fix, ctx.now_ms)))),
        FixOutcome::None {
            last_known: Some(fix),
        } => (
            fix,
            Some(format!(
                "Warning: last known location is outdated ({})",
                if ctx.last_known_dated {
                    age_text(fix, ctx.now_ms)
                } else {
                    "age unknown".to_owned()
                }
            )),
        ),
        FixOutcome::None { last_known: None } => {
            let mut body = String::from("Bike Tracker Alert\nMotion detected, location never acquired");
            status_block(&mut body, ctx);
            return vec![body];
        }
    };

    let mut body = String::from("If map did not load, copy coordinates to your map app\n");
    let _ = write!(body, "Location: {},{}", fix.lat_str(), fix.lon_str());
    let _ = write!(body, "\nSpeed: {:.1} km/h", fix.speed_kmh);
    if let Some(note) = note {
        body.push('\n');
        body.push_str(&note);
    }
    status_block(&mut body, ctx);

    vec![fix.geo_uri(), body]
}

pub fn test_message(uptime_s: u64) -> String {
    format!("Bike Tracker Test SMS\nSystem operational\nTime: {uptime_s} seconds since boot")
}

#[derive(Debug, Clone, Copy)]
pub struct Alerter {
    attempts: u32,
    retry_delay_ms: u32,
}

impl Alerter {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            attempts: tuning.alert_attempts.max(1),
            retry_delay_ms: tuning.alert_retry_delay_ms,
        }
    }

    /// Send `messages` to `phone`, retrying the whole set while nothing has
    /// been delivered.  RF is disabled on the way out whatever happened.
    pub fn dispatch<C: AtChannel>(
        &self,
        modem: &mut CellModem<C>,
        phone: &str,
        messages: &[String],
    ) -> Delivery {
        let mut delivery = Delivery::Failed;
        for attempt in 1..=self.attempts {
            delivery = Self::attempt(modem, phone, messages);
            if delivery.delivered() {
                break;
            }
            warn!("Alert attempt {attempt}/{} failed", self.attempts);
            if attempt < self.attempts {
                modem.channel_mut().pause_ms(self.retry_delay_ms);
            }
        }

        if let Err(e) = modem.disable_rf() {
            warn!("Could not disable RF after alert: {e:#}");
        }
        info!("Alert delivery: {delivery:?}");
        delivery
    }

    fn attempt<C: AtChannel>(modem: &mut CellModem<C>, phone: &str, messages: &[String]) -> Delivery {
        let ready = modem
            .init()
            .and_then(|_| modem.enable_rf())
            .and_then(|_| modem.prepare_sms());
        if let Err(e) = ready {
            warn!("Modem not ready for SMS: {e:#}");
            return Delivery::Failed;
        }

        let Some((first, rest)) = messages.split_first() else {
            return Delivery::Sent;
        };
        if let Err(e) = modem.send_sms(phone, first) {
            warn!("First SMS failed: {e:#}");
            return Delivery::Failed;
        }
        info!("First SMS sent");

        for message in rest {
            modem.channel_mut().pause_ms(PAIR_GAP_MS);
            if let Err(e) = modem.send_sms(phone, message) {
                warn!("Follow-up SMS failed: {e:#}");
                return Delivery::Partial;
            }
        }
        Delivery::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::RfState;
    use crate::testing::ScriptedModem;

    const PHONE: &str = "+15550001";

    fn ctx(user_present: bool) -> AlertContext {
        AlertContext {
            user_present,
            interval_s: 300,
            now_ms: 600_000,
            last_known_dated: true,
        }
    }

    #[test]
    fn fresh_fix_geo_uri_comes_first_and_alone() {
        let fix = PositionFix::new(52.52, 13.405, 600_000);
        let msgs = compose(&FixOutcome::Fresh(fix), &ctx(true));

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], "geo:52.520000,13.405000");
        assert!(msgs[1].contains("Location: 52.520000,13.405000"));
        assert!(msgs[1].contains("User: Present"));
        assert!(msgs[1].contains("SMS Interval: 300 sec"));
        assert!(!msgs[1].contains("tampering"));
    }

    #[test]
    fn nobody_present_reads_as_tampering() {
        let fix = PositionFix::new(1.0, 2.0, 600_000);
        let msgs = compose(&FixOutcome::Fresh(fix), &ctx(false));
        assert!(msgs[1].contains("User: Away"));
        assert!(msgs[1].contains("tampering"));
    }

    #[test]
    fn cached_and_stale_fixes_say_so() {
        let fix = PositionFix::new(1.0, 2.0, 480_000);
        let cached = compose(&FixOutcome::Cached(fix.clone()), &ctx(true));
        assert!(cached[1].contains("Cached fix, 2 min old"));

        let stale = compose(
            &FixOutcome::None {
                last_known: Some(fix),
            },
            &ctx(true),
        );
        assert_eq!(stale[0], "geo:1.000000,2.000000");
        assert!(stale[1].contains("last known location is outdated"));
    }

    #[test]
    fn last_known_from_before_a_power_loss_has_no_age() {
        let fix = PositionFix::new(1.0, 2.0, 480_000);
        let msgs = compose(
            &FixOutcome::None {
                last_known: Some(fix),
            },
            &AlertContext {
                last_known_dated: false,
                ..ctx(true)
            },
        );
        assert!(msgs[1].contains("outdated (age unknown)"));
    }

    #[test]
    fn never_acquired_is_a_single_message() {
        let msgs = compose(&FixOutcome::None { last_known: None }, &ctx(false));
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("never acquired"));
        assert!(!msgs[0].starts_with("geo:"));
    }

    fn pair() -> Vec<String> {
        vec!["geo:1.000000,2.000000".into(), "context".into()]
    }

    #[test]
    fn pair_goes_out_in_order_then_rf_drops() {
        let mut modem = CellModem::new(ScriptedModem::new());
        let delivery = Alerter::new(&Tuning::default()).dispatch(&mut modem, PHONE, &pair());

        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(modem.channel_mut().messages(), pair());
        assert_eq!(modem.channel_mut().sent_lines().last().map(String::as_str), Some("AT+CFUN=0"));
        assert_eq!(
            modem.rf_state(),
            RfState {
                gnss_powered: false,
                rf_ready: false
            }
        );
    }

    #[test]
    fn failed_first_message_aborts_and_retries() {
        let mut chan = ScriptedModem::new();
        chan.sms_results([false, false, false]);
        let mut modem = CellModem::new(chan);

        let delivery = Alerter::new(&Tuning::default()).dispatch(&mut modem, PHONE, &pair());

        assert_eq!(delivery, Delivery::Failed);
        let sent = modem.channel_mut().messages();
        assert_eq!(sent.len(), 3, "only the geo URI, once per attempt");
        assert!(sent.iter().all(|m| m.starts_with("geo:")));
        assert!(!modem.rf_state().rf_ready);
    }

    #[test]
    fn second_failure_is_partial_and_not_resent() {
        let mut chan = ScriptedModem::new();
        chan.sms_results([true, false]);
        let mut modem = CellModem::new(chan);

        let delivery = Alerter::new(&Tuning::default()).dispatch(&mut modem, PHONE, &pair());

        assert_eq!(delivery, Delivery::Partial);
        assert_eq!(modem.channel_mut().messages().len(), 2);
    }

    #[test]
    fn unresponsive_modem_fails_without_sending() {
        let mut chan = ScriptedModem::new();
        chan.fail("AT");
        let mut modem = CellModem::new(chan);

        let delivery = Alerter::new(&Tuning::default()).dispatch(&mut modem, PHONE, &pair());

        assert_eq!(delivery, Delivery::Failed);
        assert!(modem.channel_mut().messages().is_empty());
    }

    #[test]
    fn rf_is_brought_up_after_gnss_is_released() {
        let mut modem = CellModem::new(ScriptedModem::new());
        modem.enable_gnss().unwrap();

        Alerter::new(&Tuning::default()).dispatch(&mut modem, PHONE, &pair());

        let sent = modem.channel_mut().sent_lines();
        let gnss_off = sent.iter().position(|l| l == "AT+CGNSPWR=0").unwrap();
        let rf_on = sent.iter().position(|l| l == "AT+CFUN=1").unwrap();
        assert!(gnss_off < rf_on);
        assert!(modem.rf_trace().all(RfState::is_consistent));
    }
}
