// Bike Tracker - SIM7070G Modem Control
//
// GNSS and the LTE transmitter share one RF front end.  `CellModem` owns the
// AT channel and enforces single ownership: GNSS is only powered with the
// cellular RF disabled (AT+CFUN=0) and RF is only enabled after GNSS is off.
// Every change is appended to a small trace so the invariant can be checked.

use std::collections::VecDeque;

use anyhow::{bail, Context};
use log::{debug, info, warn};

/// Byte-level AT command transport (UART on the device, scripted in tests).
pub trait AtChannel {
    /// Write `line` followed by CR LF.
    fn send_line(&mut self, line: &str) -> anyhow::Result<()>;

    fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Collect input until one of `patterns` or `ERROR` shows up, or the
    /// timeout runs out.  Returns whatever was read either way.
    fn read_until(&mut self, patterns: &[&str], timeout_ms: u32) -> anyhow::Result<String>;

    fn discard_input(&mut self);

    fn pause_ms(&mut self, ms: u32);
}

const DEFAULT_TIMEOUT_MS: u32 = 2_000;
const RF_TIMEOUT_MS: u32 = 10_000;
const POWER_TIMEOUT_MS: u32 = 5_000;
const PROMPT_TIMEOUT_MS: u32 = 5_000;
const SMS_TIMEOUT_MS: u32 = 30_000;
const RESET_SETTLE_MS: u32 = 10_000;
const RF_STABILIZE_MS: u32 = 2_000;
const REGISTRATION_ATTEMPTS: u32 = 10;
const TRACE_LEN: usize = 64;

const ESC: u8 = 0x1B;
const CTRL_Z: u8 = 0x1A;

/// Who currently holds the RF front end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RfState {
    pub gnss_powered: bool,
    pub rf_ready: bool,
}

impl RfState {
    pub fn is_consistent(&self) -> bool {
        !(self.gnss_powered && self.rf_ready)
    }
}

pub struct CellModem<C: AtChannel> {
    channel: C,
    state: RfState,
    trace: VecDeque<RfState>,
    initialised: bool,
}

impl<C: AtChannel> CellModem<C> {
    /// The modem's power-on state is unknown; assume RF may be up so the
    /// first GNSS request explicitly shuts it down.
    pub fn new(channel: C) -> Self {
        let state = RfState {
            gnss_powered: false,
            rf_ready: true,
        };
        let mut trace = VecDeque::with_capacity(TRACE_LEN);
        trace.push_back(state);
        Self {
            channel,
            state,
            trace,
            initialised: false,
        }
    }

    pub fn rf_state(&self) -> RfState {
        self.state
    }

    pub fn rf_trace(&self) -> impl Iterator<Item = &RfState> {
        self.trace.iter()
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn set_state(&mut self, state: RfState) {
        if state == self.state {
            return;
        }
        debug!("RF state: gnss={} rf={}", state.gnss_powered, state.rf_ready);
        self.state = state;
        if self.trace.len() == TRACE_LEN {
            self.trace.pop_front();
        }
        self.trace.push_back(state);
    }

    // ---------------------------------------------------------------------
    // Raw commands
    // ---------------------------------------------------------------------

    /// Send a command and wait for `expect`.  `Ok(false)` on ERROR/timeout.
    pub fn command(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> anyhow::Result<bool> {
        self.channel.discard_input();
        self.channel.send_line(cmd)?;
        let response = self.channel.read_until(&[expect], timeout_ms)?;
        Ok(response.contains(expect))
    }

    /// Send a command and return its full response if it ended in OK.
    pub fn query(&mut self, cmd: &str, timeout_ms: u32) -> anyhow::Result<Option<String>> {
        self.channel.discard_input();
        self.channel.send_line(cmd)?;
        let response = self.channel.read_until(&["OK"], timeout_ms)?;
        Ok(response.contains("OK").then_some(response))
    }

    pub fn is_ready(&mut self) -> bool {
        self.command("AT", "OK", 1_000).unwrap_or(false)
    }

    fn wait_ready(&mut self, attempts: u32) -> bool {
        for attempt in 0..attempts {
            if self.command("AT", "OK", DEFAULT_TIMEOUT_MS).unwrap_or(false) {
                return true;
            }
            debug!("Modem not answering (attempt {})", attempt + 1);
            self.channel.pause_ms(1_000);
        }
        false
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Probe the module and set SMS text mode.  Idempotent.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if self.initialised {
            return Ok(());
        }
        if !self.wait_ready(5) {
            bail!("SIM7070G not responding");
        }
        if let Ok(Some(csq)) = self.query("AT+CSQ", POWER_TIMEOUT_MS) {
            debug!("Signal: {}", csq.trim());
        }
        self.command("AT+CMGF=1", "OK", DEFAULT_TIMEOUT_MS)?;
        self.command("AT+CSMP=17,167,0,0", "OK", DEFAULT_TIMEOUT_MS)?;
        self.initialised = true;
        info!("SIM7070G ready");
        Ok(())
    }

    /// Full functional reset.  The module comes back with RF enabled and
    /// GNSS off.
    pub fn reset(&mut self) -> anyhow::Result<()> {
        if !self.command("AT+CFUN=1,1", "OK", RF_TIMEOUT_MS)? {
            bail!("modem rejected reset");
        }
        self.channel.pause_ms(RESET_SETTLE_MS);
        self.set_state(RfState {
            gnss_powered: false,
            rf_ready: true,
        });
        if !self.wait_ready(10) {
            bail!("modem did not come back after reset");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // RF ownership
    // ---------------------------------------------------------------------

    pub fn disable_rf(&mut self) -> anyhow::Result<()> {
        if !self.command("AT+CFUN=0", "OK", POWER_TIMEOUT_MS)? {
            bail!("AT+CFUN=0 failed");
        }
        self.set_state(RfState {
            rf_ready: false,
            ..self.state
        });
        self.channel.pause_ms(1_000);
        info!("RF disabled");
        Ok(())
    }

    /// Hand the RF front end to GNSS.
    pub fn enable_gnss(&mut self) -> anyhow::Result<()> {
        if self.state.gnss_powered {
            return Ok(());
        }
        if self.state.rf_ready {
            self.disable_rf().context("releasing RF for GNSS")?;
        }
        if !self.command("AT+CGNSPWR=1", "OK", POWER_TIMEOUT_MS)? {
            bail!("AT+CGNSPWR=1 failed");
        }
        self.set_state(RfState {
            gnss_powered: true,
            rf_ready: false,
        });
        info!("GNSS powered on");
        Ok(())
    }

    pub fn disable_gnss(&mut self) -> anyhow::Result<()> {
        for _ in 0..2 {
            if self.command("AT+CGNSPWR=0", "OK", POWER_TIMEOUT_MS)? {
                self.set_state(RfState {
                    gnss_powered: false,
                    ..self.state
                });
                info!("GNSS powered off");
                return Ok(());
            }
        }
        bail!("AT+CGNSPWR=0 failed")
    }

    /// Hand the RF front end to the cellular side and wait (bounded) for
    /// network registration.
    pub fn enable_rf(&mut self) -> anyhow::Result<()> {
        if self.state.gnss_powered {
            self.disable_gnss().context("releasing RF from GNSS")?;
        }
        if !self.state.rf_ready {
            if !self.command("AT+CFUN=1", "OK", RF_TIMEOUT_MS)? {
                bail!("AT+CFUN=1 failed");
            }
            self.set_state(RfState {
                gnss_powered: false,
                rf_ready: true,
            });
            self.channel.pause_ms(RF_STABILIZE_MS);
        }
        self.wait_registration(REGISTRATION_ATTEMPTS)
    }

    pub fn wait_registration(&mut self, attempts: u32) -> anyhow::Result<()> {
        for _ in 0..attempts {
            if let Some(resp) = self.query("AT+CREG?", DEFAULT_TIMEOUT_MS)? {
                if resp.contains("+CREG: 0,1") || resp.contains("+CREG: 0,5") {
                    info!("Network registered");
                    return Ok(());
                }
            }
            self.channel.pause_ms(1_000);
        }
        bail!("no network registration after {attempts} attempts")
    }

    // ---------------------------------------------------------------------
    // GNSS / SMS
    // ---------------------------------------------------------------------

    /// One `AT+CGNSINF` poll.  Only meaningful while GNSS owns the RF.
    pub fn gnss_info(&mut self) -> anyhow::Result<Option<String>> {
        self.query("AT+CGNSINF", DEFAULT_TIMEOUT_MS)
    }

    /// Abort any half-entered SMS prompt and confirm the module answers.
    pub fn prepare_sms(&mut self) -> anyhow::Result<()> {
        self.channel.discard_input();
        self.channel.send_raw(&[ESC])?;
        self.channel.pause_ms(1_000);
        if !self.is_ready() {
            bail!("modem not ready for SMS");
        }
        Ok(())
    }

    /// Send one text message.  RF must already be enabled.
    pub fn send_sms(&mut self, number: &str, text: &str) -> anyhow::Result<()> {
        if !self.state.rf_ready {
            bail!("RF not enabled");
        }
        if !self.command("AT+CMGF=1", "OK", DEFAULT_TIMEOUT_MS)? {
            warn!("Text mode not confirmed, sending anyway");
        }
        self.channel.pause_ms(500);

        self.channel.discard_input();
        self.channel
            .send_line(&format!("AT+CMGS=\"{number}\""))?;
        let prompt = self.channel.read_until(&[">"], PROMPT_TIMEOUT_MS)?;
        if !prompt.contains('>') {
            self.channel.send_raw(&[ESC])?;
            self.channel.pause_ms(500);
            self.channel.discard_input();
            bail!("no SMS prompt");
        }

        self.channel.send_raw(text.as_bytes())?;
        self.channel.send_raw(&[CTRL_Z])?;

        let mut response = self.channel.read_until(&["OK"], SMS_TIMEOUT_MS)?;
        if response.contains("+CMGS:") && !response.contains("OK") && !response.contains("ERROR") {
            response.push_str(&self.channel.read_until(&["OK"], DEFAULT_TIMEOUT_MS)?);
        }
        if response.contains("ERROR") {
            bail!("SMS rejected: {}", response.trim());
        }
        if !(response.contains("+CMGS:") && response.contains("OK")) {
            bail!("SMS send timeout");
        }
        Ok(())
    }
}
