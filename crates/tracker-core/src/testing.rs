// Bike Tracker - Test Doubles
//
// Scripted stand-ins for the hardware traits.

use std::collections::VecDeque;

use crate::modem::AtChannel;
use crate::motion::{AccelSample, Accelerometer};
use crate::presence::RangeSensor;

const NO_FIX: &str = "+CGNSINF: 1,0,,,,,,,,,,,,,,,,,,,\r\nOK\r\n";
const ESC: u8 = 0x1B;
const CTRL_Z: u8 = 0x1A;

/// AT channel that answers like a healthy SIM7070G unless told otherwise.
#[derive(Debug, Default)]
pub struct ScriptedModem {
    sent: Vec<String>,
    pending: String,
    failing: Vec<String>,
    unregistered: u32,
    dropped_prompts: u32,
    gnss: VecDeque<String>,
    sms_results: VecDeque<bool>,
    in_prompt: bool,
    body: Vec<u8>,
    messages: Vec<String>,
}

impl ScriptedModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line sent, plus `<ESC>` / `<CTRL-Z>` markers for control bytes.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.clone()
    }

    /// Bodies of every submitted SMS, delivered or not.
    pub fn messages(&self) -> Vec<String> {
        self.messages.clone()
    }

    /// Answer `ERROR` to this exact command from now on.
    pub fn fail(&mut self, cmd: &str) {
        self.failing.push(cmd.to_owned());
    }

    pub fn unregistered_polls(&mut self, n: u32) {
        self.unregistered = n;
    }

    pub fn drop_prompts(&mut self, n: u32) {
        self.dropped_prompts = n;
    }

    /// Responses for successive `AT+CGNSINF` polls; no-fix once exhausted.
    pub fn gnss_responses<'a>(&mut self, responses: impl IntoIterator<Item = &'a str>) {
        self.gnss.extend(responses.into_iter().map(str::to_owned));
    }

    /// Outcomes for successive SMS submissions; success once exhausted.
    pub fn sms_results(&mut self, results: impl IntoIterator<Item = bool>) {
        self.sms_results.extend(results);
    }

    fn respond(&mut self, line: &str) -> String {
        if self.failing.iter().any(|f| f == line) {
            return "\r\nERROR\r\n".into();
        }
        match line {
            "AT+CGNSINF" => self.gnss.pop_front().unwrap_or_else(|| NO_FIX.into()),
            "AT+CREG?" if self.unregistered > 0 => {
                self.unregistered -= 1;
                "+CREG: 0,2\r\nOK\r\n".into()
            }
            "AT+CREG?" => "+CREG: 0,1\r\nOK\r\n".into(),
            "AT+CSQ" => "+CSQ: 18,99\r\nOK\r\n".into(),
            cmd if cmd.starts_with("AT+CMGS=") => {
                if self.dropped_prompts > 0 {
                    self.dropped_prompts -= 1;
                    String::new()
                } else {
                    self.in_prompt = true;
                    "\r\n> ".into()
                }
            }
            _ => "\r\nOK\r\n".into(),
        }
    }
}

impl AtChannel for ScriptedModem {
    fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.sent.push(line.to_owned());
        self.pending = self.respond(line);
        Ok(())
    }

    fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        match bytes {
            [ESC] => {
                self.sent.push("<ESC>".into());
                self.in_prompt = false;
                self.body.clear();
            }
            [CTRL_Z] if self.in_prompt => {
                self.sent.push("<CTRL-Z>".into());
                self.in_prompt = false;
                self.messages
                    .push(String::from_utf8_lossy(&self.body).into_owned());
                self.body.clear();
                self.pending = if self.sms_results.pop_front().unwrap_or(true) {
                    "\r\n+CMGS: 12\r\n\r\nOK\r\n".into()
                } else {
                    "\r\n+CMS ERROR: 500\r\n".into()
                };
            }
            _ if self.in_prompt => self.body.extend_from_slice(bytes),
            _ => {}
        }
        Ok(())
    }

    fn read_until(&mut self, _patterns: &[&str], _timeout_ms: u32) -> anyhow::Result<String> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn discard_input(&mut self) {
        self.pending.clear();
    }

    fn pause_ms(&mut self, _ms: u32) {}
}

/// Wake-engine calls in the order they reached the accelerometer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeCall {
    Arm(f32),
    Clear,
}

/// Accelerometer replaying queued samples, then sitting at rest.
#[derive(Debug)]
pub struct ScriptedAccel {
    queue: VecDeque<AccelSample>,
    resting: AccelSample,
    pub wake_calls: Vec<WakeCall>,
    pub fail_reads: bool,
}

impl ScriptedAccel {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            resting: AccelSample::new(0.0, 0.0, 1.0),
            wake_calls: Vec::new(),
            fail_reads: false,
        }
    }

    pub fn push(&mut self, sample: AccelSample) {
        self.queue.push_back(sample);
    }

    /// `n` samples of hard side-to-side shoves.
    pub fn shake(&mut self, n: usize) {
        for i in 0..n {
            let x = if i % 2 == 0 { 2.5 } else { -2.5 };
            self.push(AccelSample::new(x, 0.0, 1.0));
        }
    }
}

impl Accelerometer for ScriptedAccel {
    fn read_sample(&mut self) -> anyhow::Result<Option<AccelSample>> {
        if self.fail_reads {
            anyhow::bail!("bus error");
        }
        Ok(Some(self.queue.pop_front().unwrap_or(self.resting)))
    }

    fn arm_wake(&mut self, threshold_g: f32) -> anyhow::Result<()> {
        self.wake_calls.push(WakeCall::Arm(threshold_g));
        Ok(())
    }

    fn clear_latched(&mut self) -> anyhow::Result<()> {
        self.wake_calls.push(WakeCall::Clear);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptedRange {
    pub distance_mm: u16,
}

impl ScriptedRange {
    pub fn far() -> Self {
        Self { distance_mm: 2_000 }
    }
}

impl RangeSensor for ScriptedRange {
    fn read_distance_mm(&mut self) -> anyhow::Result<u16> {
        Ok(self.distance_mm)
    }
}
