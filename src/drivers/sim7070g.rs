// Bike Tracker - SIM7070G UART Link
//
// Byte-level AT transport.  Command sequencing and response parsing live in
// `tracker_core::modem`; this only moves bytes and waits for patterns.

use std::thread;
use std::time::{Duration, Instant};

use esp_idf_hal::uart::UartDriver;
use tracker_core::modem::AtChannel;

use crate::config::*;

pub struct Sim7070g {
    uart: UartDriver<'static>,
}

impl Sim7070g {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self { uart }
    }
}

impl AtChannel for Sim7070g {
    fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        log::debug!(">> {line}");
        self.uart.write(line.as_bytes())?;
        self.uart.write(b"\r\n")?;
        Ok(())
    }

    fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.uart.write(bytes)?;
        Ok(())
    }

    /// Collect bytes until one of `patterns` (or `ERROR`) shows up or the
    /// timeout passes.  Whatever arrived is returned either way.
    fn read_until(&mut self, patterns: &[&str], timeout_ms: u32) -> anyhow::Result<String> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.into());
        let mut response = String::new();
        let mut buf = [0u8; 128];

        while Instant::now() < deadline {
            let n = self.uart.read(&mut buf, UART_READ_TICKS)?;
            if n == 0 {
                continue;
            }
            response.push_str(&String::from_utf8_lossy(&buf[..n]));
            if response.contains("ERROR") || patterns.iter().any(|p| response.contains(p)) {
                break;
            }
        }

        log::debug!("<< {}", response.trim());
        Ok(response)
    }

    fn discard_input(&mut self) {
        if let Err(e) = self.uart.clear_rx() {
            log::warn!("UART flush failed: {e}");
        }
    }

    fn pause_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}
