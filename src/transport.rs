//! Emulator transport: device discovery, UI dumps, screenshots and input.
//!
//! The core only depends on the `Transport` trait. `AdbTransport` is the
//! production implementation and shells out to the `adb` binary.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const DUMP_PATH: &str = "/sdcard/window_dump.xml";

#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_devices(&self) -> BridgeResult<Vec<String>>;
    /// Raw accessibility-tree XML.
    async fn fetch_ui_snapshot(&self, device: &str) -> BridgeResult<String>;
    /// PNG bytes.
    async fn fetch_screenshot(&self, device: &str) -> BridgeResult<Vec<u8>>;
    async fn inject_tap(&self, device: &str, x: i32, y: i32) -> BridgeResult<()>;
    async fn inject_text(&self, device: &str, text: &str) -> BridgeResult<()>;
}

pub struct AdbTransport {
    adb_path: String,
    server: Option<(String, u16)>,
    timeout: Duration,
}

impl AdbTransport {
    pub fn new(adb_path: &str, server: Option<(String, u16)>, timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.to_string(),
            server,
            timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.adb_path, config.adb_server.clone(), config.transport_timeout)
    }

    fn command(&self, device: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        if let Some((host, port)) = &self.server {
            cmd.arg("-H").arg(host).arg("-P").arg(port.to_string());
        }
        if let Some(serial) = device {
            cmd.arg("-s").arg(serial);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, device: Option<&str>, args: &[&str]) -> BridgeResult<Output> {
        let what = format!("adb {}", args.join(" "));
        let mut cmd = self.command(device);
        cmd.args(args);
        debug!(device = device.unwrap_or("-"), command = %what, "adb call");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(BridgeError::Timeout(format!(
                    "{} exceeded {}ms",
                    what,
                    self.timeout.as_millis()
                )))
            }
            Ok(Err(e)) => {
                return Err(BridgeError::DeviceUnavailable(format!(
                    "cannot run {}: {}",
                    self.adb_path, e
                )))
            }
            Ok(Ok(out)) => out,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || device_gone(&stderr) {
            return Err(BridgeError::DeviceUnavailable(format!(
                "{} failed ({}): {}",
                what,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

fn device_gone(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    ["device offline", "not found", "no devices/emulators", "device unauthorized"]
        .iter()
        .any(|m| s.contains(m))
}

/// Serials in `device` state from `adb devices` output.
pub fn parse_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            let serial = parts.next()?;
            (parts.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

/// Escape for `adb shell input text`: spaces become `%s`, shell
/// metacharacters are backslash-escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\\' | '"' | '\'' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '~' | '#'
            | '?' | '!' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl Transport for AdbTransport {
    async fn list_devices(&self) -> BridgeResult<Vec<String>> {
        let out = self.run(None, &["devices"]).await?;
        Ok(parse_devices(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn fetch_ui_snapshot(&self, device: &str) -> BridgeResult<String> {
        self.run(Some(device), &["shell", "uiautomator", "dump", DUMP_PATH]).await?;
        let out = self.run(Some(device), &["exec-out", "cat", DUMP_PATH]).await?;
        let xml = String::from_utf8_lossy(&out.stdout).to_string();
        if !xml.contains("<hierarchy") {
            return Err(BridgeError::PerceptionInsufficient(format!(
                "uiautomator produced no hierarchy ({} bytes)",
                xml.len()
            )));
        }
        Ok(xml)
    }

    async fn fetch_screenshot(&self, device: &str) -> BridgeResult<Vec<u8>> {
        let out = self.run(Some(device), &["exec-out", "screencap", "-p"]).await?;
        if !out.stdout.starts_with(b"\x89PNG") {
            return Err(BridgeError::DeviceUnavailable(format!(
                "screencap returned {} bytes without a PNG header",
                out.stdout.len()
            )));
        }
        Ok(out.stdout)
    }

    async fn inject_tap(&self, device: &str, x: i32, y: i32) -> BridgeResult<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.run(Some(device), &["shell", "input", "tap", &x, &y]).await?;
        Ok(())
    }

    async fn inject_text(&self, device: &str, text: &str) -> BridgeResult<()> {
        let escaped = escape_input_text(text);
        self.run(Some(device), &["shell", "input", "text", &escaped]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_keeps_ready_only() {
        let out = "* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\n127.0.0.1:5555\toffline\nR58M\tunauthorized\n\n";
        assert_eq!(parse_devices(out), vec!["emulator-5554".to_string()]);
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("0.10"), "0.10");
        assert_eq!(escape_input_text("a b&c"), "a%sb\\&c");
    }

    #[test]
    fn test_device_gone_markers() {
        assert!(device_gone("error: device offline"));
        assert!(device_gone("error: device 'emulator-5556' not found"));
        assert!(!device_gone(""));
    }
}
