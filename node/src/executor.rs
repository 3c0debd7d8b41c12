//! Command executor (C2): parse the ASCII grammar, produce a local effect +
//! reply or a mesh dispatch (spec §4.2, §6).

use std::thread;
use std::time::Duration;

use dcmesh_common::{parse_command, parse_local_shorthand, Verb};

/// The abstract sensor interface (spec §1): "modelled as two abstract
/// interfaces: `read_voltage_current()` and `set_duty(percent)`".
pub trait Sensor {
    /// Returns `(voltage, current_mA)`. Implementations whose hardware is
    /// absent should return `(0.0, 0.0)` and report it via `ready()` rather
    /// than erroring (spec §7: "sensor_ready = false; READ still replies").
    fn read_voltage_current(&mut self) -> (f64, f64);
    fn ready(&self) -> bool;
}

/// The abstract PWM interface (spec §1).
pub trait Pwm {
    fn set_duty(&mut self, percent: u8) -> anyhow::Result<()>;
}

/// The 0-25-50-75-100-0 RAMP dwell sequence (spec §4.2).
const RAMP_STEPS: [u8; 6] = [0, 25, 50, 75, 100, 0];
const RAMP_DWELL: Duration = Duration::from_millis(500);

/// `LoadState` (spec §3): the single authoritative duty set-point.
pub struct LoadState {
    pub duty_percent: u8,
    pub sensor_ready: bool,
}

impl LoadState {
    pub fn new() -> Self {
        Self {
            duty_percent: 0,
            sensor_ready: false,
        }
    }
}

impl Default for LoadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes verbs locally against the node's own hardware and tracks
/// `LoadState`. Owns the PWM and sensor peripherals exclusively (spec §5).
pub struct Executor {
    node_id: u16,
    sensor: Box<dyn Sensor + Send>,
    pwm: Box<dyn Pwm + Send>,
    state: LoadState,
}

impl Executor {
    pub fn new(node_id: u16, sensor: Box<dyn Sensor + Send>, pwm: Box<dyn Pwm + Send>) -> Self {
        Self {
            node_id,
            sensor,
            pwm,
            state: LoadState::new(),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    /// Parse-then-execute for commands arriving over the mesh or the link
    /// endpoint (never node-native shorthand — that path is
    /// [`Self::execute_local_shorthand`]). Delivery over the mesh or the
    /// link endpoint already selected this node as the recipient (by unicast
    /// address or group membership), so the `target` token is not
    /// re-examined here — only malformed commands are rejected.
    pub fn execute_raw(&mut self, payload: &[u8]) -> String {
        let text = String::from_utf8_lossy(payload);
        match parse_command(&text) {
            Ok(cmd) => self.execute(cmd.verb),
            Err(err) => err.to_string(),
        }
    }

    /// Node-native shorthand entry point (spec §4.2): `read`, `s`, `r`,
    /// `duty:N`, or a bare integer.
    pub fn execute_local_shorthand(&mut self, text: &str) -> Option<String> {
        parse_local_shorthand(text).map(|cmd| self.execute(cmd.verb))
    }

    fn execute(&mut self, verb: Verb) -> String {
        match verb {
            Verb::Read => self.read_reply(),
            Verb::Duty(percent) => {
                self.set_duty(percent);
                self.read_reply()
            }
            Verb::Stop | Verb::Off => {
                self.set_duty(0);
                self.read_reply()
            }
            Verb::On | Verb::Ramp => {
                self.ramp();
                self.read_reply()
            }
            Verb::Monitor => dcmesh_common::format_sent("MONITOR"),
        }
    }

    fn set_duty(&mut self, percent: u8) {
        let clamped = percent.min(100);
        self.state.duty_percent = clamped;
        if let Err(err) = self.pwm.set_duty(clamped) {
            warn!("set_duty({clamped}) failed: {err}");
        }
    }

    fn ramp(&mut self) {
        for step in RAMP_STEPS {
            self.set_duty(step);
            thread::sleep(RAMP_DWELL);
        }
    }

    fn read_reply(&mut self) -> String {
        let (voltage, current_ma) = self.sensor.read_voltage_current();
        self.state.sensor_ready = self.sensor.ready();
        dcmesh_common::format_data_reply(self.node_id, self.state.duty_percent, voltage, current_ma)
    }
}

#[cfg(test)]
pub(crate) struct FakeSensor {
    pub voltage: f64,
    pub current_ma: f64,
    pub ready: bool,
}

#[cfg(test)]
impl Sensor for FakeSensor {
    fn read_voltage_current(&mut self) -> (f64, f64) {
        (self.voltage, self.current_ma)
    }

    fn ready(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
pub(crate) struct FakePwm {
    pub last_duty: u8,
}

#[cfg(test)]
impl Pwm for FakePwm {
    fn set_duty(&mut self, percent: u8) -> anyhow::Result<()> {
        self.last_duty = percent;
        Ok(())
    }
}

#[cfg(test)]
impl Executor {
    pub(crate) fn new_for_test() -> Self {
        Self::new(
            0,
            Box::new(FakeSensor {
                voltage: 12.003,
                current_ma: 0.25,
                ready: true,
            }),
            Box::new(FakePwm { last_duty: 0 }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_matches_scenario_s1() {
        let mut executor = Executor::new_for_test();
        let reply = executor.execute_raw(b"0:READ");
        assert_eq!(reply, "NODE0:DATA:D:0%,V:12.003V,I:0.25mA,P:3.0mW");
    }

    #[test]
    fn duty_sets_then_reads() {
        let mut executor = Executor::new_for_test();
        let reply = executor.execute_raw(b"0:DUTY:50");
        assert!(reply.starts_with("NODE0:DATA:D:50%"));
        assert_eq!(executor.state().duty_percent, 50);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut executor = Executor::new_for_test();
        executor.execute_raw(b"0:DUTY:80");
        let first = executor.execute_raw(b"0:STOP");
        let second = executor.execute_raw(b"0:STOP");
        assert_eq!(first, second);
        assert_eq!(executor.state().duty_percent, 0);
    }

    #[test]
    fn duty_is_clamped_to_100() {
        let mut executor = Executor::new_for_test();
        executor.execute_raw(b"0:DUTY:250");
        assert_eq!(executor.state().duty_percent, 100);
    }

    #[test]
    fn unknown_command_reports_byte_exact_error() {
        let mut executor = Executor::new_for_test();
        assert_eq!(executor.execute_raw(b"0:FROB"), "ERROR:UNKNOWN_CMD:FROB");
    }

    #[test]
    fn monitor_acks_with_sent() {
        let mut executor = Executor::new_for_test();
        assert_eq!(executor.execute_raw(b"0:MONITOR"), "SENT:MONITOR");
    }

    #[test]
    fn local_shorthand_bare_integer_sets_duty() {
        let mut executor = Executor::new_for_test();
        let reply = executor.execute_local_shorthand("75").unwrap();
        assert!(reply.starts_with("NODE0:DATA:D:75%"));
    }
}
