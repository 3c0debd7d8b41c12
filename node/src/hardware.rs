//! Hardware bindings for the two named external interfaces (spec §1):
//! `read_voltage_current()` and `set_duty(percent)`.

use anyhow::Result;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::gpio::{Gpio34, Gpio35};
use esp_idf_hal::ledc::{LedcChannel, LedcDriver, LedcTimerDriver};
use esp_idf_hal::peripheral::Peripheral;
use log::*;

use crate::executor::{Pwm, Sensor};

/// `set_duty(percent)` (spec §1) over the ESP32 LEDC peripheral driving the
/// load's low-side PWM switch.
pub struct LedcPwm<'d> {
    driver: LedcDriver<'d>,
}

impl<'d> LedcPwm<'d> {
    pub fn new<C: LedcChannel>(
        timer: LedcTimerDriver<'d, impl Into<C::SpeedMode>>,
        channel: impl Peripheral<P = C> + 'd,
        pin: impl Peripheral<P = impl esp_idf_hal::gpio::OutputPin> + 'd,
    ) -> Result<Self> {
        let driver = LedcDriver::new(channel, timer, pin)?;
        Ok(Self { driver })
    }
}

impl Pwm for LedcPwm<'_> {
    fn set_duty(&mut self, percent: u8) -> Result<()> {
        let max = self.driver.get_max_duty();
        let duty = (max as u32 * percent.min(100) as u32) / 100;
        self.driver.set_duty(duty)?;
        Ok(())
    }
}

/// `read_voltage_current()` (spec §1): two ADC channels, one sampling the
/// load's voltage divider, one its current-sense shunt amplifier output.
pub struct AdcSensor<'d> {
    adc: AdcDriver<'d, ADC1>,
    voltage_chan: AdcChannelDriver<'d, Gpio34, ADC1>,
    current_chan: AdcChannelDriver<'d, Gpio35, ADC1>,
    voltage_scale: f64,
    current_scale: f64,
    ready: bool,
}

impl<'d> AdcSensor<'d> {
    pub fn new(
        adc: AdcDriver<'d, ADC1>,
        voltage_chan: AdcChannelDriver<'d, Gpio34, ADC1>,
        current_chan: AdcChannelDriver<'d, Gpio35, ADC1>,
        voltage_scale: f64,
        current_scale: f64,
    ) -> Self {
        Self {
            adc,
            voltage_chan,
            current_chan,
            voltage_scale,
            current_scale,
            ready: true,
        }
    }
}

impl Sensor for AdcSensor<'_> {
    fn read_voltage_current(&mut self) -> (f64, f64) {
        let raw_v = self.adc.read(&mut self.voltage_chan);
        let raw_i = self.adc.read(&mut self.current_chan);

        match (raw_v, raw_i) {
            (Ok(v), Ok(i)) => {
                self.ready = true;
                (v as f64 * self.voltage_scale, i as f64 * self.current_scale)
            }
            _ => {
                // Hardware absent or bus error: report zeros, stay
                // operational for non-sensing duties (spec §7).
                self.ready = false;
                (0.0, 0.0)
            }
        }
    }

    fn ready(&self) -> bool {
        self.ready
    }
}

/// Stand-in used until a board's ADC pins and scale factors are wired up in
/// `main.rs`. Matches the spec's hardware-absent behavior directly:
/// `ready() == false`, `READ` still replies with zeros (spec §7).
pub struct NullSensor;

impl Sensor for NullSensor {
    fn read_voltage_current(&mut self) -> (f64, f64) {
        (0.0, 0.0)
    }

    fn ready(&self) -> bool {
        false
    }
}

/// Stand-in used until a board's LEDC channel/pin is wired up in `main.rs`.
pub struct NullPwm;

impl Pwm for NullPwm {
    fn set_duty(&mut self, percent: u8) -> Result<()> {
        debug!("NullPwm::set_duty({percent}) — no PWM peripheral wired");
        Ok(())
    }
}

pub fn placeholder_sensor() -> NullSensor {
    NullSensor
}

pub fn placeholder_pwm() -> NullPwm {
    NullPwm
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSensor {
        calls: u32,
    }

    impl Sensor for StubSensor {
        fn read_voltage_current(&mut self) -> (f64, f64) {
            self.calls += 1;
            (12.0, 1.0)
        }

        fn ready(&self) -> bool {
            self.calls > 0
        }
    }

    #[test]
    fn sensor_trait_is_object_safe_for_non_hardware_stand_ins() {
        let mut sensor: Box<dyn Sensor> = Box::new(StubSensor { calls: 0 });
        assert!(!sensor.ready());
        let (v, i) = sensor.read_voltage_current();
        assert_eq!((v, i), (12.0, 1.0));
        assert!(sensor.ready());
    }
}
