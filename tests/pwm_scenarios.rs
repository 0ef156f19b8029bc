mod common;

use std::thread;
use std::time::{Duration, Instant};

use sbc_mmap_gpio::pwm::{self, Converter, OpenMode, Registry, SocPwm};
use sbc_mmap_gpio::{AccessLayer, GpioError, Mode, Numbering, PinError};

use common::{rig, rpi4b};

fn registry() -> Registry {
    let mut registry = Registry::new();
    pwm::register_builtin(&mut registry);
    registry
}

#[test]
fn hardware_pwm_on_gpio12_hits_requested_frequency() {
    let (rig, _) = rpi4b();
    rig.gpio.open().unwrap();
    let pin = rig.gpio.pin_by(Numbering::Mcu, 12).unwrap();

    let mut pwm = registry().create("socpwm", &rig.gpio, pin).unwrap();
    pwm.open(OpenMode::Write).unwrap();
    assert_eq!(pin.mode().unwrap(), Mode::Pwm);

    pwm.set_range(1024).unwrap();
    pwm.set_frequency(1000.0).unwrap();
    let frequency = pwm.frequency();
    assert!((990.0..=1010.0).contains(&frequency), "{}", frequency);

    pwm.write(512).unwrap();
    pwm.set_enable(true).unwrap();
    let duty = pwm.read().unwrap() as f64 / pwm.range() as f64;
    assert!((duty - 0.5).abs() < 1e-9);

    // Values past the range saturate.
    pwm.write(5000).unwrap();
    assert_eq!(pwm.read().unwrap(), 1024);

    pwm.close().unwrap();
    assert!(!pwm.is_enabled());
    assert_ne!(pin.mode().unwrap(), Mode::Pwm);
}

#[test]
fn hardware_pwm_registers_follow_the_converter() {
    let (rig, _) = rpi4b();
    rig.gpio.open().unwrap();
    let pin = rig.gpio.pin_by(Numbering::Mcu, 18).unwrap();

    let mut pwm = SocPwm::new(pin.clone(), rig.gpio.memory().clone()).unwrap();
    pwm.open(OpenMode::Write).unwrap();
    pwm.set_range(2000).unwrap();
    pwm.write(500).unwrap();
    pwm.set_enable(true).unwrap();

    let regs = rig.memory.window(0xFE20_C000).unwrap();
    // RNG1, DAT1 and PWEN1 | MSEN1 of CTL.
    assert_eq!(regs.read(4), 2000);
    assert_eq!(regs.read(5), 500);
    assert_eq!(regs.read(0) & 0x81, 0x81);
}

#[test]
fn hardware_pwm_needs_memory_access() {
    let r = rig("rpi4b", AccessLayer::CharDev);
    r.gpio.open().unwrap();
    let pin = r.gpio.pin_by(Numbering::Mcu, 12).unwrap();
    assert!(matches!(
        registry().create("socpwm", &r.gpio, pin),
        Err(GpioError::DeviceError(_))
    ));
}

#[test]
fn hardware_pwm_refuses_unrouted_pins() {
    let (rig, _) = rpi4b();
    rig.gpio.open().unwrap();
    let pin = rig.gpio.pin_by(Numbering::Mcu, 17).unwrap();
    assert!(matches!(
        registry().create("socpwm", &rig.gpio, pin),
        Err(GpioError::PinError(PinError::PwmNotSupported(_)))
    ));
}

#[test]
fn allwinner_prescaler_gives_exact_frequency() {
    let r = rig("nanopi-neo", AccessLayer::Memory);
    r.gpio.open().unwrap();
    let pin = r.gpio.pin_by(Numbering::Mcu, 5).unwrap();

    let mut pwm = registry().create("socpwm", &r.gpio, pin).unwrap();
    pwm.open(OpenMode::Write).unwrap();
    pwm.set_range(100).unwrap();
    pwm.set_frequency(2000.0).unwrap();
    assert_eq!(pwm.frequency(), 2000.0);

    pwm.write(25).unwrap();
    let regs = r.memory.window(0x01C2_1000).unwrap();
    // Period register: (entire - 1) << 16 | active.
    assert_eq!(regs.read(0x404 / 4), 99 << 16 | 25);
}

#[test]
fn rpi5_channels_sit_behind_rp1() {
    let r = rig("rpi5b", AccessLayer::Memory);
    r.gpio.open().unwrap();
    let pin = r.gpio.pin_by(Numbering::Mcu, 19).unwrap();

    let mut pwm = registry().create("socpwm", &r.gpio, pin).unwrap();
    pwm.open(OpenMode::Write).unwrap();
    pwm.set_range(50_000).unwrap();
    pwm.set_frequency(1000.0).unwrap();
    assert_eq!(pwm.frequency(), 1000.0);
    assert_eq!(pin.mode().unwrap(), Mode::Pwm);
}

#[test]
fn software_pwm_ends_low() {
    let (rig, model) = rpi4b();
    rig.gpio.open().unwrap();
    let pin = rig.gpio.pin(0).unwrap();

    let mut pwm = registry().create("gpiopwm", &rig.gpio, pin).unwrap();
    pwm.open(OpenMode::Write).unwrap();
    pwm.set_range(10).unwrap();
    pwm.set_frequency(500.0).unwrap();
    pwm.write(5).unwrap();
    pwm.set_enable(true).unwrap();
    thread::sleep(Duration::from_millis(30));
    pwm.close().unwrap();

    assert!(!model.level(17));
    assert!(!pwm.is_open());
}

#[test]
fn slow_software_pwm_stops_within_a_phase() {
    let (rig, model) = rpi4b();
    rig.gpio.open().unwrap();
    let pin = rig.gpio.pin(0).unwrap();

    for engine in ["gpiopwm", "softpwm"] {
        let mut pwm = registry().create(engine, &rig.gpio, pin).unwrap();
        pwm.open(OpenMode::Write).unwrap();
        pwm.set_range(10).unwrap();
        pwm.set_frequency(0.5).unwrap();
        pwm.write(5).unwrap();
        pwm.set_enable(true).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        pwm.close().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{}", engine);
        assert!(!model.level(17));
    }
}

#[test]
fn frequencies_must_be_positive() {
    let (rig, _) = rpi4b();
    rig.gpio.open().unwrap();

    for (engine, mcu) in [("gpiopwm", 17), ("softpwm", 17), ("socpwm", 12)] {
        let pin = rig.gpio.pin_by(Numbering::Mcu, mcu).unwrap();
        let mut pwm = registry().create(engine, &rig.gpio, pin).unwrap();
        pwm.open(OpenMode::Write).unwrap();
        let frequency = pwm.frequency();
        for bad in [0.0, -5.0, f64::NAN] {
            assert!(
                matches!(
                    pwm.set_frequency(bad),
                    Err(GpioError::PinError(PinError::InvalidFrequency(_)))
                ),
                "{}",
                engine
            );
        }
        assert_eq!(pwm.frequency(), frequency);
        pwm.close().unwrap();
    }
}
