use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the input device named `device_name`, or the host's default input device.
pub fn get_or_default_input(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());
    let Some(target) = device_name else {
        return host
            .default_input_device()
            .context("No default input device");
    };
    host.input_devices()?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .with_context(|| format!("No input device named {target:?}"))
}

/// Finds the output device named `device_name`, or the host's default output device.
pub fn get_or_default_output(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    let Some(target) = device_name else {
        return host
            .default_output_device()
            .context("No default output device");
    };
    host.output_devices()?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .with_context(|| format!("No output device named {target:?}"))
}

fn describe(name: &str, channels: u16, sample_rate: u32, is_default: bool) -> String {
    let mut d = format!(" * {}({}ch, {}hz)", name, channels, sample_rate);
    if is_default {
        d.push_str(" [default]");
    }
    d
}

/// One line per input device with its default config.
pub fn get_available_inputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_device = host.default_input_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for device in host.input_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };
        match device.default_input_config() {
            Ok(cfg) => device_names.push(describe(
                &name,
                cfg.channels(),
                cfg.sample_rate().0,
                default_device.as_deref() == Some(name.as_str()),
            )),
            Err(e) => tracing::debug!("Skipping input device {:?}: {}", name, e),
        }
    }
    Ok(device_names.join("\n"))
}

/// One line per output device with its default config.
pub fn get_available_outputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_device = host.default_output_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for device in host.output_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };
        match device.default_output_config() {
            Ok(cfg) => device_names.push(describe(
                &name,
                cfg.channels(),
                cfg.sample_rate().0,
                default_device.as_deref() == Some(name.as_str()),
            )),
            Err(e) => tracing::debug!("Skipping output device {:?}: {}", name, e),
        }
    }
    Ok(device_names.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_marks_default() {
        assert_eq!(describe("Mic", 1, 48000, true), " * Mic(1ch, 48000hz) [default]");
        assert_eq!(describe("Line", 2, 44100, false), " * Line(2ch, 44100hz)");
    }
}
