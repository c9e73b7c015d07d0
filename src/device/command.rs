//! Device backed by host shell command templates.
//!
//! Each primitive is a template from [`DeviceCommandsConfig`]; `{serial}` is
//! always available and `{key}` is available to the property template.
//! The defaults drive `adb`, but any tool with a similar shape works.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Device, DeviceError, DeviceResult};
use crate::config::DeviceCommandsConfig;
use crate::shell::{ShellError, ShellOutput, ShellRunner, render};

/// A device driven through shell command templates.
#[derive(Debug, Clone)]
pub struct CommandDevice {
    serial: String,
    commands: DeviceCommandsConfig,
}

impl CommandDevice {
    pub fn new(serial: impl Into<String>, commands: DeviceCommandsConfig) -> Self {
        Self {
            serial: serial.into(),
            commands,
        }
    }

    async fn run(&self, template: &str, extra: &[(&str, &str)], reboot: bool) -> DeviceResult<ShellOutput> {
        let mut values = vec![("serial", self.serial.as_str())];
        values.extend_from_slice(extra);
        let command = render(template, &values);

        let timeout = if reboot {
            self.commands.reboot_timeout()
        } else {
            self.commands.timeout()
        };

        let output = ShellRunner::new()
            .with_timeout(timeout)
            .run(&command)
            .await
            .map_err(|e| match e {
                ShellError::Timeout(_) => DeviceError::Timeout(self.serial.clone()),
                ShellError::Spawn { source, .. } => DeviceError::Io(source),
            })?;

        if !output.success() {
            return Err(DeviceError::CommandFailed {
                serial: self.serial.clone(),
                message: format!(
                    "'{}' exited with code {}: {}",
                    command,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl Device for CommandDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn get_property(&self, key: &str) -> DeviceResult<String> {
        let output = self
            .run(&self.commands.property, &[("key", key)], false)
            .await?;
        let value = output.stdout_text().trim().to_string();
        debug!(serial = %self.serial, key, value = %value, "Read device property");
        Ok(value)
    }

    async fn reboot(&self) -> DeviceResult<()> {
        info!(serial = %self.serial, "Rebooting device");
        self.run(&self.commands.reboot, &[], true)
            .await
            .map_err(|e| match e {
                DeviceError::Timeout(serial) => DeviceError::NotAvailable(serial),
                other => other,
            })?;
        Ok(())
    }

    async fn bugreport(&self) -> DeviceResult<Vec<u8>> {
        Ok(self.run(&self.commands.bugreport, &[], false).await?.stdout)
    }

    async fn logcat(&self) -> DeviceResult<Vec<u8>> {
        Ok(self.run(&self.commands.logcat, &[], false).await?.stdout)
    }

    async fn screenshot(&self) -> DeviceResult<Vec<u8>> {
        Ok(self.run(&self.commands.screenshot, &[], false).await?.stdout)
    }
}
