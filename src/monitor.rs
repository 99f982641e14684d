use std::{convert::Infallible, io::Write, time::Duration};

use tracing::{info, warn};

use crate::{
    error::Result,
    vbox::{models::Machine, StartType, VirtualBox},
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Starts a machine and reports its state on a fixed interval.
pub struct MachineMonitor<'a, V: VirtualBox + ?Sized> {
    vbox: &'a V,
    machine: Machine,
    interval: Duration,
    format: OutputFormat,
}

impl<'a, V: VirtualBox + ?Sized> MachineMonitor<'a, V> {
    pub fn new(vbox: &'a V, machine: Machine) -> Self {
        Self {
            vbox,
            machine,
            interval: DEFAULT_INTERVAL,
            format: OutputFormat::default(),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub async fn start(&self, start_type: StartType) -> Result<()> {
        self.vbox
            .start_machine(&self.machine.name, start_type)
            .await?;
        info!(name = %self.machine.name, start_type = start_type.as_arg(), "machine started");
        Ok(())
    }

    /// Writes the current machine rendering.
    pub fn render<W: Write>(&self, out: &mut W) -> Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(out, "{}", self.machine)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &self.machine)?;
                writeln!(out)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// One refresh. A refresh failure is reported on `out` and is not an
    /// error; only failing to write is.
    pub async fn poll_once<W: Write>(&mut self, out: &mut W) -> Result<()> {
        match self.vbox.refresh_machine(&mut self.machine).await {
            Ok(()) => self.render(out),
            Err(e) => {
                warn!(name = %self.machine.name, error = %e, "refresh failed");
                writeln!(out, "refresh: {e}")?;
                out.flush()?;
                Ok(())
            }
        }
    }

    /// Polls forever. Returns only when `out` can no longer be written.
    pub async fn run<W: Write>(&mut self, out: &mut W) -> Result<Infallible> {
        loop {
            self.poll_once(out).await?;
            tokio::time::sleep(self.interval).await;
        }
    }
}
