//! Operator shell
//!
//! Interactive console cycle around the echo test:
//!
//! ```text
//! Enumerating -> Selecting -> Testing -> AskRetry -> Enumerating | Done
//! ```
//!
//! The shell is generic over the backend and its console streams so it runs
//! the same against real hardware and the in-memory test bus.

use crate::config::TesterConfig;
use crate::config::duration_serde::format_duration;
use anyhow::Result;
use bulk::{
    BulkError, CancelToken, DeviceDescriptor, DeviceIndex, EchoFailure, EchoMode, EchoReport,
    EchoTest, Enumeration, ErrorKind, PollOutcome, Registry, Session, UsbBackend,
    wait_for_devices,
};
use serde::Serialize;
use std::io::{BufRead, Write};
use tracing::{debug, info};

/// Presets that skip prompts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellOptions {
    /// Device to test instead of asking
    pub device: Option<DeviceIndex>,
    /// Echo packets per run instead of asking
    pub repeats: Option<u32>,
    /// Stop after one run instead of offering a retry
    pub once: bool,
    /// Sweep packet sizes 1-64 instead of asking for a repeat count;
    /// `repeats` then counts sweep passes
    pub sweep: bool,
}

const RETRY_PROMPT: &str = "Do you want to retry? [y/N]: ";

/// Why the shell stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// Operator typed `q` or declined to retry after bad input
    Quit,
    /// Operator declined another run, or `--once`
    Finished,
    /// No device appeared within the poll timeout
    TimedOut,
    /// Ctrl-C
    Cancelled,
    /// Console input closed
    EndOfInput,
    /// A step failed and no retry followed (`--once` or end of input)
    Failed,
}

/// Outcome of a shell session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSummary {
    pub exit: ShellExit,
    /// Echo runs performed
    pub runs: u32,
    /// Report of the last echo run
    pub last_report: Option<EchoReport>,
}

impl ShellSummary {
    /// 1 when the last echo run failed, a step failed without a retry or
    /// no device showed up, else 0
    pub fn exit_code(&self) -> u8 {
        let last_failed = self.last_report.as_ref().is_some_and(|r| !r.passed());
        if matches!(self.exit, ShellExit::TimedOut | ShellExit::Failed) || last_failed {
            1
        } else {
            0
        }
    }
}

#[derive(Debug)]
enum State {
    Enumerating,
    Selecting(Enumeration),
    Testing(DeviceIndex),
    AskRetry,
    Done(ShellExit),
}

/// Interactive echo test console
pub struct Shell<'a, B: UsbBackend, R, W> {
    registry: &'a Registry<B>,
    config: &'a TesterConfig,
    options: ShellOptions,
    cancel: CancelToken,
    input: R,
    output: W,
    runs: u32,
    last_report: Option<EchoReport>,
}

impl<'a, B, R, W> Shell<'a, B, R, W>
where
    B: UsbBackend,
    R: BufRead,
    W: Write,
{
    pub fn new(
        registry: &'a Registry<B>,
        config: &'a TesterConfig,
        options: ShellOptions,
        cancel: CancelToken,
        input: R,
        output: W,
    ) -> Self {
        Self {
            registry,
            config,
            options,
            cancel,
            input,
            output,
            runs: 0,
            last_report: None,
        }
    }

    /// Run until the operator quits, input ends or the token is cancelled
    ///
    /// Fails only when USB enumeration is unavailable or the console breaks.
    pub fn run(mut self) -> Result<ShellSummary> {
        let mut state = State::Enumerating;

        loop {
            debug!("Shell state: {:?}", state);
            if self.cancel.is_cancelled() && !matches!(state, State::Done(_)) {
                state = State::Done(ShellExit::Cancelled);
            }

            state = match state {
                State::Enumerating => self.enumerate()?,
                State::Selecting(snapshot) => self.select(&snapshot)?,
                State::Testing(index) => self.test(index)?,
                State::AskRetry => self.ask_retry()?,
                State::Done(exit) => {
                    info!("Shell finished: {:?} after {} run(s)", exit, self.runs);
                    return Ok(ShellSummary {
                        exit,
                        runs: self.runs,
                        last_report: self.last_report,
                    });
                }
            };
        }
    }

    fn enumerate(&mut self) -> Result<State> {
        writeln!(self.output, "Looking for devices...")?;
        self.output.flush()?;

        let poll = self.config.poll_options();
        match wait_for_devices(self.registry, poll, &self.cancel) {
            Ok(PollOutcome::Found(snapshot)) => Ok(State::Selecting(snapshot)),
            Ok(PollOutcome::TimedOut) => {
                writeln!(
                    self.output,
                    "No device found within {}.",
                    format_duration(poll.timeout)
                )?;
                Ok(State::Done(ShellExit::TimedOut))
            }
            Ok(PollOutcome::Cancelled) => Ok(State::Done(ShellExit::Cancelled)),
            Err(e) => {
                writeln!(self.output, "{}", describe_error(&e))?;
                Err(e.into())
            }
        }
    }

    fn select(&mut self, snapshot: &Enumeration) -> Result<State> {
        let count = snapshot.count();
        writeln!(
            self.output,
            "\nFound {} {}",
            count,
            if count == 1 { "device" } else { "devices" }
        )?;

        for &index in snapshot.indices() {
            match self.registry.describe_device(index) {
                Ok(desc) => self.print_device(&desc)?,
                Err(e) => return self.recover(&e),
            }
        }

        let index = match self.options.device {
            Some(index) => index,
            None => {
                let Some(line) = self.prompt(
                    "To which device do you want to connect? (e.g. '0' for the first device, q to quit): ",
                )?
                else {
                    return Ok(State::Done(ShellExit::EndOfInput));
                };
                if line.to_lowercase().starts_with('q') {
                    return Ok(State::Done(ShellExit::Quit));
                }
                match line.parse::<u32>() {
                    Ok(n) => DeviceIndex(n),
                    Err(_) => {
                        writeln!(self.output, "Invalid device number '{}'.", line)?;
                        return self.retry_after_error();
                    }
                }
            }
        };

        if !snapshot.contains(index) {
            writeln!(self.output, "Device {} is not in the list.", index)?;
            return self.retry_after_error();
        }
        Ok(State::Testing(index))
    }

    fn test(&mut self, index: DeviceIndex) -> Result<State> {
        let options = self.config.session_options(self.cancel.clone());
        let mut session = match Session::open(self.registry, index, options) {
            Ok(session) => session,
            Err(e) => return self.recover(&e),
        };
        writeln!(
            self.output,
            "Vendor: {}, Product: {}",
            session.vendor_name(),
            session.product_name()
        )?;

        let test = if self.options.sweep {
            EchoTest::size_sweep(self.options.repeats.unwrap_or(1))
        } else {
            let repeats = match self.options.repeats {
                Some(repeats) => repeats,
                None => {
                    let Some(line) =
                        self.prompt("Enter the number of echo packets to send to the device: ")?
                    else {
                        return Ok(State::Done(ShellExit::EndOfInput));
                    };
                    match line.parse::<u32>() {
                        Ok(repeats) => repeats,
                        Err(_) => {
                            writeln!(self.output, "Invalid number '{}'.", line)?;
                            return self.retry_after_error();
                        }
                    }
                }
            };
            self.config.echo_test(repeats)
        };

        // The first console error is returned once the session is closed
        let mut console_error: Option<std::io::Error> = None;
        let output = &mut self.output;
        let report = test.run(&mut session, |_| {
            if console_error.is_none()
                && let Err(e) = write!(output, ".").and_then(|()| output.flush())
            {
                console_error = Some(e);
            }
        });
        session.close();
        if let Some(e) = console_error {
            return Err(e.into());
        }
        writeln!(self.output)?;
        self.print_report(&test, &report)?;

        self.runs += 1;
        self.last_report = Some(report);

        if self.cancel.is_cancelled() {
            Ok(State::Done(ShellExit::Cancelled))
        } else if self.options.once {
            Ok(State::Done(ShellExit::Finished))
        } else {
            Ok(State::AskRetry)
        }
    }

    fn print_report(&mut self, test: &EchoTest, report: &EchoReport) -> Result<()> {
        match report.failure() {
            None if test.mode == EchoMode::Sweep => writeln!(
                self.output,
                "Size sweep passed: {} packet(s) of 1-{} byte(s) echoed and verified.",
                report.completed, test.payload_len
            )?,
            None => writeln!(
                self.output,
                "Echo test passed: {} packet(s) of {} byte(s) echoed.",
                report.completed, test.payload_len
            )?,
            Some(_) if self.cancel.is_cancelled() => writeln!(
                self.output,
                "Echo test cancelled after {} packet(s).",
                report.completed
            )?,
            Some(EchoFailure::Transfer { error, .. }) => writeln!(
                self.output,
                "Echo test aborted after {} of {} packet(s): {}",
                report.completed,
                report.requested,
                describe_error(error)
            )?,
            Some(EchoFailure::ShortWrite {
                iteration,
                expected,
                actual,
            }) => writeln!(
                self.output,
                "Echo test FAILED after {} of {} packet(s): device accepted {} of {} byte(s) in iteration {}",
                report.completed, report.requested, actual, expected, iteration
            )?,
            Some(failure) => writeln!(
                self.output,
                "Echo test FAILED after {} of {} packet(s): wrong data received from device, {}",
                report.completed, report.requested, failure
            )?,
        }

        if let Some(rate) = report.throughput() {
            writeln!(
                self.output,
                "{} byte(s) echoed in {} ms ({:.1} KB/s)",
                report.bytes,
                report.elapsed.as_millis(),
                rate / 1024.0
            )?;
        }
        Ok(())
    }

    /// Offer another run after a finished one
    fn ask_retry(&mut self) -> Result<State> {
        if self.options.once {
            return Ok(State::Done(ShellExit::Finished));
        }
        Ok(match self.confirm_retry()? {
            None => State::Done(ShellExit::EndOfInput),
            Some(true) => State::Enumerating,
            Some(false) => State::Done(ShellExit::Finished),
        })
    }

    /// Offer a retry after a failed step; without an answer the shell fails
    fn retry_after_error(&mut self) -> Result<State> {
        if self.options.once {
            return Ok(State::Done(ShellExit::Failed));
        }
        Ok(match self.confirm_retry()? {
            None => State::Done(ShellExit::Failed),
            Some(true) => State::Enumerating,
            Some(false) => State::Done(ShellExit::Quit),
        })
    }

    /// None at end of input
    fn confirm_retry(&mut self) -> Result<Option<bool>> {
        Ok(self.prompt(RETRY_PROMPT)?.map(|answer| {
            answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
        }))
    }

    /// Report a registry/session error and pick the next state by its kind
    fn recover(&mut self, error: &BulkError) -> Result<State> {
        writeln!(self.output, "{}", describe_error(error))?;
        match error.kind() {
            ErrorKind::EnumerationUnavailable => Err(error.clone().into()),
            ErrorKind::DeviceNotFound => Ok(State::Enumerating),
            ErrorKind::OpenFailed | ErrorKind::TransferFailed => self.retry_after_error(),
        }
    }

    fn print_device(&mut self, desc: &DeviceDescriptor) -> Result<()> {
        writeln!(self.output, "Found the following device {}:", desc.device_index)?;
        writeln!(self.output, "  Serial no.  : {}", desc.serial_number)?;
        writeln!(self.output, "  Vendor name : {}", desc.vendor_name)?;
        writeln!(self.output, "  Product name: {}", desc.product_name)?;
        writeln!(self.output, "  Vendor ID   : 0x{:04x}", desc.vendor_id)?;
        writeln!(self.output, "  Product ID  : 0x{:04x}", desc.product_id)?;
        writeln!(self.output, "  Interface   : 0x{:02x}", desc.interface_number)?;

        let expected = &self.config.echo.expected_product;
        if !expected.is_empty() && desc.product_name != *expected {
            writeln!(
                self.output,
                "\n  WARNING: Expected product name is \"{}\". Is the correct sample application running on the target?\n",
                expected
            )?;
        }
        Ok(())
    }

    /// Print a prompt and read one trimmed line; None at end of input
    fn prompt(&mut self, text: &str) -> Result<Option<String>> {
        write!(self.output, "{}", text)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            writeln!(self.output)?;
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

/// Operator-facing message for each error kind
pub fn describe_error(error: &BulkError) -> String {
    match error.kind() {
        ErrorKind::EnumerationUnavailable => format!(
            "Error: {}. Check that the USB stack is accessible to this user.",
            error
        ),
        ErrorKind::DeviceNotFound => {
            format!("The device list changed ({}). Looking for devices again.", error)
        }
        ErrorKind::OpenFailed => format!(
            "Could not open the device: {}. Select another device or close the program using it.",
            error
        ),
        ErrorKind::TransferFailed => format!("Transfer error: {}. The run was aborted.", error),
    }
}

#[derive(Serialize)]
struct DeviceListing<'a> {
    allowed_devices: Vec<String>,
    devices: &'a [DeviceDescriptor],
}

/// Print the attached allow-listed devices once; returns how many were found
pub fn list_devices<B: UsbBackend, W: Write>(
    registry: &Registry<B>,
    json: bool,
    out: &mut W,
) -> Result<usize> {
    let mut devices = Vec::new();
    for index in registry.list_available_devices()? {
        match registry.describe_device(index) {
            Ok(desc) => devices.push(desc),
            Err(e) if e.kind() == ErrorKind::DeviceNotFound => {
                debug!("Device {} vanished while listing", index);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if json {
        let listing = DeviceListing {
            allowed_devices: registry
                .allowed_devices()
                .iter()
                .map(ToString::to_string)
                .collect(),
            devices: &devices,
        };
        serde_json::to_writer_pretty(&mut *out, &listing)?;
        writeln!(out)?;
    } else if devices.is_empty() {
        writeln!(out, "No allowed devices attached.")?;
    } else {
        for desc in &devices {
            writeln!(
                out,
                "{}: 0x{:04x}:0x{:04x} interface 0x{:02x} \"{}\" \"{}\" serial {}",
                desc.device_index,
                desc.vendor_id,
                desc.product_id,
                desc.interface_number,
                desc.vendor_name,
                desc.product_name,
                desc.serial_number
            )?;
        }
    }

    Ok(devices.len())
}
