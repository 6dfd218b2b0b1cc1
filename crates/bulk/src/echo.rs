//! Loop-back echo test
//!
//! Each iteration writes one packet and reads the echo back; the first
//! mismatch aborts the run. There are no retries.
//!
//! A fixed run repeats one packet size. A size sweep steps the packet size
//! from 1 to the maximum on every pass and always compares the data.

use crate::backend::BulkChannel;
use crate::error::BulkError;
use crate::session::Session;
use crate::types::{MAX_PACKET_SIZE, Packet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default bytes per echo packet
pub const DEFAULT_PAYLOAD_LEN: usize = 1;

/// How packet sizes are chosen across a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EchoMode {
    /// Every packet is `payload_len` bytes
    #[default]
    Fixed,
    /// Iteration `i` sends `(i - 1) % payload_len + 1` bytes
    Sweep,
}

/// Echo test parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoTest {
    /// Write/read pairs to perform
    pub repeats: u32,
    /// Bytes per packet (1..=64), the largest size in a sweep
    pub payload_len: usize,
    /// Compare echoed bytes, not just the count
    pub verify_data: bool,
    pub mode: EchoMode,
}

/// Why an echo run stopped early
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EchoFailure {
    /// The device accepted fewer bytes than written
    #[error("iteration {iteration}: short write, expected {expected}, wrote {actual}")]
    ShortWrite {
        iteration: u32,
        expected: usize,
        actual: usize,
    },
    /// The echo had the wrong length; a read timeout counts as 0
    #[error("iteration {iteration}: expected {expected}, got {actual}")]
    CountMismatch {
        iteration: u32,
        expected: usize,
        actual: usize,
    },
    /// The echo differed from the payload
    #[error("iteration {iteration}: byte {offset} expected {expected:#04x}, got {actual:#04x}")]
    DataMismatch {
        iteration: u32,
        offset: usize,
        expected: u8,
        actual: u8,
    },
    #[error("iteration {iteration}: {error}")]
    Transfer { iteration: u32, error: BulkError },
}

impl EchoFailure {
    /// 1-based iteration that failed
    pub fn iteration(&self) -> u32 {
        match self {
            EchoFailure::ShortWrite { iteration, .. }
            | EchoFailure::CountMismatch { iteration, .. }
            | EchoFailure::DataMismatch { iteration, .. }
            | EchoFailure::Transfer { iteration, .. } => *iteration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoOutcome {
    Passed,
    Failed(EchoFailure),
}

/// Result of one echo run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReport {
    /// Iterations asked for
    pub requested: u32,
    /// Iterations that passed
    pub completed: u32,
    /// Payload bytes echoed by the passed iterations
    pub bytes: u64,
    /// Wall time from the first write to the end of the run
    pub elapsed: Duration,
    pub outcome: EchoOutcome,
}

impl EchoReport {
    /// Echoed payload bytes per second, None before anything was measured
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if self.bytes == 0 || secs <= 0.0 {
            return None;
        }
        Some(self.bytes as f64 / secs)
    }

    pub fn passed(&self) -> bool {
        self.outcome == EchoOutcome::Passed
    }

    pub fn failure(&self) -> Option<&EchoFailure> {
        match &self.outcome {
            EchoOutcome::Passed => None,
            EchoOutcome::Failed(failure) => Some(failure),
        }
    }
}

impl EchoTest {
    /// `repeats` single-byte echoes, count check only
    pub fn new(repeats: u32) -> Self {
        Self {
            repeats,
            payload_len: DEFAULT_PAYLOAD_LEN,
            verify_data: false,
            mode: EchoMode::Fixed,
        }
    }

    /// `passes` sweeps over every packet size from 1 to 64 bytes, data checked
    pub fn size_sweep(passes: u32) -> Self {
        Self {
            repeats: passes.saturating_mul(MAX_PACKET_SIZE as u32),
            payload_len: MAX_PACKET_SIZE,
            verify_data: true,
            mode: EchoMode::Sweep,
        }
    }

    /// Set the packet size, clamped to 1..=64
    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len.clamp(1, MAX_PACKET_SIZE);
        self
    }

    pub fn with_verify_data(mut self, verify_data: bool) -> Self {
        self.verify_data = verify_data;
        self
    }

    /// Packet size of a 1-based iteration
    pub fn len_for(&self, iteration: u32) -> usize {
        match self.mode {
            EchoMode::Fixed => self.payload_len,
            EchoMode::Sweep => (iteration.saturating_sub(1) as usize % self.payload_len) + 1,
        }
    }

    /// Run the test on an open session
    ///
    /// `progress` is called with the number of completed iterations after
    /// each one passes.
    pub fn run<C, F>(&self, session: &mut Session<C>, mut progress: F) -> EchoReport
    where
        C: BulkChannel,
        F: FnMut(u32),
    {
        info!(
            "Starting echo test on device {}: {} x {} byte(s), {:?}",
            session.index(),
            self.repeats,
            self.payload_len,
            self.mode
        );

        let payload = Packet::pattern();
        let mut echo = Packet::zeroed();
        let mut completed = 0;
        let mut bytes = 0u64;
        let started = Instant::now();

        for iteration in 1..=self.repeats {
            if let Err(failure) = self.iteration(session, iteration, &payload, &mut echo) {
                warn!("Echo test failed: {}", failure);
                return EchoReport {
                    requested: self.repeats,
                    completed,
                    bytes,
                    elapsed: started.elapsed(),
                    outcome: EchoOutcome::Failed(failure),
                };
            }
            completed = iteration;
            bytes += self.len_for(iteration) as u64;
            progress(completed);
        }

        let elapsed = started.elapsed();
        info!(
            "Echo test passed ({} iterations, {} bytes in {:?})",
            completed, bytes, elapsed
        );
        EchoReport {
            requested: self.repeats,
            completed,
            bytes,
            elapsed,
            outcome: EchoOutcome::Passed,
        }
    }

    fn iteration<C: BulkChannel>(
        &self,
        session: &mut Session<C>,
        iteration: u32,
        payload: &Packet,
        echo: &mut Packet,
    ) -> Result<(), EchoFailure> {
        let len = self.len_for(iteration);

        let written = session
            .write(payload.as_bytes(), len)
            .map_err(|error| EchoFailure::Transfer { iteration, error })?;
        if written != len {
            return Err(EchoFailure::ShortWrite {
                iteration,
                expected: len,
                actual: written,
            });
        }

        let received = match session.read(echo.as_mut_bytes(), len) {
            Ok(n) => n,
            Err(e) if e.is_timeout() => 0,
            Err(error) => return Err(EchoFailure::Transfer { iteration, error }),
        };
        if received != len {
            return Err(EchoFailure::CountMismatch {
                iteration,
                expected: len,
                actual: received,
            });
        }

        if self.verify_data
            && let Some(offset) = (0..len).find(|&i| echo.as_bytes()[i] != payload.as_bytes()[i])
        {
            return Err(EchoFailure::DataMismatch {
                iteration,
                offset,
                expected: payload.as_bytes()[offset],
                actual: echo.as_bytes()[offset],
            });
        }

        debug!("Echo iteration {} ok", iteration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::session::SessionOptions;
    use crate::test_utils::{EchoBehavior, FakeBackend, FakeChannel, FakeDevice};
    use crate::types::{DeviceIndex, DeviceKey};
    use std::time::Duration;

    struct Bench {
        backend: FakeBackend,
        key: DeviceKey,
        session: Session<FakeChannel>,
        _registry: Registry<FakeBackend>,
    }

    fn bench(behavior: EchoBehavior) -> Bench {
        let backend = FakeBackend::new();
        let key = backend.plug(FakeDevice::echo(0x8765, 0x1234).with_behavior(behavior));
        let registry = Registry::new(backend.clone());
        registry.add_allowed_device(0x8765, 0x1234);
        let options = SessionOptions {
            read_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(50),
            cancel: None,
        };
        let session = Session::open(&registry, DeviceIndex(0), options).unwrap();
        Bench {
            backend,
            key,
            session,
            _registry: registry,
        }
    }

    #[test]
    fn test_conformant_device_passes() {
        let mut bench = bench(EchoBehavior::Echo);
        let mut ticks = Vec::new();

        let report = EchoTest::new(5).run(&mut bench.session, |n| ticks.push(n));

        assert!(report.passed());
        assert_eq!(report.requested, 5);
        assert_eq!(report.completed, 5);
        assert_eq!(report.bytes, 5);
        assert_eq!(ticks, vec![1, 2, 3, 4, 5]);
        let counts = bench.backend.transfer_counts(bench.key);
        assert_eq!(counts.writes, 5);
        assert_eq!(counts.reads, 5);
    }

    #[test]
    fn test_silent_device_aborts_without_retry() {
        let mut bench = bench(EchoBehavior::SilentAfter(3));

        let report = EchoTest::new(10).run(&mut bench.session, |_| {});

        assert_eq!(report.completed, 3);
        assert_eq!(report.bytes, 3);
        assert!(report.elapsed >= Duration::from_millis(20));
        let failure = report.failure().unwrap();
        assert_eq!(
            *failure,
            EchoFailure::CountMismatch {
                iteration: 4,
                expected: 1,
                actual: 0,
            }
        );
        assert!(failure.to_string().contains("expected 1, got 0"));
        assert_eq!(bench.backend.transfer_counts(bench.key).writes, 4);
    }

    #[test]
    fn test_short_write_aborts() {
        let mut bench = bench(EchoBehavior::ShortWrite(4));

        let report = EchoTest::new(3)
            .with_payload_len(8)
            .run(&mut bench.session, |_| {});

        assert_eq!(
            report.outcome,
            EchoOutcome::Failed(EchoFailure::ShortWrite {
                iteration: 1,
                expected: 8,
                actual: 4,
            })
        );
        assert_eq!(report.completed, 0);
    }

    #[test]
    fn test_corruption_needs_verify_data() {
        let mut bench = bench(EchoBehavior::Corrupt);
        let count_only = EchoTest::new(2).with_payload_len(4).run(&mut bench.session, |_| {});
        assert!(count_only.passed());

        let verified = EchoTest::new(2)
            .with_payload_len(4)
            .with_verify_data(true)
            .run(&mut bench.session, |_| {});
        assert_eq!(
            verified.failure(),
            Some(&EchoFailure::DataMismatch {
                iteration: 1,
                offset: 0,
                expected: 0x00,
                actual: 0xff,
            })
        );
    }

    #[test]
    fn test_closed_session_is_transfer_failure() {
        let mut bench = bench(EchoBehavior::Echo);
        bench.session.close();

        let report = EchoTest::new(1).run(&mut bench.session, |_| {});
        let failure = report.failure().unwrap();
        assert_eq!(failure.iteration(), 1);
        assert!(matches!(failure, EchoFailure::Transfer { .. }));
    }

    #[test]
    fn test_zero_repeats_passes() {
        let mut bench = bench(EchoBehavior::Echo);
        let report = EchoTest::new(0).run(&mut bench.session, |_| {});
        assert!(report.passed());
        assert_eq!(bench.backend.transfer_counts(bench.key).writes, 0);
    }

    #[test]
    fn test_size_sweep_covers_every_length() {
        let mut bench = bench(EchoBehavior::Echo);
        let test = EchoTest::size_sweep(2);
        assert_eq!(test.repeats, 128);
        assert!(test.verify_data);

        let report = test.run(&mut bench.session, |_| {});

        assert!(report.passed());
        assert_eq!(report.completed, 128);
        assert_eq!(report.bytes, 2 * (1..=64u64).sum::<u64>());
        assert_eq!(bench.backend.transfer_counts(bench.key).writes, 128);
    }

    #[test]
    fn test_size_sweep_lengths() {
        let sweep = EchoTest::size_sweep(1);
        assert_eq!(sweep.len_for(1), 1);
        assert_eq!(sweep.len_for(64), 64);
        assert_eq!(sweep.len_for(65), 1);

        let fixed = EchoTest::new(3).with_payload_len(8);
        assert_eq!(fixed.len_for(1), 8);
        assert_eq!(fixed.len_for(3), 8);
    }

    #[test]
    fn test_size_sweep_stops_at_first_short_write() {
        let mut bench = bench(EchoBehavior::ShortWrite(4));

        let report = EchoTest::size_sweep(1).run(&mut bench.session, |_| {});

        assert_eq!(report.completed, 4);
        assert_eq!(report.bytes, 1 + 2 + 3 + 4);
        assert_eq!(
            report.failure(),
            Some(&EchoFailure::ShortWrite {
                iteration: 5,
                expected: 5,
                actual: 4,
            })
        );
    }

    #[test]
    fn test_size_sweep_detects_corruption() {
        let mut bench = bench(EchoBehavior::Corrupt);

        let report = EchoTest::size_sweep(1).run(&mut bench.session, |_| {});

        assert_eq!(report.completed, 0);
        assert!(matches!(
            report.failure(),
            Some(EchoFailure::DataMismatch { iteration: 1, .. })
        ));
    }

    #[test]
    fn test_throughput() {
        let mut report = EchoReport {
            requested: 1,
            completed: 1,
            bytes: 4096,
            elapsed: Duration::from_secs(2),
            outcome: EchoOutcome::Passed,
        };
        assert_eq!(report.throughput(), Some(2048.0));

        report.elapsed = Duration::ZERO;
        assert_eq!(report.throughput(), None);

        report.elapsed = Duration::from_secs(1);
        report.bytes = 0;
        assert_eq!(report.throughput(), None);
    }

    #[test]
    fn test_payload_len_clamped() {
        assert_eq!(EchoTest::new(1).with_payload_len(0).payload_len, 1);
        assert_eq!(EchoTest::new(1).with_payload_len(500).payload_len, 64);
    }
}
