//! CPU load watchdog: stops a daemon that spins on the CPU.

use crate::config::types::{DaemonError, Result};
use crate::core::signals::{ShutdownReason, ShutdownState};
use crate::runtime::{EventLoop, WatchId};
use std::time::{Duration, Instant};

pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

/// Fraction of wall time the process may spend on the CPU
pub const CPU_LIMIT_RATIO: f64 = 0.70;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpuSample {
    pub cpu: Duration,
    pub wall: Instant,
}

impl CpuSample {
    pub fn now() -> Result<Self> {
        Ok(Self {
            cpu: process_cpu_time()?,
            wall: Instant::now(),
        })
    }

    /// CPU share of wall time between `self` and `later`
    pub fn load_until(&self, later: &CpuSample) -> f64 {
        let wall = later.wall.saturating_duration_since(self.wall).as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        later.cpu.saturating_sub(self.cpu).as_secs_f64() / wall
    }
}

fn process_cpu_time() -> Result<Duration> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage fills the zeroed struct for RUSAGE_SELF.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::EventLoop(format!("getrusage failed: {}", err)));
    }
    // SAFETY: initialised by the successful call above.
    let usage = unsafe { usage.assume_init() };
    let tv = |t: libc::timeval| {
        Duration::from_secs(t.tv_sec.max(0) as u64) + Duration::from_micros(t.tv_usec.max(0) as u64)
    };
    Ok(tv(usage.ru_utime) + tv(usage.ru_stime))
}

/// Register the periodic check on `event_loop`.
pub fn install(event_loop: &mut dyn EventLoop, shutdown: ShutdownState) -> Result<WatchId> {
    let quit = event_loop.quit_handle();
    let mut last = CpuSample::now()?;
    event_loop.add_timer(
        WATCHDOG_PERIOD,
        Box::new(move || {
            let current = match CpuSample::now() {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("{}", e);
                    return;
                }
            };
            let load = last.load_until(&current);
            last = current;
            if load > CPU_LIMIT_RATIO {
                log::error!(
                    "CPU load {:.0}% over the last {}s exceeds {:.0}%, terminating",
                    load * 100.0,
                    WATCHDOG_PERIOD.as_secs(),
                    CPU_LIMIT_RATIO * 100.0
                );
                shutdown.request(ShutdownReason::CpuOverload, &quit);
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_cpu_over_wall() {
        let start = Instant::now();
        let a = CpuSample {
            cpu: Duration::from_secs(1),
            wall: start,
        };
        let b = CpuSample {
            cpu: Duration::from_secs(9),
            wall: start + Duration::from_secs(10),
        };
        assert!((a.load_until(&b) - 0.8).abs() < 1e-9);
        assert!(a.load_until(&b) > CPU_LIMIT_RATIO);
    }

    #[test]
    fn zero_wall_time_is_no_load() {
        let sample = CpuSample {
            cpu: Duration::from_secs(5),
            wall: Instant::now(),
        };
        assert_eq!(sample.load_until(&sample), 0.0);
    }

    #[test]
    fn cpu_time_is_monotonic() {
        let a = CpuSample::now().unwrap();
        let b = CpuSample::now().unwrap();
        assert!(b.cpu >= a.cpu);
    }
}
