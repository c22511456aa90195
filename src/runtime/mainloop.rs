//! Single-threaded poll(2) loop with fd watches and periodic timers.

use super::{Callback, EventLoop, QuitHandle, WatchId};
use crate::config::types::{DaemonError, Result};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

enum Trigger {
    Readable(RawFd),
    Timer { period: Duration, due: Instant },
}

struct Source {
    id: WatchId,
    trigger: Trigger,
    callback: Callback,
}

#[derive(Default)]
pub struct Mainloop {
    sources: Vec<Source>,
    next_id: u64,
    quit: QuitHandle,
}

impl Mainloop {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, trigger: Trigger, callback: Callback) -> WatchId {
        self.next_id += 1;
        let id = WatchId(self.next_id);
        self.sources.push(Source {
            id,
            trigger,
            callback,
        });
        id
    }

    /// Milliseconds until the earliest timer, rounded up; -1 if there is none.
    /// Never 0 while a timer is still pending.
    fn poll_timeout(&self, now: Instant) -> libc::c_int {
        self.sources
            .iter()
            .filter_map(|s| match s.trigger {
                Trigger::Timer { due, .. } => Some(due.saturating_duration_since(now)),
                Trigger::Readable(_) => None,
            })
            .min()
            .map(|d| ((d.as_micros() + 999) / 1000).min(i32::MAX as u128) as libc::c_int)
            .unwrap_or(-1)
    }

    fn iterate(&mut self) -> Result<()> {
        let timeout = self.poll_timeout(Instant::now());
        let mut fds: Vec<libc::pollfd> = self
            .sources
            .iter()
            .filter_map(|s| match s.trigger {
                Trigger::Readable(fd) => Some(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                }),
                Trigger::Timer { .. } => None,
            })
            .collect();

        // SAFETY: `fds` is a live, correctly sized array of pollfd for the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(DaemonError::EventLoop(format!("poll failed: {}", err)));
        }

        let ready: Vec<RawFd> = fds
            .iter()
            .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|p| p.fd)
            .collect();

        let now = Instant::now();
        for source in &mut self.sources {
            let fire = match &mut source.trigger {
                Trigger::Readable(fd) => ready.contains(fd),
                Trigger::Timer { period, due } => {
                    if *due <= now {
                        *due = now + *period;
                        true
                    } else {
                        false
                    }
                }
            };
            if fire {
                (source.callback)();
            }
            if self.quit.requested().is_some() {
                break;
            }
        }
        Ok(())
    }
}

impl EventLoop for Mainloop {
    fn quit_handle(&self) -> QuitHandle {
        self.quit.clone()
    }

    fn watch_readable(&mut self, fd: RawFd, callback: Callback) -> Result<WatchId> {
        if fd < 0 {
            return Err(DaemonError::EventLoop(format!("invalid fd {}", fd)));
        }
        Ok(self.register(Trigger::Readable(fd), callback))
    }

    fn add_timer(&mut self, period: Duration, callback: Callback) -> Result<WatchId> {
        if period.is_zero() {
            return Err(DaemonError::EventLoop("timer period must be non-zero".to_string()));
        }
        let due = Instant::now() + period;
        Ok(self.register(Trigger::Timer { period, due }, callback))
    }

    fn remove(&mut self, id: WatchId) {
        self.sources.retain(|s| s.id != id);
    }

    fn run(&mut self) -> Result<i32> {
        log::debug!("Entering main loop with {} sources", self.sources.len());
        loop {
            if let Some(code) = self.quit.requested() {
                log::debug!("Main loop exiting with code {}", code);
                return Ok(code);
            }
            if self.sources.is_empty() {
                return Err(DaemonError::EventLoop(
                    "main loop has nothing to wait for".to_string(),
                ));
            }
            self.iterate()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn timer_fires_until_quit() {
        let mut mainloop = Mainloop::new();
        let quit = mainloop.quit_handle();
        let ticks = Rc::new(Cell::new(0));
        let counter = ticks.clone();
        mainloop
            .add_timer(
                Duration::from_millis(5),
                Box::new(move || {
                    counter.set(counter.get() + 1);
                    if counter.get() == 3 {
                        quit.quit(7);
                    }
                }),
            )
            .unwrap();

        assert_eq!(mainloop.run().unwrap(), 7);
        assert_eq!(ticks.get(), 3);
    }

    #[test]
    fn sub_millisecond_wait_is_not_a_zero_timeout() {
        let mut mainloop = Mainloop::new();
        assert_eq!(mainloop.poll_timeout(Instant::now()), -1);

        let start = Instant::now();
        mainloop
            .add_timer(Duration::from_micros(300), Box::new(|| {}))
            .unwrap();
        assert!(mainloop.poll_timeout(start) >= 1);
        assert_eq!(mainloop.poll_timeout(start + Duration::from_secs(1)), 0);
    }

    #[test]
    fn readable_fd_dispatches() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        nix::unistd::write(write_end, b"x").unwrap();

        let mut mainloop = Mainloop::new();
        let quit = mainloop.quit_handle();
        mainloop
            .watch_readable(read_end, Box::new(move || quit.quit(0)))
            .unwrap();
        assert_eq!(mainloop.run().unwrap(), 0);

        nix::unistd::close(read_end).unwrap();
        nix::unistd::close(write_end).unwrap();
    }

    #[test]
    fn empty_loop_is_an_error() {
        let mut mainloop = Mainloop::new();
        assert!(matches!(mainloop.run(), Err(DaemonError::EventLoop(_))));
    }

    #[test]
    fn removed_timer_no_longer_fires() {
        let mut mainloop = Mainloop::new();
        let quit = mainloop.quit_handle();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let id = mainloop
            .add_timer(Duration::from_millis(1), Box::new(move || flag.set(true)))
            .unwrap();
        mainloop.remove(id);
        mainloop
            .add_timer(Duration::from_millis(10), Box::new(move || quit.quit(0)))
            .unwrap();
        mainloop.run().unwrap();
        assert!(!fired.get());
    }
}
