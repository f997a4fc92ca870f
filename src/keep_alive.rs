use embedded_time::duration::Milliseconds;

pub(crate) struct KeepAlive {
    interval: u64,
    last_activity: u64,
    ping_outstanding: bool,
}

impl KeepAlive {
    /// `keep_alive` is in seconds as carried by CONNECT; `0` disables it.
    pub(crate) fn new(keep_alive: u16, now: Milliseconds<u64>) -> Self {
        Self {
            interval: u64::from(keep_alive) * 1_000,
            last_activity: now.0,
            ping_outstanding: false,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.interval != 0
    }

    pub(crate) fn tick(&self) -> Option<u32> {
        if !self.enabled() {
            return None;
        }

        Some(u32::try_from(self.interval / 2).unwrap_or(u32::MAX).max(1))
    }

    pub(crate) fn on_send(&mut self, now: Milliseconds<u64>) {
        self.last_activity = now.0;
    }

    pub(crate) fn on_receive(&mut self, now: Milliseconds<u64>) {
        self.last_activity = now.0;
        self.ping_outstanding = false;
    }

    pub(crate) fn should_ping(&mut self, now: Milliseconds<u64>) -> bool {
        if !self.enabled() || self.ping_outstanding {
            return false;
        }

        if self.elapsed(now) >= self.interval / 2 {
            self.ping_outstanding = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn timed_out(&self, now: Milliseconds<u64>) -> bool {
        if !self.enabled() || !self.ping_outstanding {
            return false;
        }

        self.elapsed(now) >= self.interval
    }

    fn elapsed(&self, now: Milliseconds<u64>) -> u64 {
        now.0.saturating_sub(self.last_activity)
    }
}
