//! Download bandwidth limiter.
//!
//! A fixed one-second window: the budget starts empty, refills to the cap at
//! every window boundary, and unused budget does not carry over. So no window
//! ever grants more than the cap, and sustained throughput stays at or below it.
//! `acquire(n)` for `n` larger than the cap takes what the current window has
//! left and waits for the following windows for the rest.
//!
//! Time comes from `tokio::time::Instant`, so a paused test clock drives it.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    start: Instant,
    granted: u64,
}

#[derive(Debug)]
struct State {
    window: Option<Window>,
    peak_window_bytes: u64,
    total_granted: u64,
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    cap: u64,
    origin: Instant,
    state: Mutex<State>,
}

impl BandwidthLimiter {
    /// `cap_bytes_per_sec == 0` disables limiting.
    pub fn new(cap_bytes_per_sec: u64) -> Self {
        Self {
            cap: cap_bytes_per_sec,
            origin: Instant::now(),
            state: Mutex::new(State {
                window: None,
                peak_window_bytes: 0,
                total_granted: 0,
            }),
        }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn is_unlimited(&self) -> bool {
        self.cap == 0
    }

    /// Waits until `bytes` of budget have been granted.
    pub async fn acquire(&self, bytes: u64) {
        if self.is_unlimited() {
            let mut st = self.state.lock().await;
            st.total_granted += bytes;
            return;
        }

        let mut remaining = bytes;
        // Accrual starts from zero: the first grant happens at the end of the
        // window the request arrived in.
        let mut st = self.state.lock().await;
        while remaining > 0 {
            let now = Instant::now();
            let current = self.window_start(now);
            let window = match st.window.take() {
                Some(w) if w.start == current => w,
                Some(_) => Window {
                    start: current,
                    granted: 0,
                },
                None => {
                    // Nothing accrued yet.
                    let next = current + WINDOW;
                    st.window = Some(Window {
                        start: next,
                        granted: 0,
                    });
                    tokio::time::sleep_until(next).await;
                    continue;
                }
            };
            let available = self.cap - window.granted.min(self.cap);
            if available == 0 {
                let next = window.start + WINDOW;
                st.window = Some(window);
                tokio::time::sleep_until(next).await;
                continue;
            }
            let take = available.min(remaining);
            let granted = window.granted + take;
            st.peak_window_bytes = st.peak_window_bytes.max(granted);
            st.total_granted += take;
            st.window = Some(Window {
                start: window.start,
                granted,
            });
            remaining -= take;
        }
    }

    fn window_start(&self, now: Instant) -> Instant {
        let elapsed = now.duration_since(self.origin);
        let windows = elapsed.as_nanos() / WINDOW.as_nanos();
        self.origin + WINDOW * windows as u32
    }

    /// Largest amount granted within one window so far.
    pub async fn peak_window_bytes(&self) -> u64 {
        self.state.lock().await.peak_window_bytes
    }

    pub async fn total_granted(&self) -> u64 {
        self.state.lock().await.total_granted
    }
}
