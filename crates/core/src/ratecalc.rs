//! Per-stream rate calculator with 1 Hz smoothing and class-based burst
//! allocation. One `Ratecalc` is held per active transfer or hashing
//! stream; the registry that sweeps all of them once a second lives in
//! the engine's `Runtime` as process-scoped state, but the smoothing and
//! burst-recharge math is self contained here.
use parking_lot::Mutex;

/// The three bandwidth classes a stream can belong to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Class {
    Hash,
    Upload,
    Download,
}

struct Inner {
    total: u64,
    last: u64,
    rate: f64,
    burst: i64,
}

pub struct Ratecalc {
    class: Class,
    inner: Mutex<Inner>,
}

impl Ratecalc {
    pub fn new(class: Class) -> Self {
        Self {
            class,
            inner: Mutex::new(Inner {
                total: 0,
                last: 0,
                rate: 0.0,
                burst: 0,
            }),
        }
    }

    pub fn class(&self) -> Class {
        self.class
    }

    /// Record `n` bytes transferred. Safe to call from any thread.
    pub fn add(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.total += n;
        inner.burst -= n as i64;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().rate
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn burst(&self) -> i64 {
        self.inner.lock().burst
    }

    /// `rate ← diff + (rate - diff)/2` where `diff = total - last`. Must be
    /// invoked by the single-threaded sweeper, once per second, for every
    /// registered ratecalc.
    pub fn sweep_rate(&self) {
        let mut inner = self.inner.lock();
        let diff = inner.total as i64 - inner.last as i64;
        inner.rate = diff as f64 + (inner.rate - diff as f64) / 2.0;
        inner.last = inner.total;
    }
}

/// Recharge the bursts of every member of one class. `cap` is the class's
/// configured bandwidth cap in bytes/second; `None` means unbounded, in
/// which case every member's burst is simply lifted out of deficit.
///
/// First repays members currently in deficit (`burst < 0`) out of the
/// shared budget; remaining budget is then fanned, in up to three bounded
/// passes, to members still below the class cap.
pub fn sweep_class_bursts(cap: Option<u64>, members: &[&Ratecalc]) {
    let cap = match cap {
        Some(c) => c as i64,
        None => {
            for m in members {
                let mut inner = m.inner.lock();
                inner.burst = inner.burst.max(0);
            }
            return;
        }
    };

    let mut budget = cap;

    for m in members {
        if budget <= 0 {
            break;
        }
        let mut inner = m.inner.lock();
        if inner.burst < 0 {
            let need = (-inner.burst).min(budget);
            inner.burst += need;
            budget -= need;
        }
    }

    for _pass in 0..3 {
        if budget <= 0 {
            break;
        }
        let needy: Vec<&&Ratecalc> = members
            .iter()
            .filter(|m| m.inner.lock().burst < cap)
            .collect();
        if needy.is_empty() {
            break;
        }
        let share = (budget / needy.len() as i64).max(1);
        for m in needy {
            if budget <= 0 {
                break;
            }
            let mut inner = m.inner.lock();
            let room = cap - inner.burst;
            let give = share.min(room).min(budget);
            if give > 0 {
                inner.burst += give;
                budget -= give;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_smoothing_matches_formula() {
        let rc = Ratecalc::new(Class::Download);
        rc.add(100);
        rc.sweep_rate();
        // diff = 100 - 0 = 100; rate = 100 + (0-100)/2 = 50
        assert_eq!(rc.rate(), 50.0);

        rc.add(100);
        rc.sweep_rate();
        // total=200, last=100, diff=100; rate = 100 + (50-100)/2 = 75
        assert_eq!(rc.rate(), 75.0);
    }

    #[test]
    fn add_and_sweep_are_independent_of_order_of_many_small_adds() {
        let rc = Ratecalc::new(Class::Upload);
        for _ in 0..10 {
            rc.add(10);
        }
        assert_eq!(rc.total(), 100);
    }

    #[test]
    fn burst_recharge_repays_deficit_first() {
        let a = Ratecalc::new(Class::Upload);
        let b = Ratecalc::new(Class::Upload);
        a.add(50); // burst now -50
        sweep_class_bursts(Some(30), &[&a, &b]);
        assert_eq!(a.burst(), -20);
        assert_eq!(b.burst(), 0);
    }

    #[test]
    fn burst_recharge_fans_remaining_budget() {
        let a = Ratecalc::new(Class::Upload);
        let b = Ratecalc::new(Class::Upload);
        sweep_class_bursts(Some(40), &[&a, &b]);
        assert_eq!(a.burst() + b.burst(), 40);
    }

    #[test]
    fn unbounded_class_never_throttles() {
        let a = Ratecalc::new(Class::Hash);
        a.add(1_000_000);
        sweep_class_bursts(None, &[&a]);
        assert!(a.burst() >= 0);
    }
}
