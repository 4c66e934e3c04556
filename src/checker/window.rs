use parking_lot::Mutex;

/// Why a check decision is currently frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freeze {
    Suspended,
    TopologyChanged,
}

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    suspended_at: i64,
    topology_changed_at: i64,
}

/// Moments after which unhealthy verdicts are held back for one expiry
/// window: an explicit suspend, or a change of peers or leader.
#[derive(Debug, Default)]
pub struct SuppressionMarks {
    marks: Mutex<Marks>,
}

fn within(mark: i64, now: i64, expire_sec: i64) -> bool {
    mark > 0 && now >= mark && now - mark < expire_sec
}

impl SuppressionMarks {
    pub fn suspend(&self, now: i64) {
        self.marks.lock().suspended_at = now;
    }

    pub fn mark_topology_change(&self, now: i64) {
        self.marks.lock().topology_changed_at = now;
    }

    pub fn suspended_at(&self) -> i64 {
        self.marks.lock().suspended_at
    }

    pub fn topology_changed_at(&self) -> i64 {
        self.marks.lock().topology_changed_at
    }

    pub fn active(&self, now: i64, expire_sec: i64) -> Option<Freeze> {
        let marks = *self.marks.lock();

        if within(marks.suspended_at, now, expire_sec) {
            Some(Freeze::Suspended)
        } else if within(marks.topology_changed_at, now, expire_sec) {
            Some(Freeze::TopologyChanged)
        } else {
            None
        }
    }
}
