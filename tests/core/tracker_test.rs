/*!
 * Resource Tracker Tests
 */

use msgport::core::guard::{Reclaim, ResourceKind, ResourceTracker};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Logged {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Reclaim for Logged {
    fn reclaim(self: Box<Self>) {
        self.log.lock().push(self.name);
    }
}

fn logged(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Logged {
    Logged {
        name,
        log: log.clone(),
    }
}

#[test]
fn test_cleanup_runs_newest_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tracker = ResourceTracker::new(8);

    tracker.track_or_reclaim(ResourceKind::Endpoint, "endpoint", logged("endpoint", &log)).unwrap();
    tracker.track_or_reclaim(ResourceKind::Queue, "queue", logged("queue", &log)).unwrap();
    tracker.track_or_reclaim(ResourceKind::Thread, "thread", logged("thread", &log)).unwrap();

    assert_eq!(tracker.cleanup_all(), 3);
    assert_eq!(*log.lock(), vec!["thread", "queue", "endpoint"]);

    assert_eq!(tracker.cleanup_all(), 0);
    assert_eq!(log.lock().len(), 3);
}

#[test]
fn test_removed_entry_skipped_and_others_kept_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tracker = ResourceTracker::new(8);

    tracker.track_or_reclaim(ResourceKind::Memory, "a", logged("a", &log)).unwrap();
    let b = tracker.track_or_reclaim(ResourceKind::Memory, "b", logged("b", &log)).unwrap();
    tracker.track_or_reclaim(ResourceKind::Memory, "c", logged("c", &log)).unwrap();

    assert!(tracker.remove(b));
    assert_eq!(tracker.len(), 2);
    tracker.cleanup_all();
    assert_eq!(*log.lock(), vec!["c", "a"]);
}

#[test]
fn test_drop_unwinds_remaining() {
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let tracker = ResourceTracker::new(2);
        tracker.track_or_reclaim(ResourceKind::Pool, "first", logged("first", &log)).unwrap();
        tracker.track_or_reclaim(ResourceKind::Lock, "second", logged("second", &log)).unwrap();
    }
    assert_eq!(*log.lock(), vec!["second", "first"]);
}

#[test]
fn test_track_hands_back_rejected_resource() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tracker = ResourceTracker::new(1);
    tracker.track(ResourceKind::Custom, "kept", logged("kept", &log)).ok().unwrap();

    let (err, rejected) = match tracker.track(ResourceKind::Custom, "extra", logged("extra", &log)) {
        Err(rejected) => rejected,
        Ok(_) => panic!("tracker accepted past capacity"),
    };
    assert_eq!(err.status(), msgport::StatusCode::NO_MEMORY);
    assert_eq!(rejected.name, "extra");
    assert!(log.lock().is_empty());
}
