//! Integration test: PollLoop dispatch semantics.
//!
//! Covers watch removal (including from inside callbacks), nested iteration,
//! run/quit and child-exit delivery.
//!
//! Run: cargo test -p warden-runtime --test event_loop_test

use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::time::{Duration, Instant};

use warden_core::ExitStatus;
use warden_runtime::{
    EventLoop, PRIORITY_DEFAULT, PRIORITY_DEFAULT_IDLE, PRIORITY_HIGH, PollLoop, WatchId,
};

fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
    let c = Rc::new(Cell::new(0));
    (Rc::clone(&c), c)
}

#[test]
fn double_remove_returns_false() {
    let lp = PollLoop::new();
    let id = lp.add_timeout(
        Duration::from_secs(60),
        PRIORITY_DEFAULT,
        Box::new(|| ControlFlow::Continue(())),
    );
    assert!(lp.remove(id));
    assert!(!lp.remove(id));
    assert!(lp.is_empty());
}

#[test]
fn callback_removing_itself_fires_once() {
    let lp = Rc::new(PollLoop::new());
    let (hits, seen) = counter();
    let own_id: Rc<Cell<Option<WatchId>>> = Rc::new(Cell::new(None));

    let weak = Rc::downgrade(&lp);
    let slot = Rc::clone(&own_id);
    let id = lp.add_idle(
        PRIORITY_DEFAULT,
        Box::new(move || {
            hits.set(hits.get() + 1);
            if let (Some(lp), Some(id)) = (weak.upgrade(), slot.get()) {
                assert!(lp.remove(id));
                assert!(!lp.remove(id));
            }
            // Asking to continue after self-removal must not resurrect it.
            ControlFlow::Continue(())
        }),
    );
    own_id.set(Some(id));

    assert!(lp.iterate(false));
    assert!(!lp.iterate(false));
    assert!(!lp.iterate(false));
    assert_eq!(seen.get(), 1);
    assert!(!lp.contains(id));
}

#[test]
fn callback_removing_a_sibling_prevents_its_dispatch() {
    let lp = Rc::new(PollLoop::new());
    let (second_hits, second_seen) = counter();
    let victim: Rc<Cell<Option<WatchId>>> = Rc::new(Cell::new(None));

    let weak = Rc::downgrade(&lp);
    let target = Rc::clone(&victim);
    lp.add_idle(
        PRIORITY_DEFAULT,
        Box::new(move || {
            if let (Some(lp), Some(id)) = (weak.upgrade(), target.get()) {
                lp.remove(id);
            }
            ControlFlow::Break(())
        }),
    );
    let id = lp.add_idle(
        PRIORITY_DEFAULT,
        Box::new(move || {
            second_hits.set(second_hits.get() + 1);
            ControlFlow::Break(())
        }),
    );
    victim.set(Some(id));

    assert!(lp.iterate(false));
    assert!(!lp.iterate(false));
    assert_eq!(second_seen.get(), 0);
}

#[test]
fn nested_iteration_skips_the_running_callback() {
    let lp = Rc::new(PollLoop::new());
    let (outer_hits, outer_seen) = counter();
    let (inner_hits, inner_seen) = counter();

    let weak = Rc::downgrade(&lp);
    lp.add_idle(
        PRIORITY_HIGH,
        Box::new(move || {
            outer_hits.set(outer_hits.get() + 1);
            if let Some(lp) = weak.upgrade() {
                // Only the lower-priority idle can run in here.
                assert!(lp.iterate(false));
                assert!(!lp.iterate(false));
            }
            ControlFlow::Break(())
        }),
    );
    lp.add_idle(
        PRIORITY_DEFAULT_IDLE,
        Box::new(move || {
            inner_hits.set(inner_hits.get() + 1);
            ControlFlow::Break(())
        }),
    );

    assert!(lp.iterate(false));
    assert_eq!(outer_seen.get(), 1);
    assert_eq!(inner_seen.get(), 1);
    assert!(lp.is_empty());
}

#[test]
fn run_returns_after_quit() {
    let lp = Rc::new(PollLoop::new());
    let weak = Rc::downgrade(&lp);
    let (ticks, seen) = counter();
    lp.add_timeout(
        Duration::from_millis(5),
        PRIORITY_DEFAULT,
        Box::new(move || {
            ticks.set(ticks.get() + 1);
            if ticks.get() == 3
                && let Some(lp) = weak.upgrade()
            {
                lp.quit();
            }
            ControlFlow::Continue(())
        }),
    );
    lp.run();
    assert_eq!(seen.get(), 3);
    assert_eq!(lp.len(), 1);
}

#[test]
fn run_returns_when_nothing_is_left() {
    let lp = PollLoop::new();
    let (hits, seen) = counter();
    lp.add_idle(
        PRIORITY_DEFAULT,
        Box::new(move || {
            hits.set(hits.get() + 1);
            if hits.get() < 4 {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        }),
    );
    lp.run();
    assert_eq!(seen.get(), 4);
}

#[test]
fn child_exit_fires_exactly_once() {
    let lp = PollLoop::new();
    let child = std::process::Command::new("sh")
        .args(["-c", "exit 3"])
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    let statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    let id = lp.watch_child_exit(
        pid,
        PRIORITY_DEFAULT,
        Box::new(move |pid, status| sink.borrow_mut().push((pid, status))),
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while statuses.borrow().is_empty() && Instant::now() < deadline {
        lp.iterate(true);
    }
    for _ in 0..3 {
        lp.iterate(false);
    }
    assert_eq!(*statuses.borrow(), vec![(pid, ExitStatus::Exited(3))]);
    assert!(!lp.remove(id));
}

#[test]
fn child_killed_by_signal() {
    let lp = PollLoop::new();
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    let got = Rc::new(Cell::new(None));
    let slot = Rc::clone(&got);
    lp.watch_child_exit(
        pid,
        PRIORITY_DEFAULT,
        Box::new(move |_, status| slot.set(Some(status))),
    );
    child.kill().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while got.get().is_none() && Instant::now() < deadline {
        lp.iterate(true);
    }
    assert_eq!(got.get(), Some(ExitStatus::Signaled(9)));
}

#[test]
fn slow_child_polling_tick_still_reaps() {
    let lp = PollLoop::with_child_poll_interval(Duration::from_millis(2));
    let child = std::process::Command::new("true").spawn().unwrap();
    let got = Rc::new(Cell::new(None));
    let slot = Rc::clone(&got);
    lp.watch_child_exit(
        child.id() as i32,
        PRIORITY_DEFAULT,
        Box::new(move |_, status| slot.set(Some(status))),
    );
    let deadline = Instant::now() + Duration::from_secs(10);
    while got.get().is_none() && Instant::now() < deadline {
        lp.iterate(true);
    }
    assert_eq!(got.get(), Some(ExitStatus::Exited(0)));
}
