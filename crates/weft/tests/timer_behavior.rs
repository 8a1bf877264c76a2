//! Timer semantics observed through a live I/O manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft::{IoManager, Schedule, Task, Thread};

#[test]
fn refresh_shifts_the_first_firing() {
    let _ = env_logger::builder().is_test(true).try_init();

    let iom = IoManager::new(1, false, "timer-refresh").unwrap();

    let fires = Arc::new(Mutex::new(Vec::<u64>::new()));
    let f = fires.clone();
    let t0 = Instant::now();
    let timer = iom.timers().add_timer(
        100,
        move || {
            f.lock().unwrap().push(t0.elapsed().as_millis() as u64);
        },
        true,
    );

    // Push the first deadline out to ~150 ms half way through.
    std::thread::sleep(Duration::from_millis(50));
    assert!(timer.refresh());

    let deadline = Instant::now() + Duration::from_secs(5);
    while fires.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "recurring timer stalled");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(timer.cancel());
    let observed = fires.lock().unwrap().clone();

    assert!(
        (140..=230).contains(&observed[0]),
        "first firing at {} ms, wanted ~150",
        observed[0]
    );
    for pair in observed.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            (60..=200).contains(&gap),
            "period drifted: gap {} ms, wanted ~100",
            gap
        );
    }

    iom.stop();
}

#[test]
fn one_shot_timer_fires_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let iom = IoManager::new(1, false, "timer-oneshot").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    iom.timers().add_timer(
        20,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    iom.stop();
}

#[test]
fn pinned_tasks_stay_on_their_worker() {
    let _ = env_logger::builder().is_test(true).try_init();

    let iom = IoManager::new(2, false, "pinned").unwrap();
    let tids = iom.scheduler().worker_tids();
    assert_eq!(tids.len(), 2);
    let target = tids[0];

    let seen = Arc::new(Mutex::new(Vec::<i32>::new()));
    for _ in 0..16 {
        let s = seen.clone();
        iom.schedule(Task::call(move || {
            s.lock().unwrap().push(Thread::current_tid());
        }).pinned(target));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().len() < 16 {
        assert!(Instant::now() < deadline, "pinned tasks never ran");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(
        seen.lock().unwrap().iter().all(|&tid| tid == target),
        "a pinned task ran on a foreign worker"
    );

    iom.stop();
}

#[test]
fn cooperative_yield_interleaves_tasks() {
    let _ = env_logger::builder().is_test(true).try_init();

    let iom = IoManager::new(1, false, "yielders").unwrap();
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    for name in ["a", "b"] {
        let l = log.clone();
        iom.schedule(Task::call(move || {
            for _ in 0..3 {
                l.lock().unwrap().push(name);
                weft::Fiber::yield_to_ready();
            }
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().len() < 6 {
        assert!(Instant::now() < deadline, "yielding tasks never finished");
        std::thread::sleep(Duration::from_millis(2));
    }
    let observed = log.lock().unwrap().clone();

    // On one worker, ready-yields must alternate the two tasks rather
    // than running either to completion.
    assert_eq!(observed.len(), 6);
    assert!(
        observed.windows(2).any(|w| w[0] != w[1]),
        "tasks never interleaved: {:?}",
        observed
    );

    iom.stop();
}
