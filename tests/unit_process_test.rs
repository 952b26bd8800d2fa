//! Process-table supervision over a real fork. Kept alone in this binary so
//! no other test's children confuse the reaper.

use std::time::{Duration, Instant};

use peridot::server::process::{
    ProcessKind, Respawn, Spawned, live, process_get_status, processes, spawn_process,
};

#[test]
fn test_spawn_marks_table_and_reap_collects_exit() {
    let spawned = spawn_process(
        "worker process",
        ProcessKind::Worker { index: 0 },
        Respawn::NoRespawn,
    )
    .unwrap();

    let slot = match spawned {
        Spawned::Child { .. } => {
            // child: vanish immediately without running the test harness
            unsafe { libc::_exit(0) }
        }
        Spawned::Parent { slot, pid } => {
            assert!(pid.as_raw() > 0);
            slot
        }
    };

    {
        let table = processes();
        assert_eq!(table[slot].name, "worker process");
        assert!(!table[slot].exited);
        assert!(table[slot].channel[0] >= 0);
    }
    assert!(live());

    // the child exits on its own; harvest it
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        process_get_status();
        if processes()[slot].exited {
            break;
        }
        assert!(Instant::now() < deadline, "child was never reaped");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(!live());
    let table = processes();
    assert_eq!(table[slot].status, 0);
}
