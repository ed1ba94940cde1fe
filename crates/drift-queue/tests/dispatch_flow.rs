//! End-to-end queue flow: two messages for one host, both dispatched,
//! both delivered, counters back to zero and the pool gone.

use drift_fsa::Fsa;
use drift_queue::{new_entry, msg_number, MsgName, MsgQueue, PoolDir};
use drift_region::{numbered_path, write_region_id};

fn name(time: i64, unique: u32) -> MsgName {
    MsgName {
        creation_time: time,
        unique_number: unique,
        split_job_counter: 0,
    }
}

#[test]
fn test_two_messages_through_one_host() {
    let temp = tempfile::tempdir().unwrap();
    let fifodir = temp.path().join("fifodir");
    let outgoing = temp.path().join("files/outgoing");
    std::fs::create_dir_all(&fifodir).unwrap();

    // One host that takes two parallel transfers.
    write_region_id(&fifodir.join(drift_fsa::FSA_ID_FILE), 0).unwrap();
    let mut fsa = Fsa::create(
        &numbered_path(&fifodir.join(drift_fsa::FSA_STATUS_FILE), 0),
        &["h"],
    )
    .unwrap();
    {
        let hosts = fsa.hosts_mut().unwrap();
        hosts[0].allowed_transfers = 2;
        hosts[0].max_errors = 3;
    }

    // Stage two messages with their pool files.
    let mut queue = MsgQueue::open(&fifodir).unwrap();
    let specs = [(name(100, 1), 2u32, 1000i64), (name(100, 2), 1u32, 500i64)];
    for (n, files, bytes) in &specs {
        let pool = PoolDir::locate(&outgoing, 0xcafe, 0, *n);
        pool.create().unwrap();
        for i in 0..*files {
            let len = (*bytes / *files as i64) as usize;
            std::fs::write(pool.path().join(format!("f{i}")), vec![0u8; len]).unwrap();
        }
        fsa.add_file_counter(0, *files as i32, *bytes).unwrap();
        queue.enqueue(new_entry(n, 0xcafe, 0, 0, *files, *bytes)).unwrap();
    }
    assert_eq!(fsa.host(0).total_file_counter, 3);
    assert_eq!(fsa.host(0).total_file_size, 1500);

    // Dispatch both: two slots claimed, ordered by msg_number.
    let first = queue.next_dispatchable(&fsa).unwrap();
    assert_eq!(queue.entries()[first].msg_number, msg_number(100, 1));
    queue.set_pid(first, 1001).unwrap();
    fsa.claim_slot(0, 1001, 0xcafe, &queue.entries()[first].name())
        .unwrap()
        .unwrap();

    let second = queue.next_dispatchable(&fsa).unwrap();
    assert_ne!(second, first);
    queue.set_pid(second, 1002).unwrap();
    fsa.claim_slot(0, 1002, 0xcafe, &queue.entries()[second].name())
        .unwrap()
        .unwrap();

    assert_eq!(fsa.host(0).active_transfers, 2);
    // Slot limit reached: nothing more to dispatch.
    assert_eq!(queue.next_dispatchable(&fsa), None);

    // Both workers succeed: release slots, drop pools, remove entries.
    for pid in [1001, 1002] {
        let index = queue.find_by_pid(pid).unwrap();
        let entry = queue.entries()[index];
        fsa.release_slot(0, pid).unwrap();
        fsa.note_success(0, 200).unwrap();

        let n: MsgName = entry.name().parse().unwrap();
        let pool = PoolDir::locate(&outgoing, entry.job_id, entry.dir_no, n);
        pool.remove(&mut fsa, 0, 0xd1, "delivered", "test", None)
            .unwrap();
        queue.remove(index).unwrap();
    }

    assert!(queue.is_empty());
    let host = fsa.host(0);
    assert_eq!(host.active_transfers, 0);
    assert_eq!(host.total_file_counter, 0);
    assert_eq!(host.total_file_size, 0);
    assert!(!outgoing.join("cafe/0").join(specs[0].0.to_string()).exists());
    assert!(!outgoing.join("cafe/0").join(specs[1].0.to_string()).exists());
}
