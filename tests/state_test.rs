//! Checkpoint state gather/scatter round-trips, single- and multi-process.
//!
//! Multi-process topologies are simulated in-process: one thread per
//! "process", sharing a barrier and a broadcast slot through a
//! [`ThreadGroupCoordinator`].

use gradsync::coord::Coordinator;
use gradsync::device::ElementType;
use gradsync::error::Result;
use gradsync::state::{StateAggregator, StateRecord};
use std::sync::{Arc, Barrier, Mutex};

/// Thread-backed simulation of a process group: every participant is a
/// thread, barriers are `std::sync::Barrier`, and broadcast stages its
/// payload through a shared slot.
struct GroupShared {
    barrier: Barrier,
    slot: Mutex<Vec<u8>>,
}

struct ThreadGroupCoordinator {
    rank: usize,
    procs: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroupCoordinator {
    fn group(procs: usize) -> Vec<Self> {
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(procs),
            slot: Mutex::new(Vec::new()),
        });
        (0..procs)
            .map(|rank| Self {
                rank,
                procs,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Coordinator for ThreadGroupCoordinator {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_processes(&self) -> usize {
        self.procs
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> Result<()> {
        if self.rank == root {
            *self.shared.slot.lock().unwrap() = data.clone();
        }
        self.shared.barrier.wait();
        if self.rank != root {
            *data = self.shared.slot.lock().unwrap().clone();
        }
        // Keep the slot alive until every reader is done.
        self.shared.barrier.wait();
        Ok(())
    }

    fn id_str(&self) -> String {
        format!("thread[{}/{}]", self.rank, self.procs)
    }
}

fn device_bytes(global_rank: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (global_rank * 31 + i) as u8).collect()
}

#[test]
fn roundtrip_one_process_four_devices() {
    let aggregator = StateAggregator::new(4, None);
    let shard_len = 6;

    let full = aggregator
        .gather(&|d| {
            Ok(StateRecord::new(
                "opt",
                ElementType::F32,
                device_bytes(d, shard_len),
            ))
        })
        .unwrap();

    let expected: Vec<u8> = (0..4).flat_map(|r| device_bytes(r, shard_len)).collect();
    assert_eq!(full.bytes, expected);

    let seen = Mutex::new(vec![Vec::new(); 4]);
    aggregator
        .scatter(&full, &|d, bytes| {
            seen.lock().unwrap()[d] = bytes.to_vec();
            Ok(())
        })
        .unwrap();
    for d in 0..4 {
        assert_eq!(seen.lock().unwrap()[d], device_bytes(d, shard_len));
    }
}

#[test]
fn roundtrip_three_processes_two_devices() {
    let procs = 3;
    let devices_per_proc = 2;
    let shard_len = 5;

    let coordinators = ThreadGroupCoordinator::group(procs);
    let handles: Vec<_> = coordinators
        .into_iter()
        .map(|coordinator| {
            std::thread::spawn(move || {
                let my_rank = coordinator.my_rank();
                let coordinator: Arc<dyn Coordinator> = Arc::new(coordinator);
                let aggregator = StateAggregator::new(devices_per_proc, Some(coordinator));

                let full = aggregator
                    .gather(&|d| {
                        let global = my_rank * devices_per_proc + d;
                        Ok(StateRecord::new(
                            "opt",
                            ElementType::F32,
                            device_bytes(global, shard_len),
                        ))
                    })
                    .unwrap();

                // Every process must hold the identical full concatenation
                // across the entire participant set, in global rank order.
                let expected: Vec<u8> = (0..procs * devices_per_proc)
                    .flat_map(|r| device_bytes(r, shard_len))
                    .collect();
                assert_eq!(full.bytes, expected, "process {my_rank}");

                // Scatter hands each local device back exactly its bytes.
                let seen = Mutex::new(vec![Vec::new(); devices_per_proc]);
                aggregator
                    .scatter(&full, &|d, bytes| {
                        seen.lock().unwrap()[d] = bytes.to_vec();
                        Ok(())
                    })
                    .unwrap();
                for d in 0..devices_per_proc {
                    let global = my_rank * devices_per_proc + d;
                    assert_eq!(
                        seen.lock().unwrap()[d],
                        device_bytes(global, shard_len),
                        "process {my_rank} device {d}"
                    );
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
