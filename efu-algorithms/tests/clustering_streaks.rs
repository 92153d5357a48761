#![allow(clippy::cast_possible_truncation)]
use efu_algorithms::{ClusterLimits, ClusterManager};
use efu_core::Readout;

/// Events of each streak arrive out of order so the middle one bridges
/// two partial clusters.
const ORDER: [u64; 5] = [0, 4, 1, 3, 2];

#[test]
fn test_streaks_are_clustered_whole() {
    let n = 1000;
    let m = 10;
    let mut manager = ClusterManager::new(ClusterLimits::new(900, 100, 2, 2), 100);

    let mut emitted = 0;
    let mut cnt: u64 = 0;
    for i in 0..n {
        let base = i * 1000;
        for j in 0..m {
            let start = base + j * 100;
            let x = (cnt * 5 % 997) as u16;
            let y = (cnt * 3 % 997) as u16;
            for k in ORDER {
                manager.add_event(&Readout::neutron(start + k * 100, x + k as u16, y + k as u16, 1));
            }
            cnt += 1;
        }
        // everything from earlier iterations is complete
        assert_eq!(manager.process_active(0, base), 0);
        emitted += manager.clear_output();
    }
    assert_eq!(emitted, 9990);

    manager.process_active(0, u64::MAX);
    let mut out = Vec::new();
    assert_eq!(manager.flush_output(&mut out), 10);
    assert!(out.iter().all(|r| r.weight == 5));

    let stats = manager.statistics();
    assert_eq!(stats.events_added, 50_000);
    assert_eq!(stats.events_dropped, 0);
    assert_eq!(stats.clusters_created, 20_000);
    assert_eq!(stats.clusters_merged, 10_000);
    assert_eq!(manager.capacity(), manager.pool_size());
}
