use std::thread;

use rollup_tsdb::{Backend, Config, Error, ManualClock, Query, TimeSeriesEngine};
use rustc_hash::FxHashMap;

type Engine = TimeSeriesEngine<&'static str, u32, u32, ManualClock>;

const NOW: u64 = 1_600_000_000;

fn engine() -> Engine {
    let config: Config = r#"
shards: 8
rollups:
  - width_seconds: 10
    retention:
      samples: 360
  - width_seconds: 3600
    retention:
      seconds: 604800
  - width_seconds: 86400
    retention:
      samples: 90
"#
    .parse()
    .expect("valid config");
    TimeSeriesEngine::with_clock(&config, ManualClock::new(NOW)).expect("valid rollups")
}

#[test]
fn concurrent_increments_are_not_lost() -> Result<(), Error> {
    let engine = engine();
    let threads: u64 = 8;
    let per_thread: u64 = 500;

    thread::scope(|scope| {
        for worker in 0..threads {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..per_thread {
                    let timestamp = NOW - (i % 30) * 10;
                    let environment = Some(worker % 2);
                    engine
                        .incr(&"events", &7, Some(timestamp), 1, environment)
                        .expect("incr");
                    engine
                        .record(&"users", &7, &[u32::try_from(i).expect("small")], Some(timestamp), None)
                        .expect("record");
                }
            });
        }
    });

    let query = Query::new(NOW - 3000).with_rollup(10);
    assert_eq!(engine.get_sums(&"events", &[7], &query)?[&7], threads * per_thread);
    let even = engine.get_sums(&"events", &[7], &query.with_environment(0))?[&7];
    let odd = engine.get_sums(&"events", &[7], &query.with_environment(1))?[&7];
    assert_eq!(even + odd, threads * per_thread);

    let daily = Query::new(NOW - 3000).with_rollup(86_400);
    assert_eq!(engine.get_sums(&"events", &[7], &daily)?[&7], threads * per_thread);
    assert_eq!(
        engine.get_distinct_counts_totals(&"users", &[7], &daily)?[&7],
        usize::try_from(per_thread).expect("small")
    );
    Ok(())
}

#[test]
fn range_covers_every_bucket_in_order() -> Result<(), Error> {
    let engine = engine();
    engine.incr(&"events", &1, Some(NOW - 25), 2, None)?;
    engine.incr(&"events", &1, Some(NOW), 1, None)?;

    let range = engine.get_range(&"events", &[1, 2], &Query::between(NOW - 30, NOW))?;
    let epochs: Vec<u64> = range[&1].iter().map(|(epoch, _)| *epoch).collect();
    assert_eq!(epochs, vec![NOW - 30, NOW - 20, NOW - 10, NOW]);
    let counts: Vec<u64> = range[&1].iter().map(|(_, count)| *count).collect();
    assert_eq!(counts, vec![2, 0, 0, 1]);
    assert!(range[&2].iter().all(|(_, count)| *count == 0));

    assert!(
        engine
            .get_range(&"events", &[1], &Query::between(NOW, NOW - 30))?[&1]
            .is_empty()
    );
    Ok(())
}

#[test]
fn old_ranges_read_from_coarser_rollups() -> Result<(), Error> {
    let engine = engine();
    engine.incr(&"events", &1, Some(NOW - 2 * 86_400), 5, None)?;

    let (rollup, _) = engine.get_optimal_rollup_series(NOW - 2 * 86_400, None, None)?;
    assert_eq!(rollup, 3600);
    let sums = engine.get_sums(&"events", &[1], &Query::new(NOW - 2 * 86_400))?;
    assert_eq!(sums[&1], 5);

    let (rollup, _) = engine.get_optimal_rollup_series(NOW - 30 * 86_400, None, None)?;
    assert_eq!(rollup, 86_400);
    Ok(())
}

#[test]
fn environment_scoped_delete_keeps_others() -> Result<(), Error> {
    let engine = engine();
    for environment in [1, 2, 3] {
        engine.incr(&"events", &1, Some(NOW), 10, Some(environment))?;
    }
    engine.delete(&["events"], &[1], Some(NOW - 60), Some(NOW), None, Some(&[2]))?;

    let query = Query::between(NOW - 60, NOW);
    assert_eq!(engine.get_sums(&"events", &[1], &query.with_environment(1))?[&1], 10);
    assert_eq!(engine.get_sums(&"events", &[1], &query.with_environment(2))?[&1], 0);
    assert_eq!(engine.get_sums(&"events", &[1], &query.with_environment(3))?[&1], 10);
    assert_eq!(engine.get_sums(&"events", &[1], &query)?[&1], 0);
    Ok(())
}

#[test]
fn merge_consumes_sources() -> Result<(), Error> {
    let engine = engine();
    engine.incr(&"events", &1, Some(NOW), 1, Some(4))?;
    engine.incr(&"events", &2, Some(NOW - 3600), 2, Some(4))?;
    engine.incr(&"events", &3, Some(NOW), 3, Some(4))?;

    engine.merge(&"events", &1, &[1, 2, 3], None, Some(&[4]))?;
    let query = Query::new(NOW - 7200).with_rollup(3600);
    for environment in [None, Some(4)] {
        let query = Query { environment, ..query };
        let sums = engine.get_sums(&"events", &[1, 2, 3], &query)?;
        assert_eq!(sums[&1], 6);
        assert_eq!(sums[&2], 0);
        assert_eq!(sums[&3], 0);
    }
    Ok(())
}

#[test]
fn merged_writes_agree_across_rollups() -> Result<(), Error> {
    let engine = engine();
    // Beyond the ten second rollup's hour of retention, then a minute ahead.
    let stale = NOW - 7200;
    let future = NOW + 60;
    engine.incr(&"events", &2, Some(stale), 5, None)?;
    engine.incr(&"events", &2, Some(future), 7, None)?;

    engine.merge(&"events", &1, &[2], Some(NOW), None)?;
    for rollup in [10, 3600, 86_400] {
        let query = Query::between(stale, future).with_rollup(rollup);
        let sums = engine.get_sums(&"events", &[1, 2], &query)?;
        assert_eq!((sums[&1], sums[&2]), (12, 0), "rollup {rollup}");
    }
    Ok(())
}

#[test]
fn most_frequent_is_deterministic() -> Result<(), Error> {
    let engine = engine();
    let mut scores = FxHashMap::default();
    scores.insert(1, FxHashMap::from_iter([(30, 1.0), (10, 2.0), (20, 2.0), (40, 0.5)]));
    engine.record_frequency_multi(&[("releases", scores)], Some(NOW), None)?;

    let query = Query::between(NOW - 10, NOW);
    let first = engine.get_most_frequent(&"releases", &[1], &query, Some(3))?;
    assert_eq!(first[&1], vec![(10, 2.0), (20, 2.0), (30, 1.0)]);
    for _ in 0..10 {
        assert_eq!(engine.get_most_frequent(&"releases", &[1], &query, Some(3))?, first);
    }
    Ok(())
}

#[test]
fn unknown_rollup_is_rejected() -> Result<(), Error> {
    let engine = engine();
    engine.incr(&"events", &1, Some(NOW), 1, None)?;
    let result = engine.get_sums(&"events", &[1], &Query::new(NOW).with_rollup(60));
    assert!(matches!(result, Err(Error::Rollup(_))));
    assert_eq!(engine.get_sums(&"events", &[1], &Query::new(NOW))?[&1], 1);
    Ok(())
}
