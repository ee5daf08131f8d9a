use super::*;
use crate::aggregate::{AggregateBounds, AggregateStore};
use crate::config::DbConfig;
use crate::model::NewItem;
use crate::source::SourceStore;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    db: Arc<Database>,
    sources: SourceStore,
    aggregates: AggregateStore,
    dests: Arc<ForwardDestStore>,
    forward: ForwardAggregateStore,
    forward_sources: ForwardSourceStore,
}

fn fixture(direct: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&DbConfig::at(dir.path().join("repo.db"))).unwrap());
    let sources = SourceStore::open(Arc::clone(&db), direct).unwrap();
    let aggregates = AggregateStore::open(Arc::clone(&db), sources.new_item_queue()).unwrap();
    let dests = Arc::new(ForwardDestStore::open(Arc::clone(&db)).unwrap());
    let forward =
        ForwardStore::open(Arc::clone(&db), Arc::clone(&dests), aggregates.closed_queue()).unwrap();
    let forward_sources =
        ForwardStore::open(Arc::clone(&db), Arc::clone(&dests), sources.forward_queue()).unwrap();
    Fixture {
        _dir: dir,
        db,
        sources,
        aggregates,
        dests,
        forward,
        forward_sources,
    }
}

impl Fixture {
    /// One source of two items aggregated into one closed aggregate
    fn closed_aggregate(&self) -> i64 {
        let id = self.sources.add_source(1, Some("FEED"), None).unwrap().id();
        self.sources
            .add_items(
                id,
                &[
                    NewItem::new("001").entry(".meta", 1).entry(".dat", 10),
                    NewItem::new("002").entry(".dat", 10),
                ],
            )
            .unwrap();
        let bounds = AggregateBounds {
            max_items: 5,
            max_bytes: 1_000,
        };
        self.aggregates.aggregate_new_items(bounds, 100).unwrap();
        assert!(self.aggregates.close_aggregate(1).unwrap());
        1
    }

    fn dest(&self, name: &str) -> ForwardDest {
        self.dests.get_forward_dest(name).unwrap()
    }

    fn count(&self, table: &str) -> i64 {
        self.db
            .read_only(|conn| crate::source::count(conn, table))
            .unwrap()
    }
}

#[test]
fn test_fan_out_once_per_destination() {
    let f = fixture(false);
    f.closed_aggregate();
    let dests = vec![f.dest("http://a"), f.dest("http://b")];

    assert_eq!(f.forward.create_forward_records(&dests).unwrap(), 2);
    assert_eq!(f.forward.create_forward_records(&dests).unwrap(), 0);
    assert_eq!(f.forward.count().unwrap(), 2);
}

#[test]
fn test_fan_out_waits_for_destinations() {
    let f = fixture(false);
    f.closed_aggregate();

    assert_eq!(f.forward.create_forward_records(&[]).unwrap(), 0);
    assert_eq!(f.db.read_only(|c| f.forward.subject_queue().len(c)).unwrap(), 1);

    let dests = vec![f.dest("http://a")];
    assert_eq!(
        f.forward
            .create_next_forward_records(&dests, Duration::from_millis(10))
            .unwrap(),
        Some(1)
    );
}

#[test]
fn test_full_success_cascades() {
    let f = fixture(false);
    let aggregate_id = f.closed_aggregate();
    let dests = vec![f.dest("http://a"), f.dest("http://b")];
    f.forward.create_forward_records(&dests).unwrap();

    let mut first = f.forward.get_new().unwrap().unwrap();
    assert_eq!(first.subject.id, aggregate_id);
    assert_eq!(first.dest.name, "http://a");
    first.mark_success();
    assert_eq!(f.forward.update(&first).unwrap(), UpdateOutcome::Pending);

    // One destination outstanding: nothing is deleted.
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 1);
    assert_eq!(f.sources.count_items().unwrap(), 2);
    assert_eq!(f.forward.count().unwrap(), 2);

    let mut second = f.forward.get_new().unwrap().unwrap();
    second.mark_success();
    assert_eq!(f.forward.update(&second).unwrap(), UpdateOutcome::Complete);

    assert_eq!(f.aggregates.count_aggregates().unwrap(), 0);
    assert_eq!(f.sources.count_items().unwrap(), 0);
    assert_eq!(f.sources.count_entries().unwrap(), 0);
    assert_eq!(f.forward.count().unwrap(), 0);
    assert!(f.forward.get_new().unwrap().is_none());
}

#[test]
fn test_failure_goes_to_retry_queue() {
    let f = fixture(false);
    f.closed_aggregate();
    f.forward.create_forward_records(&[f.dest("http://a")]).unwrap();

    let mut record = f.forward.get_new().unwrap().unwrap();
    record.mark_failure("503 Service Unavailable");
    assert_eq!(f.forward.update(&record).unwrap(), UpdateOutcome::Retry);

    assert!(f.forward.get_new().unwrap().is_none());
    let mut retry = f.forward.get_retry().unwrap().unwrap();
    assert_eq!(retry.id, record.id);
    assert_eq!(retry.tries, 1);
    assert!(!retry.success);
    assert_eq!(retry.error.as_deref(), Some("503 Service Unavailable"));
    assert_eq!(f.forward.count_failed().unwrap(), 1);

    retry.mark_success();
    assert_eq!(f.forward.update(&retry).unwrap(), UpdateOutcome::Complete);
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 0);
}

#[test]
fn test_update_after_row_removed_is_stale() {
    let f = fixture(false);
    f.closed_aggregate();
    let a = f.dest("http://a");
    let b = f.dest("http://b");
    f.forward.create_forward_records(&[a.clone(), b]).unwrap();

    let mut record = f.forward.get_new().unwrap().unwrap();
    f.forward.remove_old_forward_records(&[a]).unwrap();

    record.mark_success();
    assert_eq!(f.forward.update(&record).unwrap(), UpdateOutcome::Stale);
    assert_eq!(f.forward.count().unwrap(), 1);
}

#[test]
fn test_removing_last_destination_deletes_aggregate() {
    let f = fixture(false);
    f.closed_aggregate();
    let a = f.dest("http://a");
    f.forward.create_forward_records(&[a.clone()]).unwrap();

    assert_eq!(f.forward.remove_old_forward_records(&[a]).unwrap(), 1);
    assert_eq!(f.forward.count().unwrap(), 0);
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 0);
    assert_eq!(f.sources.count_items().unwrap(), 0);
}

#[test]
fn test_removing_one_of_two_destinations_keeps_aggregate() {
    let f = fixture(false);
    f.closed_aggregate();
    let a = f.dest("http://a");
    let b = f.dest("http://b");
    f.forward.create_forward_records(&[a.clone(), b]).unwrap();

    f.forward.remove_old_forward_records(&[a]).unwrap();
    assert_eq!(f.forward.count().unwrap(), 1);
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 1);
}

#[test]
fn test_removing_pending_destination_completes_succeeded_peers() {
    let f = fixture(false);
    f.closed_aggregate();
    let a = f.dest("http://a");
    let b = f.dest("http://b");
    f.forward.create_forward_records(&[a, b.clone()]).unwrap();

    let mut first = f.forward.get_new().unwrap().unwrap();
    first.mark_success();
    f.forward.update(&first).unwrap();

    f.forward.remove_old_forward_records(&[b]).unwrap();
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 0);
    assert_eq!(f.forward.count().unwrap(), 0);
}

#[test]
fn test_new_destination_back_filled() {
    let f = fixture(false);
    f.closed_aggregate();
    f.forward.create_forward_records(&[f.dest("http://a")]).unwrap();

    let c = f.dest("http://c");
    assert_eq!(f.forward.add_new_forward_records(&[c.clone()]).unwrap(), 1);
    assert_eq!(f.forward.add_new_forward_records(&[c]).unwrap(), 0);
    assert_eq!(f.forward.count().unwrap(), 2);
}

#[test]
fn test_delete_failed_forwards_refans_out() {
    let f = fixture(false);
    f.closed_aggregate();
    let dests = vec![f.dest("http://a")];
    f.forward.create_forward_records(&dests).unwrap();

    let mut record = f.forward.get_new().unwrap().unwrap();
    record.mark_failure("timeout");
    f.forward.update(&record).unwrap();

    assert_eq!(f.forward.delete_failed_forwards().unwrap(), 1);
    assert_eq!(f.forward.count().unwrap(), 0);
    assert!(f.forward.get_retry().unwrap().is_none());
    // The aggregate survives and is fanned out afresh.
    assert_eq!(f.aggregates.count_aggregates().unwrap(), 1);
    assert_eq!(f.forward.create_forward_records(&dests).unwrap(), 1);

    let fresh = f.forward.get_new().unwrap().unwrap();
    assert_eq!(fresh.tries, 0);
    assert!(fresh.error.is_none());
}

#[test]
fn test_direct_source_forwarding() {
    let f = fixture(true);
    let source_id = f.sources.add_source(7, Some("FEED"), None).unwrap().id();
    let dests = vec![f.dest("http://a"), f.dest("http://b")];

    assert_eq!(f.forward_sources.create_forward_records(&dests).unwrap(), 2);
    for _ in 0..2 {
        let mut record = f.forward_sources.get_new().unwrap().unwrap();
        assert_eq!(record.subject.id, source_id);
        record.mark_success();
        f.forward_sources.update(&record).unwrap();
    }

    let source = f.sources.get_source(source_id).unwrap().unwrap();
    assert!(source.forwarded);
    assert_eq!(f.count("forward_source"), 0);

    let deletable = f.sources.get_deletable_sources(10).unwrap();
    assert_eq!(deletable.len(), 1);
    assert_eq!(f.sources.delete_sources(&[source_id]).unwrap(), 1);
}

#[test]
fn test_get_new_timeout_expires() {
    let f = fixture(false);
    assert!(f
        .forward
        .get_new_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());
    assert!(f
        .forward
        .get_retry_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());
}
