//! Several coordinators fed through a single in-memory ordering authority.

use cadence_core::{
    Mutation, MutationContext, PropertyKey, SharedList, SharedObject, StructureId, Summary,
    UpdateCoordinator,
};

struct Batch {
    client: usize,
    version: u64,
    ops: Vec<String>,
}

/// Total order of submitted batches plus per-client delivery cursors.
struct Sequencer {
    log: Vec<Batch>,
    delivered: Vec<usize>,
}

impl Sequencer {
    fn new(clients: usize) -> Self {
        Self {
            log: Vec::new(),
            delivered: vec![0; clients],
        }
    }

    fn submit(&mut self, client: usize, coordinator: &mut UpdateCoordinator) {
        if let Some(batch) = coordinator.take_outbound() {
            self.log.push(Batch {
                client,
                version: batch.version,
                ops: batch.encode_ops().unwrap(),
            });
        }
    }

    fn deliver(&mut self, client: usize, coordinator: &mut UpdateCoordinator) {
        while self.delivered[client] < self.log.len() {
            let seq = self.delivered[client];
            let batch = &self.log[seq];
            let ctx = if batch.client == client {
                MutationContext::ack(batch.version)
            } else {
                MutationContext::remote(seq as u64 + 1)
            };
            for op in &batch.ops {
                coordinator.process(&Mutation::decode(op).unwrap(), ctx);
            }
            self.delivered[client] += 1;
        }
    }
}

fn shared_doc() -> Summary {
    let mut root = SharedList::with_id(StructureId::from("root"));
    for id in ["a", "b", "c"] {
        let mut shape = SharedObject::with_id(StructureId::from(id));
        shape.property("x", 0i64);
        shape.property("label", String::new());
        root.add(Box::new(shape));
    }
    UpdateCoordinator::new(Box::new(root)).summary()
}

fn clients(n: usize) -> Vec<UpdateCoordinator> {
    let summary = shared_doc();
    (0..n).map(|_| UpdateCoordinator::from_summary(&summary)).collect()
}

#[test]
fn test_racing_writes_converge_on_last_sequenced() {
    let mut c = clients(2);
    let mut seq = Sequencer::new(2);
    let a = StructureId::from("a");
    let x = PropertyKey::<i64>::new("x");

    c[0].set(&a, &x, 5).unwrap();
    c[1].set(&a, &x, 3).unwrap();
    seq.submit(1, &mut c[1]);
    seq.submit(0, &mut c[0]);

    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }

    assert_eq!(c[0].value(&a, &x).unwrap(), 5);
    assert_eq!(c[1].value(&a, &x).unwrap(), 5);
    assert_eq!(c[0].summary(), c[1].summary());
    assert!(!c[0].has_unacknowledged());
    assert!(!c[1].has_unacknowledged());
}

#[test]
fn test_disjoint_fields_merge() {
    let mut c = clients(2);
    let mut seq = Sequencer::new(2);
    let a = StructureId::from("a");
    let x = PropertyKey::<i64>::new("x");
    let label = PropertyKey::<String>::new("label");

    c[0].set(&a, &x, 11).unwrap();
    c[1].set(&a, &label, "hello".to_string()).unwrap();
    seq.submit(0, &mut c[0]);
    seq.submit(1, &mut c[1]);
    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }

    for client in &c {
        assert_eq!(client.value(&a, &x).unwrap(), 11);
        assert_eq!(client.value(&a, &label).unwrap(), "hello");
    }
}

#[test]
fn test_undo_propagates_to_peers() {
    let mut c = clients(2);
    let mut seq = Sequencer::new(2);
    let list = StructureId::from("root");
    let b = StructureId::from("b");

    c[0].remove_item(&list, &b).unwrap();
    c[0].commit();
    seq.submit(0, &mut c[0]);
    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }
    assert!(!c[1].is_attached(&b));

    c[0].undo();
    seq.submit(0, &mut c[0]);
    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }

    let order: Vec<_> = c[1].list(&list).unwrap().ids().to_vec();
    assert_eq!(
        order,
        vec![StructureId::from("a"), b.clone(), StructureId::from("c")]
    );
    assert_eq!(c[0].summary(), c[1].summary());
}

#[test]
fn test_late_joiner_bootstraps_from_summary() {
    let mut c = clients(1);
    let mut seq = Sequencer::new(2);
    let list = StructureId::from("root");

    let mut extra = SharedObject::with_id(StructureId::from("d"));
    extra.property("x", 9i64);
    c[0].add_item(&list, Box::new(extra)).unwrap();
    seq.submit(0, &mut c[0]);
    seq.deliver(0, &mut c[0]);

    let mut late = UpdateCoordinator::from_summary(&c[0].summary());
    seq.delivered[1] = seq.log.len();
    seq.deliver(1, &mut late);

    assert_eq!(late.summary(), c[0].summary());
    let x = PropertyKey::<i64>::new("x");
    assert_eq!(late.value(&StructureId::from("d"), &x).unwrap(), 9);
}

fn shape(id: &str) -> Box<SharedObject> {
    let mut shape = SharedObject::with_id(StructureId::from(id));
    shape.property("x", 0i64);
    Box::new(shape)
}

fn root_order(client: &UpdateCoordinator) -> Vec<String> {
    let list = client.list(&StructureId::from("root")).unwrap();
    list.ids().iter().map(|id| id.to_string()).collect()
}

#[test]
fn test_concurrent_appends_converge() {
    let mut c = clients(2);
    let mut seq = Sequencer::new(2);
    let list = StructureId::from("root");

    c[0].add_item(&list, shape("x0")).unwrap();
    c[1].add_item(&list, shape("y1")).unwrap();
    assert!(c[0].has_unacknowledged());
    seq.submit(1, &mut c[1]);
    seq.submit(0, &mut c[0]);

    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }

    assert_eq!(root_order(&c[0]), vec!["a", "b", "c", "y1", "x0"]);
    assert_eq!(root_order(&c[1]), root_order(&c[0]));
    assert_eq!(c[0].summary(), c[1].summary());
    assert!(!c[0].has_unacknowledged());
    assert!(!c[1].has_unacknowledged());
}

#[test]
fn test_concurrent_inserts_and_removes_converge() {
    let mut c = clients(3);
    let mut seq = Sequencer::new(3);
    let list = StructureId::from("root");

    c[0].insert_item(&list, 1, shape("p")).unwrap();
    c[1].remove_item(&list, &StructureId::from("a")).unwrap();
    c[1].insert_item(&list, 0, shape("q")).unwrap();
    c[2].remove_item(&list, &StructureId::from("a")).unwrap();
    c[2].add_item(&list, shape("r")).unwrap();

    seq.submit(2, &mut c[2]);
    seq.submit(0, &mut c[0]);
    seq.deliver(1, &mut c[1]);
    seq.submit(1, &mut c[1]);

    for (i, client) in c.iter_mut().enumerate() {
        seq.deliver(i, client);
    }

    let expected = root_order(&c[0]);
    assert_eq!(root_order(&c[1]), expected);
    assert_eq!(root_order(&c[2]), expected);
    assert!(!expected.contains(&"a".to_string()));
    for client in &c {
        assert_eq!(client.summary(), c[0].summary());
        assert!(!client.is_attached(&StructureId::from("a")));
        assert!(!client.has_unacknowledged());
    }
}

#[test]
fn test_late_joiner_matches_order_after_concurrent_appends() {
    let mut c = clients(2);
    let mut seq = Sequencer::new(3);
    let list = StructureId::from("root");

    c[0].add_item(&list, shape("x0")).unwrap();
    c[1].add_item(&list, shape("y1")).unwrap();
    seq.submit(1, &mut c[1]);
    seq.submit(0, &mut c[0]);
    seq.deliver(0, &mut c[0]);

    let mut late = UpdateCoordinator::from_summary(&c[0].summary());
    seq.delivered[2] = seq.log.len();
    seq.deliver(1, &mut c[1]);
    seq.deliver(2, &mut late);

    assert_eq!(root_order(&late), root_order(&c[0]));
    assert_eq!(root_order(&late), root_order(&c[1]));
}
