//! Ownership Module Tests
//!
//! ## Test Scopes
//! - **Table**: Counting, release at zero, invalid releases.
//! - **Pins**: Task pins forwarded to nested refs, container pins.
//! - **Protocol**: Sequence numbers, stale reports, discovery.
//! - **Failures**: Dead borrowers and dead owners.
//! - **Ledger**: Borrower-side transitions.

#[cfg(test)]
mod tests {
    use crate::error::ObjectError;
    use crate::executor::types::TaskId;
    use crate::membership::types::{NodeId, WorkerId};
    use crate::ownership::counter::ReferenceCounter;
    use crate::ownership::directory::OwnerDirectory;
    use crate::ownership::ledger::BorrowLedger;
    use crate::ownership::protocol::{self, BorrowerReport, Envelope, PinChange, ProtocolMessage};
    use crate::ownership::table::OwnershipTable;
    use crate::ownership::types::{ObjectRef, ObjectState, ObjectStatus};

    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn ready() -> ObjectStatus {
        ObjectStatus::Ready {
            node: NodeId::new(),
            size: 16,
        }
    }

    fn report(object: &ObjectRef, borrower: WorkerId, seq: u64, delta: i64) -> BorrowerReport {
        BorrowerReport {
            object: object.id,
            borrower,
            seq,
            delta,
            discovered: Vec::new(),
        }
    }

    // ============================================================
    // TABLE TESTS
    // ============================================================

    #[test]
    fn test_create_starts_with_one_local_ref() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, followups) = table.create(ready(), Vec::new(), None).unwrap();

        assert!(followups.is_empty());
        assert_eq!(object.owner, table.owner());
        assert_eq!(table.total_count(&object.id), Some(1));
        assert_eq!(table.state(&object.id), ObjectState::Active);
    }

    #[test]
    fn test_last_local_ref_releases_object() {
        let table = OwnershipTable::new(WorkerId::new());
        let status = ready();
        let (object, _) = table.create(status.clone(), Vec::new(), None).unwrap();
        table.add_local_ref(&object.id).unwrap();

        let followups = table.remove_local_ref(&object.id).unwrap();
        assert!(followups.released.is_empty(), "One handle still alive");

        let followups = table.remove_local_ref(&object.id).unwrap();
        assert_eq!(followups.released.len(), 1);

        let ObjectStatus::Ready { node, .. } = status else {
            unreachable!()
        };
        assert_eq!(followups.released[0].location, Some(node));
        assert_eq!(table.state(&object.id), ObjectState::Evicted);
    }

    #[test]
    fn test_release_without_reference_fails_fast() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        table.remove_local_ref(&object.id).unwrap();

        let err = table.remove_local_ref(&object.id).unwrap_err();
        assert!(matches!(err, ObjectError::InvalidRelease { .. }));
    }

    #[test]
    fn test_pending_release_has_no_location() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table
            .create(ObjectStatus::Pending, Vec::new(), Some(TaskId::new()))
            .unwrap();

        let followups = table.remove_local_ref(&object.id).unwrap();

        assert_eq!(followups.released[0].location, None);
        assert!(followups.released[0].lineage.is_some());
    }

    #[test]
    fn test_restart_only_flips_ready_objects() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();

        assert_eq!(table.restart(&object.id), Some(true));
        assert_eq!(table.restart(&object.id), Some(false), "Already pending");
        assert_eq!(table.status(&object.id), Some(ObjectStatus::Pending));
        assert_eq!(table.restart(&crate::ObjectId::new()), None);
    }

    // ============================================================
    // PIN TESTS
    // ============================================================

    #[test]
    fn test_nested_refs_get_container_pins() {
        let owner = WorkerId::new();
        let table = OwnershipTable::new(owner);
        let (inner, _) = table.create(ready(), Vec::new(), None).unwrap();

        let (outer, followups) = table.create(ready(), vec![inner, inner], None).unwrap();

        assert_eq!(followups.pins.len(), 1, "Duplicate refs pin once");
        assert_eq!(followups.pins[0].target, inner);
        assert_eq!(
            followups.pins[0].change,
            PinChange::AddContained {
                container: outer.id,
                container_owner: owner
            }
        );
    }

    #[test]
    fn test_container_pin_keeps_inner_alive() {
        let owner = WorkerId::new();
        let table = OwnershipTable::new(owner);
        let (inner, _) = table.create(ready(), Vec::new(), None).unwrap();
        let (outer, _) = table.create(ready(), vec![inner], None).unwrap();
        table.add_contained(&inner.id, outer.id, owner).unwrap();

        // Drop the only handle on the inner object
        let followups = table.remove_local_ref(&inner.id).unwrap();
        assert!(followups.released.is_empty());
        assert_eq!(table.snapshot(&inner.id).unwrap().contained_in, 1);

        // Releasing the container asks to remove the pin
        let followups = table.remove_local_ref(&outer.id).unwrap();
        assert_eq!(followups.released[0].object, outer);
        assert_eq!(
            followups.pins[0].change,
            PinChange::RemoveContained { container: outer.id }
        );

        let followups = table.remove_contained(&inner.id, &outer.id);
        assert_eq!(followups.released[0].object, inner);

        // A second removal is a no-op
        assert!(table.remove_contained(&inner.id, &outer.id).is_empty());
    }

    #[test]
    fn test_task_pin_is_forwarded_to_nested_refs() {
        let owner = WorkerId::new();
        let table = OwnershipTable::new(owner);
        let (inner, _) = table.create(ready(), Vec::new(), None).unwrap();
        let (outer, _) = table.create(ready(), vec![inner], None).unwrap();
        let task = TaskId::new();

        let followups = table.add_task_pin(&outer.id, task, owner).unwrap();
        assert_eq!(followups.pins.len(), 1);
        assert_eq!(followups.pins[0].target, inner);
        assert_eq!(
            followups.pins[0].change,
            PinChange::AddTask {
                task,
                submitter: owner
            }
        );

        // Second pin from the same task does not forward again
        let followups = table.add_task_pin(&outer.id, task, owner).unwrap();
        assert!(followups.pins.is_empty());
        assert_eq!(table.snapshot(&outer.id).unwrap().task_pins, 2);

        assert!(table.remove_task_pin(&outer.id, task).unwrap().pins.is_empty());
        let followups = table.remove_task_pin(&outer.id, task).unwrap();
        assert_eq!(followups.pins[0].change, PinChange::RemoveTask { task });
    }

    #[test]
    fn test_unknown_task_pin_release_is_invalid() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();

        let err = table.remove_task_pin(&object.id, TaskId::new()).unwrap_err();
        assert!(matches!(err, ObjectError::InvalidRelease { .. }));
    }

    #[test]
    fn test_record_nested_extends_existing_task_pins() {
        let owner = WorkerId::new();
        let table = OwnershipTable::new(owner);
        let (container, _) = table.create(ready(), Vec::new(), None).unwrap();
        let task = TaskId::new();
        table.add_task_pin(&container.id, task, owner).unwrap();

        let inner = ObjectRef {
            id: crate::ObjectId::new(),
            owner: WorkerId::new(),
        };
        let followups = table.record_nested(&container.id, vec![inner]).unwrap();

        let changes: Vec<_> = followups.pins.iter().map(|pin| pin.change.clone()).collect();
        assert!(changes.contains(&PinChange::AddContained {
            container: container.id,
            container_owner: owner
        }));
        assert!(changes.contains(&PinChange::AddTask {
            task,
            submitter: owner
        }));

        // Already known: nothing new
        assert!(table.record_nested(&container.id, vec![inner]).unwrap().is_empty());
    }

    // ============================================================
    // PROTOCOL TESTS
    // ============================================================

    #[test]
    fn test_borrower_report_counts() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        let borrower = WorkerId::new();

        table.apply_report(report(&object, borrower, 1, 1)).unwrap();
        table.remove_local_ref(&object.id).unwrap();
        assert_eq!(table.state(&object.id), ObjectState::Active, "Borrower keeps it");

        let followups = table.apply_report(report(&object, borrower, 2, -1)).unwrap();
        assert_eq!(followups.released.len(), 1);
    }

    #[test]
    fn test_stale_and_duplicate_reports_are_dropped() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        let borrower = WorkerId::new();

        table.apply_report(report(&object, borrower, 1, 1)).unwrap();
        table.apply_report(report(&object, borrower, 1, 1)).unwrap();
        assert_eq!(table.snapshot(&object.id).unwrap().borrowers, 1);

        table.apply_report(report(&object, borrower, 3, -1)).unwrap();
        // seq 2 arrives late and must not resurrect the edge
        table.apply_report(report(&object, borrower, 2, 1)).unwrap();
        assert_eq!(table.snapshot(&object.id).unwrap().borrowers, 0);
    }

    #[test]
    fn test_negative_borrower_count_is_invalid() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();

        let err = table
            .apply_report(report(&object, WorkerId::new(), 1, -1))
            .unwrap_err();

        assert!(matches!(err, ObjectError::InvalidRelease { .. }));
        assert_eq!(table.total_count(&object.id), Some(1));
    }

    #[test]
    fn test_discovery_report_pins_new_refs() {
        let owner = WorkerId::new();
        let table = OwnershipTable::new(owner);
        let (container, _) = table.create(ready(), Vec::new(), None).unwrap();
        let inner = ObjectRef {
            id: crate::ObjectId::new(),
            owner: WorkerId::new(),
        };

        let mut discovery = report(&container, WorkerId::new(), 1, 0);
        discovery.discovered = vec![inner];
        let followups = table.apply_report(discovery).unwrap();

        assert_eq!(followups.pins.len(), 1);
        assert_eq!(table.snapshot(&container.id).unwrap().nested, vec![inner]);
    }

    #[test]
    fn test_protocol_message_encoding() {
        let message = ProtocolMessage::Pin {
            object: crate::ObjectId::new(),
            change: PinChange::RemoveTask {
                task: TaskId::new(),
            },
        };

        let bytes = protocol::encode(&message).unwrap();
        assert_eq!(protocol::decode(&bytes).unwrap(), message);
        assert!(protocol::decode(&[0xff, 0xff]).is_err());
    }

    // ============================================================
    // FAILURE TESTS
    // ============================================================

    #[test]
    fn test_dead_worker_references_are_dropped() {
        let owner = WorkerId::new();
        let dead = WorkerId::new();
        let table = OwnershipTable::new(owner);

        let (borrowed, _) = table.create(ready(), Vec::new(), None).unwrap();
        let (pinned, _) = table.create(ready(), Vec::new(), None).unwrap();
        let (contained, _) = table.create(ready(), Vec::new(), None).unwrap();
        let (survivor, _) = table.create(ready(), Vec::new(), None).unwrap();

        table.apply_report(report(&borrowed, dead, 1, 1)).unwrap();
        table.add_task_pin(&pinned.id, TaskId::new(), dead).unwrap();
        table
            .add_contained(&contained.id, crate::ObjectId::new(), dead)
            .unwrap();
        for object in [&borrowed, &pinned, &contained] {
            table.remove_local_ref(&object.id).unwrap();
        }

        let followups = table.drop_worker(dead);

        assert_eq!(followups.released.len(), 3);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&survivor.id));
    }

    #[test]
    fn test_report_from_departed_borrower_is_ignored() {
        let dead = WorkerId::new();
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        table.drop_worker(dead);

        let followups = table.apply_report(report(&object, dead, 1, 1)).unwrap();
        assert!(followups.is_empty());
        assert_eq!(table.snapshot(&object.id).unwrap().borrowers, 0);

        // Its late release is just as harmless
        table.apply_report(report(&object, dead, 2, -1)).unwrap();
        assert_eq!(table.total_count(&object.id), Some(1));
    }

    #[test]
    fn test_task_pin_from_departed_submitter_is_refused() {
        let dead = WorkerId::new();
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        table.drop_worker(dead);

        let err = table
            .apply_pin(
                &object.id,
                PinChange::AddTask {
                    task: TaskId::new(),
                    submitter: dead,
                },
            )
            .unwrap_err();

        assert!(matches!(err, ObjectError::Worker { worker, .. } if worker == dead));
        assert_eq!(table.snapshot(&object.id).unwrap().task_pins, 0);

        let followups = table.remove_local_ref(&object.id).unwrap();
        assert_eq!(followups.released.len(), 1);
    }

    #[test]
    fn test_container_pin_from_departed_owner_is_refused() {
        let dead = WorkerId::new();
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();
        table.drop_worker(dead);

        let change = PinChange::AddContained {
            container: crate::ObjectId::new(),
            container_owner: dead,
        };
        assert!(table.apply_pin(&object.id, change).is_err());
        assert_eq!(table.snapshot(&object.id).unwrap().contained_in, 0);
        assert!(table.has_departed(&dead));
    }

    #[test]
    fn test_queued_messages_from_dead_worker_are_discarded() {
        // ARRANGE: A pin and a borrow are sitting in the owner's inbox
        let owner = WorkerId::new();
        let dead = WorkerId::new();
        let table = Arc::new(OwnershipTable::new(owner));
        let counter = ReferenceCounter::new(owner, table.clone(), OwnerDirectory::new());
        let (object, _) = table.create(ready(), Vec::new(), None).unwrap();

        let pin = ProtocolMessage::Pin {
            object: object.id,
            change: PinChange::AddTask {
                task: TaskId::new(),
                submitter: dead,
            },
        };
        let borrow = ProtocolMessage::Report(report(&object, dead, 1, 1));
        let (ack, mut acked) = oneshot::channel();
        let queued = vec![
            Envelope {
                from: dead,
                bytes: protocol::encode(&pin).unwrap(),
                ack: None,
            },
            Envelope {
                from: dead,
                bytes: protocol::encode(&borrow).unwrap(),
                ack: Some(ack),
            },
        ];

        // ACT: The sender is declared dead before the inbox gets to them
        counter.on_worker_dead(dead);
        for envelope in queued {
            counter.handle_envelope(envelope);
        }

        // ASSERT
        assert!(acked.try_recv().is_ok(), "Acks still go out");
        let snapshot = table.snapshot(&object.id).unwrap();
        assert_eq!(snapshot.task_pins, 0);
        assert_eq!(snapshot.borrowers, 0);
        assert_eq!(snapshot.total, 1);
    }

    #[tokio::test]
    async fn test_mark_dead_wakes_waiters() {
        let table = OwnershipTable::new(WorkerId::new());
        let (object, _) = table
            .create(ObjectStatus::Pending, Vec::new(), None)
            .unwrap();
        let mut status = table.subscribe(&object.id).unwrap();

        assert_eq!(table.mark_dead(), 1);

        assert!(status.changed().await.is_err());
        assert!(table.is_dead());
        assert_eq!(table.state(&object.id), ObjectState::Lost);
        assert!(table.create(ready(), Vec::new(), None).is_err());
    }

    // ============================================================
    // LEDGER TESTS
    // ============================================================

    #[test]
    fn test_ledger_reports_only_transitions() {
        let worker = WorkerId::new();
        let ledger = BorrowLedger::new(worker);
        let object = ObjectRef {
            id: crate::ObjectId::new(),
            owner: WorkerId::new(),
        };

        let first = ledger.acquire(&object, |report| report);
        let second = ledger.acquire(&object, |report| report);

        let first = first.expect("first handle registers");
        assert_eq!(first.delta, 1);
        assert_eq!(first.borrower, worker);
        assert!(second.is_none());
        assert_eq!(ledger.local_count(&object.id), 2);

        assert!(ledger.release(&object, |report| report).unwrap().is_none());
        let last = ledger.release(&object, |report| report).unwrap().unwrap();
        assert_eq!(last.delta, -1);
        assert!(last.seq > first.seq);
        assert_eq!(ledger.borrowed_count(), 0);
    }

    #[test]
    fn test_ledger_release_without_acquire() {
        let ledger = BorrowLedger::new(WorkerId::new());
        let object = ObjectRef {
            id: crate::ObjectId::new(),
            owner: WorkerId::new(),
        };

        assert!(ledger.release(&object, |report| report).is_err());
    }

    #[test]
    fn test_ledger_sequence_is_per_owner() {
        let ledger = BorrowLedger::new(WorkerId::new());
        let owner = WorkerId::new();
        let a = ObjectRef {
            id: crate::ObjectId::new(),
            owner,
        };
        let b = ObjectRef {
            id: crate::ObjectId::new(),
            owner,
        };
        let other = ObjectRef {
            id: crate::ObjectId::new(),
            owner: WorkerId::new(),
        };

        let seq_a = ledger.acquire(&a, |report| report.seq).unwrap();
        let seq_b = ledger.acquire(&b, |report| report.seq).unwrap();
        let seq_other = ledger.acquire(&other, |report| report.seq).unwrap();
        let seq_found = ledger.discovered(&a, vec![other], |report| report.seq);

        assert_eq!((seq_a, seq_b, seq_found), (1, 2, 3));
        assert_eq!(seq_other, 1);

        assert_eq!(ledger.forget_owner(owner), 2);
        assert_eq!(ledger.borrowed_count(), 1);
    }
}
