//! Cluster Tests
//!
//! End-to-end lifetime scenarios on an in-process cluster. Sizes are scaled down: a store
//! holds 100 units and a "big" object is 40 units, so two fit and a third does not.
//!
//! ## Test Scopes
//! - **Pressure**: Referenced objects survive a full store, dropped ones go eagerly.
//! - **Nesting**: Objects reachable from a pinned task argument stay alive.
//! - **Tasks**: Crash retries, terminal handler errors, argument failures, nested tasks.
//! - **Borrowing**: Returned and re-wrapped refs, borrower release reaching the owner.
//! - **Failures**: Owner death, node failure with reconstruction, partitions.

#[cfg(test)]
mod tests {
    use crate::cluster::Cluster;
    use crate::config::ClusterConfig;
    use crate::error::{LostReason, ObjectError};
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::types::{TaskSpec, TaskStatus};
    use crate::membership::types::WorkerKind;
    use crate::ownership::types::ObjectStatus;
    use crate::payload::Value;

    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    const UNIT: usize = 1024;
    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    fn config() -> ClusterConfig {
        ClusterConfig {
            object_store_memory: 100 * UNIT as u64,
            object_store_full_max_retries: 2,
            object_store_full_initial_delay_ms: 1,
            task_retry_delay_ms: 0,
            default_max_retries: 0,
            num_nodes: 1,
            num_workers: 1,
            heartbeat_interval_ms: 20,
            suspect_timeout_ms: 500,
            dead_timeout_ms: 1_000,
        }
    }

    fn big() -> Value {
        Value::Bytes(vec![0; 40 * UNIT])
    }

    fn registry(signal: Arc<Notify>) -> Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();

        registry.register("echo", |ctx| async move {
            Ok(ctx.args.into_iter().next().unwrap_or(Value::Null))
        });
        // Holds its arguments until signalled
        registry.register("wait", move |ctx| {
            let signal = signal.clone();
            async move {
                let _held = ctx;
                signal.notified().await;
                Ok(Value::Null)
            }
        });
        registry.register("crash", |ctx| async move { Err(ctx.exit_worker()) });
        registry.register("fail", |_ctx| async move {
            Err(anyhow::anyhow!("Intentional error"))
        });
        registry.register("constant", |_ctx| async move { Ok(Value::Int(7)) });
        registry.register("put_big", |ctx| async move {
            let inner = ctx.put(big()).await?;
            Ok(Value::list([Value::Ref(inner)]))
        });
        registry.register("make_bytes", |ctx| async move {
            let len = ctx
                .arg(0)
                .and_then(Value::as_int)
                .ok_or_else(|| anyhow::anyhow!("Missing length"))?;
            Ok(Value::Bytes(vec![7; len as usize]))
        });
        registry.register("spawn_child", |ctx| async move {
            let child = ctx.submit(TaskSpec::new("constant"), Vec::new()).await?;
            Ok(ctx.get(&child.object_ref(), WAIT).await?)
        });

        registry
    }

    async fn start(config: ClusterConfig) -> (Arc<Cluster>, Arc<Notify>) {
        let signal = Arc::new(Notify::new());
        let cluster = Cluster::start(config, registry(signal.clone()))
            .await
            .unwrap();
        (cluster, signal)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    // ============================================================
    // PRESSURE TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_referenced_object_survives_store_pressure() {
        // ARRANGE
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let store = cluster.store(&driver.node()).unwrap();
        let held = driver.put(big()).await.unwrap();

        // ACT: Each of these is dropped right away
        for _ in 0..5 {
            let _ = driver.put(big()).await.unwrap();
        }

        // ASSERT
        let value = driver.get(&held.object_ref(), WAIT).await.unwrap();
        assert_eq!(value.as_bytes().unwrap().len(), 40 * UNIT);
        assert_eq!(store.len(), 1, "Dropped objects were evicted eagerly");

        let held_ref = held.object_ref();
        drop(held);

        let err = driver.get(&held_ref, WAIT).await.unwrap_err();
        assert_eq!(
            err,
            ObjectError::Lost {
                object: held_ref.id,
                reason: LostReason::Evicted
            }
        );
        assert!(!store.contains(&held_ref.id));
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_store_full_of_referenced_objects_fails_put() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let _first = driver.put(big()).await.unwrap();
        let _second = driver.put(big()).await.unwrap();
        let err = driver.put(big()).await.unwrap_err();

        assert!(matches!(err, ObjectError::StoreFull { attempts: 2, .. }));
        assert_eq!(
            driver.counter().table().len(),
            2,
            "The failed object left no record behind"
        );
    }

    // ============================================================
    // NESTING TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recursively_nested_refs_stay_pinned_by_task() {
        // ARRANGE: array <- list <- list <- ... five levels deep
        let (cluster, signal) = start(config()).await;
        let driver = cluster.driver();
        let store = cluster.store(&driver.node()).unwrap();

        let array = driver.put(big()).await.unwrap();
        let array_ref = array.object_ref();
        let mut outer = array.clone();
        drop(array);
        for _ in 0..5 {
            outer = driver
                .put(Value::list([Value::Ref(outer.clone())]))
                .await
                .unwrap();
        }

        // ACT: Pass only the outermost ref to a blocked task, then drop it
        let result = driver
            .submit_task(TaskSpec::new("wait"), vec![outer.object_ref()])
            .await
            .unwrap();
        drop(outer);
        for _ in 0..2 {
            let _ = driver.put(big()).await.unwrap();
        }

        // ASSERT: The innermost array is still reachable
        assert!(store.contains(&array_ref.id));
        let inner = driver.get(&array_ref, WAIT).await.unwrap();
        assert_eq!(inner.as_bytes().unwrap().len(), 40 * UNIT);
        drop(inner);

        // Once the task finishes, the whole chain goes
        signal.notify_one();
        assert_eq!(
            driver.get(&result.object_ref(), WAIT).await.unwrap(),
            Value::Null
        );
        assert!(wait_until(|| !store.contains(&array_ref.id)).await);
        assert!(wait_until(|| driver.counter().table().len() == 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nested_put_pins_inner_object() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let inner = driver.put(Value::from("payload")).await.unwrap();
        let inner_ref = inner.object_ref();
        let outer = driver
            .put(Value::list([Value::Ref(inner.clone())]))
            .await
            .unwrap();
        drop(inner);

        let snapshot = driver.counter().table().snapshot(&inner_ref.id).unwrap();
        assert_eq!(snapshot.local_refs, 0);
        assert_eq!(snapshot.contained_in, 1);

        let value = driver.get(&outer.object_ref(), WAIT).await.unwrap();
        let nested = value.as_list().unwrap()[0].as_handle().unwrap().clone();
        drop(value);
        assert_eq!(nested.object_ref(), inner_ref);

        drop(outer);
        assert!(driver.counter().table().contains(&inner_ref.id), "Still held");
        drop(nested);
        assert!(!driver.counter().table().contains(&inner_ref.id));
    }

    // ============================================================
    // TASK TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crashing_task_is_retried_then_fails() {
        // ARRANGE
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let arg = driver.put(Value::Int(1)).await.unwrap();

        // ACT
        let spec = TaskSpec::new("crash")
            .with_max_retries(1)
            .with_retry_delay(Duration::ZERO);
        let result = driver
            .submit_task(spec, vec![arg.object_ref()])
            .await
            .unwrap();
        let err = driver.get(&result.object_ref(), WAIT).await.unwrap_err();

        // ASSERT
        assert!(matches!(err, ObjectError::Worker { task: Some(_), .. }));

        let task_id = driver.tasks().task_for(&result.object_ref()).unwrap();
        let task = driver.tasks().task(&task_id).unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.pin_releases, 1);
        assert!(task.pins.is_none());
        assert!(matches!(task.status, TaskStatus::Failed { .. }));

        let snapshot = driver.counter().table().snapshot(&arg.id()).unwrap();
        assert_eq!(snapshot.task_pins, 0);
        assert_eq!(
            driver.get(&arg.object_ref(), WAIT).await.unwrap(),
            Value::Int(1)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_killed_executor_attempt_is_retried() {
        let (cluster, signal) = start(config()).await;
        let driver = cluster.driver();

        let result = driver
            .submit_task(TaskSpec::new("wait").with_max_retries(1), Vec::new())
            .await
            .unwrap();
        let task_id = driver.tasks().task_for(&result.object_ref()).unwrap();

        assert!(wait_until(|| driver.tasks().running_on(&task_id).is_some()).await);
        let first = driver.tasks().kill(&task_id).unwrap();
        assert!(
            wait_until(|| driver
                .tasks()
                .running_on(&task_id)
                .is_some_and(|worker| worker != first))
            .await
        );

        signal.notify_one();
        assert_eq!(
            driver.get(&result.object_ref(), WAIT).await.unwrap(),
            Value::Null
        );
        assert_eq!(driver.tasks().task(&task_id).unwrap().attempts, 2);
        assert!(cluster.worker(&first).is_none(), "Dead workers leave the cluster");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_error_is_not_retried() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let result = driver
            .submit_task(TaskSpec::new("fail").with_max_retries(3), Vec::new())
            .await
            .unwrap();
        let err = driver.get(&result.object_ref(), WAIT).await.unwrap_err();

        match err {
            ObjectError::Task { message, .. } => assert!(message.contains("Intentional error")),
            other => panic!("expected Task error, got {:?}", other),
        }
        let task_id = driver.tasks().task_for(&result.object_ref()).unwrap();
        assert_eq!(driver.tasks().task(&task_id).unwrap().attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_argument_fails_dependent_task() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let failed = driver
            .submit_task(TaskSpec::new("fail"), Vec::new())
            .await
            .unwrap();
        let dependent = driver
            .submit_task(TaskSpec::new("echo"), vec![failed.object_ref()])
            .await
            .unwrap();

        let err = driver.get(&dependent.object_ref(), WAIT).await.unwrap_err();
        let failed_task = driver.tasks().task_for(&failed.object_ref()).unwrap();
        assert!(matches!(err, ObjectError::Task { task, .. } if task == failed_task));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_handler_fails_task() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let result = driver
            .submit_task(TaskSpec::new("missing"), Vec::new())
            .await
            .unwrap();
        let err = driver.get(&result.object_ref(), WAIT).await.unwrap_err();

        assert!(err.to_string().contains("Unknown task handler"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_can_submit_nested_task() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();

        let result = driver
            .submit_task(TaskSpec::new("spawn_child"), Vec::new())
            .await
            .unwrap();

        assert_eq!(
            driver.get(&result.object_ref(), WAIT).await.unwrap(),
            Value::Int(7)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_times_out_on_pending_task() {
        let (cluster, signal) = start(config()).await;
        let driver = cluster.driver();

        let result = driver
            .submit_task(TaskSpec::new("wait"), Vec::new())
            .await
            .unwrap();
        let err = driver
            .get(&result.object_ref(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        signal.notify_one();
        assert!(driver.get(&result.object_ref(), WAIT).await.is_ok());
    }

    // ============================================================
    // BORROWING TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_returned_ref_is_pinned_by_return_object() {
        // ARRANGE: The executor owns the inner object and returns a ref to it
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let result = driver
            .submit_task(TaskSpec::new("put_big"), Vec::new())
            .await
            .unwrap();

        // ACT
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        let inner = value.as_list().unwrap()[0].as_handle().unwrap().clone();
        drop(value);
        let inner_ref = inner.object_ref();

        // ASSERT
        assert_ne!(inner_ref.owner, driver.id());
        let data = driver.get(&inner_ref, WAIT).await.unwrap();
        assert_eq!(data.as_bytes().unwrap().len(), 40 * UNIT);
        drop(data);

        let owner_table = cluster.directory().table(&inner_ref.owner).unwrap();
        drop(inner);
        // The return object alone keeps it alive
        driver.flush().await;
        assert!(owner_table.contains(&inner_ref.id));

        drop(result);
        assert!(wait_until(|| !owner_table.contains(&inner_ref.id)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rewrapped_borrowed_ref_survives_caller_drop() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let store = cluster.store(&driver.node()).unwrap();

        let inner = driver.put(big()).await.unwrap();
        let inner_ref = inner.object_ref();
        let outer = driver
            .put(Value::list([Value::Ref(inner.clone())]))
            .await
            .unwrap();
        drop(inner);

        // The executor receives the list and returns it unchanged
        let result = driver
            .submit_task(TaskSpec::new("echo"), vec![outer.object_ref()])
            .await
            .unwrap();
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        drop(value);
        drop(outer);

        assert!(store.contains(&inner_ref.id), "Pinned by the return object");
        let data = driver.get(&inner_ref, WAIT).await.unwrap();
        assert_eq!(data.as_bytes().unwrap().len(), 40 * UNIT);
        drop(data);

        drop(result);
        assert!(wait_until(|| !store.contains(&inner_ref.id)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_borrower_release_reaches_owner() {
        let (cluster, signal) = start(config()).await;
        let driver = cluster.driver();

        let inner = driver.put(Value::from("shared")).await.unwrap();
        let outer = driver
            .put(Value::list([Value::Ref(inner.clone())]))
            .await
            .unwrap();
        let table = driver.counter().table().clone();

        let result = driver
            .submit_task(TaskSpec::new("wait"), vec![outer.object_ref()])
            .await
            .unwrap();

        // While the task runs, the executor borrows the inner object
        assert!(wait_until(|| table.snapshot(&inner.id()).unwrap().borrowers == 1).await);

        signal.notify_one();
        driver.get(&result.object_ref(), WAIT).await.unwrap();
        assert!(wait_until(|| table.snapshot(&inner.id()).unwrap().borrowers == 0).await);

        let snapshot = table.snapshot(&inner.id()).unwrap();
        assert_eq!(snapshot.task_pins, 0);
        assert_eq!(snapshot.total, 2, "Local handle plus the container pin");
    }

    // ============================================================
    // FAILURE TESTS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_owner_death_fails_borrowers() {
        // ARRANGE
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let store = cluster.store(&driver.node()).unwrap();
        let result = driver
            .submit_task(TaskSpec::new("put_big"), Vec::new())
            .await
            .unwrap();
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        let inner = value.as_list().unwrap()[0].as_handle().unwrap().clone();
        drop(value);
        let inner_ref = inner.object_ref();

        // ACT
        cluster.kill_worker(inner_ref.owner);

        // ASSERT
        let err = driver.get(&inner_ref, WAIT).await.unwrap_err();
        assert!(matches!(err, ObjectError::Worker { worker, .. } if worker == inner_ref.owner));
        assert!(!store.contains(&inner_ref.id));

        // Releasing a handle to a dead owner's object is harmless
        drop(inner);
        let err = driver.get(&result.object_ref(), WAIT).await.unwrap_err();
        assert!(matches!(err, ObjectError::Worker { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_owner_death_after_release_does_not_block_reclaim() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let result = driver
            .submit_task(TaskSpec::new("put_big"), Vec::new())
            .await
            .unwrap();
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        let inner_ref = value.as_list().unwrap()[0].as_handle().unwrap().object_ref();
        drop(value);
        drop(result);

        cluster.kill_worker(inner_ref.owner);

        assert!(driver.counter().table().is_empty());
        for store in cluster.directory().stores() {
            assert!(!store.contains(&inner_ref.id));
        }
    }

    // Single-threaded runtime: the driver's inbox only runs once the test yields, so the
    // borrower's pin is still queued when it dies.
    #[tokio::test]
    async fn test_pin_queued_by_dead_submitter_is_discarded() {
        // ARRANGE: An executor borrows an object owned by the driver
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let borrower = cluster.spawn_worker(WorkerKind::Executor, cluster.nodes()[0]);
        let object = driver.put(Value::from("shared")).await.unwrap();
        let id = object.id();
        let borrowed = borrower.adopt(object.object_ref()).await.unwrap();
        let table = driver.counter().table().clone();
        assert_eq!(table.snapshot(&id).unwrap().borrowers, 1);

        // ACT: The borrower submits a task on it and dies before the pin is applied
        let result = borrower
            .submit_task(TaskSpec::new("wait"), vec![borrowed.object_ref()])
            .await
            .unwrap();
        cluster.kill_worker(borrower.id());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ASSERT: Neither the pin nor the borrow outlives the borrower
        let snapshot = table.snapshot(&id).unwrap();
        assert_eq!(snapshot.task_pins, 0);
        assert_eq!(snapshot.borrowers, 0);
        assert_eq!(snapshot.total, 1);
        assert!(cluster.worker(&borrower.id()).is_none());

        drop(object);
        driver.flush().await;
        assert!(!table.contains(&id), "Object reclaimed once the driver lets go");
        drop((borrowed, result));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lost_task_output_is_reconstructed() {
        // ARRANGE: The executor lives on node 0, the driver on node 1
        let mut config = config();
        config.num_nodes = 2;
        let (cluster, _) = start(config).await;
        let nodes = cluster.nodes().to_vec();
        let driver = cluster.driver_on(nodes[1]);

        let len = driver.put(Value::Int(64)).await.unwrap();
        let spec = TaskSpec::new("make_bytes").with_max_retries(1);
        let result = driver
            .submit_task(spec, vec![len.object_ref()])
            .await
            .unwrap();
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        assert_eq!(value.as_bytes().unwrap(), &[7u8; 64][..]);

        let table = driver.counter().table();
        assert!(matches!(
            table.status(&result.id()),
            Some(ObjectStatus::Ready { node, .. }) if node == nodes[0]
        ));

        // ACT: Lose node 0 with the only copy
        cluster.fail_node(&nodes[0]);

        // ASSERT
        let value = driver.get(&result.object_ref(), WAIT).await.unwrap();
        assert_eq!(value.as_bytes().unwrap().len(), 64);
        assert!(matches!(
            table.status(&result.id()),
            Some(ObjectStatus::Ready { node, .. }) if node == nodes[1]
        ));

        // The budget is spent: the next loss is final
        cluster.store(&nodes[1]).unwrap().evict(&result.id());
        let err = driver.get(&result.object_ref(), WAIT).await.unwrap_err();
        assert_eq!(
            err,
            ObjectError::Lost {
                object: result.id(),
                reason: LostReason::LineageExhausted
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lost_put_object_cannot_be_reconstructed() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let object = driver.put(Value::Int(3)).await.unwrap();

        cluster.store(&driver.node()).unwrap().evict(&object.id());

        let err = driver.get(&object.object_ref(), WAIT).await.unwrap_err();
        assert_eq!(
            err,
            ObjectError::Lost {
                object: object.id(),
                reason: LostReason::NoLineage
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_object_on_failed_store_reports_node_failure() {
        let (cluster, _) = start(config()).await;
        let driver = cluster.driver();
        let object = driver.put(Value::Int(3)).await.unwrap();

        cluster.store(&driver.node()).unwrap().fail();

        let err = driver.get(&object.object_ref(), WAIT).await.unwrap_err();
        assert_eq!(
            err,
            ObjectError::Lost {
                object: object.id(),
                reason: LostReason::NodeFailed
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_partitioned_owner_is_declared_dead() {
        let mut config = config();
        config.suspect_timeout_ms = 100;
        config.dead_timeout_ms = 200;
        let (cluster, _) = start(config).await;
        let driver = cluster.driver();
        let owner = cluster.spawn_worker(WorkerKind::Executor, cluster.nodes()[0]);

        let object = owner.put(Value::from("remote")).await.unwrap();
        let borrowed = driver.adopt(object.object_ref()).await.unwrap();
        assert_eq!(
            driver.get(&borrowed.object_ref(), WAIT).await.unwrap(),
            Value::from("remote")
        );

        cluster.partition_worker(&owner.id());

        assert!(wait_until(|| !owner.is_alive()).await);
        let err = driver.get(&borrowed.object_ref(), WAIT).await.unwrap_err();
        assert!(matches!(err, ObjectError::Worker { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stats_report_nodes_and_workers() {
        let mut config = config();
        config.num_nodes = 2;
        config.num_workers = 2;
        let (cluster, _) = start(config).await;
        let driver = cluster.driver();
        let _object = driver.put(Value::Int(1)).await.unwrap();

        let stats = cluster.stats();

        assert_eq!(stats.nodes.len(), 2);
        assert_eq!(stats.workers.len(), 3);
        assert_eq!(stats.nodes[0].objects, 1);
        assert!(stats.workers.iter().all(|worker| worker.alive));

        cluster.shutdown();
        assert!(!driver.is_alive());
    }
}
