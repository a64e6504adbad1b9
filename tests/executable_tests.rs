//! Compilation and replicated execution

mod common;

use std::sync::{mpsc, Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use common::{add_program, scale_by_replica_program, HostFixture};
use replicaforge::executable::LocalExecutable;
use replicaforge::platform::CustomCallTarget;
use replicaforge::program::ComputationBuilder;
use replicaforge::{BuildOptions, ElementType, ErrorCode, ForgeError, HostValue, LocalBuffer, Shape};

fn replicated(n: usize) -> BuildOptions {
    BuildOptions::new().with_num_replicas(n)
}

#[test]
fn test_single_replica_add() -> anyhow::Result<()> {
    let fixture = HostFixture::new(1);
    let client = fixture.client();
    let shape = Shape::array(ElementType::F32, &[4]);
    let exe = LocalExecutable::compile(&add_program(&shape), vec![shape.clone(); 2], None, client)?;
    assert_eq!(exe.name(), "add");
    assert_eq!(exe.result_shape(), &shape);

    let x = LocalBuffer::from_host(&HostValue::vector(&[1.0f32, 2.0, 3.0, 4.0]), client, 0)?;
    let y = LocalBuffer::from_host(&HostValue::vector(&[0.5f32; 4]), client, 0)?;
    let sum = exe.execute(&[&x, &y])?;
    assert_eq!(sum.on_host_shape(), &shape);
    assert_eq!(sum.to_host()?.to_vec::<f32>(), Some(vec![1.5, 2.5, 3.5, 4.5]));

    // arguments stay usable after execution
    assert_eq!(x.to_host()?.to_vec::<f32>(), Some(vec![1.0, 2.0, 3.0, 4.0]));

    drop((x, y, sum, exe));
    fixture.assert_no_leak();
    Ok(())
}

#[test]
fn test_execute_per_replica_orders_results() {
    let fixture = HostFixture::new(3);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[3]);
    let exe = LocalExecutable::compile(
        &scale_by_replica_program(3),
        vec![shape],
        Some(&replicated(3)),
        client,
    )
    .unwrap();
    assert_eq!(exe.device_ordinals(), vec![0, 1, 2]);

    let inputs: Vec<LocalBuffer> = (0..3)
        .map(|r| LocalBuffer::from_host(&HostValue::vector(&[1i32, 2, 3]), client, r).unwrap())
        .collect();
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
    let results = exe.execute_per_replica(&arguments).unwrap();

    assert_eq!(results.len(), 3);
    for (replica, result) in results.iter().enumerate() {
        let r = replica as i32;
        assert_eq!(result.device_ordinal(), replica);
        assert_eq!(
            result.to_host().unwrap(),
            HostValue::tuple(vec![
                HostValue::vector(&[r, 2 * r, 3 * r]),
                HostValue::scalar(r),
            ])
        );
    }

    let parts = results[2].destructure_tuple().unwrap();
    assert_eq!(parts[1].to_host().unwrap(), HostValue::scalar(2i32));

    drop((parts, results, inputs, exe));
    fixture.assert_no_leak();
}

#[test]
fn test_argument_validation() {
    let fixture = HostFixture::new(2);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S64, &[2]);
    let exe = LocalExecutable::compile(&add_program(&shape), vec![shape.clone(); 2], None, client)
        .unwrap();

    let a = LocalBuffer::from_host(&HostValue::vector(&[1i64, 2]), client, 0).unwrap();
    let b = LocalBuffer::from_host(&HostValue::vector(&[3i64, 4]), client, 0).unwrap();
    let elsewhere = LocalBuffer::from_host(&HostValue::vector(&[5i64, 6]), client, 1).unwrap();
    let wrong_shape = LocalBuffer::from_host(&HostValue::vector(&[1i32, 2]), client, 0).unwrap();
    let mut deleted = LocalBuffer::from_host(&HostValue::vector(&[7i64, 8]), client, 0).unwrap();
    deleted.delete();

    let cases: Vec<(Vec<&LocalBuffer>, &str)> = vec![
        (vec![&a], "takes 2 arguments"),
        (vec![&a, &deleted], "deleted"),
        (vec![&a, &elsewhere], "device 1"),
        (vec![&wrong_shape, &b], "parameter expects"),
    ];
    for (arguments, needle) in cases {
        let err = exe.execute(&arguments).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "{}", err);
        assert!(err.to_string().contains(needle), "{} lacks {:?}", err, needle);
    }
    assert_eq!(fixture.platform().device_stats(0).unwrap().executions, 0);

    let sum = exe.execute(&[&a, &b]).unwrap();
    assert_eq!(sum.to_host().unwrap().to_vec::<i64>(), Some(vec![4, 6]));
}

#[test]
fn test_replica_count_mismatch_runs_nothing() {
    let fixture = HostFixture::new(2);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[2]);
    let exe = LocalExecutable::compile(
        &scale_by_replica_program(2),
        vec![shape],
        Some(&replicated(2)),
        client,
    )
    .unwrap();
    let x = LocalBuffer::from_host(&HostValue::vector(&[1i32, 1]), client, 0).unwrap();

    let err = exe.execute_per_replica(&[vec![&x]]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = exe.execute(&[&x]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    // replica 1 runs on device 1 but x lives on device 0; replica 0 must not run either
    let err = exe.execute_per_replica(&[vec![&x], vec![&x]]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    for ordinal in 0..2 {
        assert_eq!(fixture.platform().device_stats(ordinal).unwrap().executions, 0);
    }
}

#[test]
fn test_deleted_program_is_failed_precondition() {
    let fixture = HostFixture::new(2);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[1]);
    let mut exe = LocalExecutable::compile(
        &scale_by_replica_program(1),
        vec![shape],
        Some(&replicated(2)),
        client,
    )
    .unwrap();
    exe.delete();

    let err = exe.execute_per_replica(&[vec![], vec![]]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    assert_eq!(exe.device_ordinals(), vec![0, 1]);
}

#[test]
fn test_failing_replica_reports_lowest_index() {
    let fixture = HostFixture::new(3);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[2]);
    let exe = LocalExecutable::compile(
        &scale_by_replica_program(2),
        vec![shape],
        Some(&replicated(3)),
        client,
    )
    .unwrap();
    fixture.platform().fail_executions_on(1, true).unwrap();
    fixture.platform().fail_executions_on(2, true).unwrap();

    {
        let inputs: Vec<LocalBuffer> = (0..3)
            .map(|r| LocalBuffer::from_host(&HostValue::vector(&[4i32, 5]), client, r).unwrap())
            .collect();
        let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
        let err = exe.execute_per_replica(&arguments).unwrap_err();
        assert!(matches!(err, ForgeError::Driver { .. }));
        assert_eq!(err.code(), ErrorCode::Internal);
        let message = err.to_string();
        assert!(message.contains("replica 1"), "{}", message);
        assert!(message.contains("device 1"), "{}", message);
    }
    // replica 0 succeeded, but its output was dropped with the failed call
    fixture.assert_no_leak();

    fixture.platform().fail_executions_on(1, false).unwrap();
    fixture.platform().fail_executions_on(2, false).unwrap();
    let inputs: Vec<LocalBuffer> = (0..3)
        .map(|r| LocalBuffer::from_host(&HostValue::vector(&[4i32, 5]), client, r).unwrap())
        .collect();
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
    assert_eq!(exe.execute_per_replica(&arguments).unwrap().len(), 3);
}

fn sleeping_identity(delay: Duration) -> CustomCallTarget {
    Arc::new(move |inputs: &[&[u8]]| {
        thread::sleep(delay);
        Ok::<_, String>(inputs.first().map(|b| b.to_vec()).unwrap_or_default())
    })
}

fn custom_call_program(target: &str, shape: &Shape) -> replicaforge::Computation {
    let mut b = ComputationBuilder::new(target);
    let x = b.parameter(0, shape.clone());
    let out = b.custom_call(target, &[x], shape.clone());
    b.build(out)
}

#[test]
fn test_one_execution_per_device_at_a_time() {
    let fixture = HostFixture::new(1);
    fixture
        .platform()
        .register_custom_call_target("slow_identity", sleeping_identity(Duration::from_millis(20)));
    let client = fixture.client();
    let shape = Shape::array(ElementType::U32, &[2]);
    let exe = Arc::new(
        LocalExecutable::compile(
            &custom_call_program("slow_identity", &shape),
            vec![shape],
            None,
            client,
        )
        .unwrap(),
    );

    let callers = 4;
    let start = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let exe = Arc::clone(&exe);
            let client = Arc::clone(client);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let value = HostValue::vector(&[i as u32, 1]);
                let x = LocalBuffer::from_host(&value, &client, 0).unwrap();
                start.wait();
                let out = exe.execute(&[&x]).unwrap();
                assert_eq!(out.to_host().unwrap(), value);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = fixture.platform().device_stats(0).unwrap();
    assert_eq!(stats.executions, callers);
    assert_eq!(stats.peak_concurrent_executions, 1);
    drop(exe);
    fixture.assert_no_leak();
}

/// Custom call that waits until `parties` calls are in flight at once
fn rendezvous(parties: usize) -> CustomCallTarget {
    let state = Arc::new((Mutex::new(0usize), Condvar::new()));
    Arc::new(move |inputs: &[&[u8]]| -> Result<Vec<u8>, String> {
        let (arrived, cvar) = &*state;
        let mut count = arrived.lock().map_err(|e| e.to_string())?;
        *count += 1;
        cvar.notify_all();
        let (count, timeout) = cvar
            .wait_timeout_while(count, Duration::from_secs(10), |c| *c < parties)
            .map_err(|e| e.to_string())?;
        if timeout.timed_out() && *count < parties {
            return Err(format!("only {} of {} replicas arrived", *count, parties));
        }
        Ok(inputs.first().map(|b| b.to_vec()).unwrap_or_default())
    })
}

#[test]
fn test_replicas_on_different_devices_run_concurrently() {
    let fixture = HostFixture::new(2);
    fixture
        .platform()
        .register_custom_call_target("rendezvous", rendezvous(2));
    let client = fixture.client();
    let shape = Shape::array(ElementType::F64, &[1]);
    let exe = LocalExecutable::compile(
        &custom_call_program("rendezvous", &shape),
        vec![shape],
        Some(&replicated(2)),
        client,
    )
    .unwrap();

    let inputs: Vec<LocalBuffer> = (0..2)
        .map(|r| LocalBuffer::from_host(&HostValue::vector(&[r as f64]), client, r).unwrap())
        .collect();
    let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
    let results = exe.execute_per_replica(&arguments).unwrap();

    assert_eq!(results[1].to_host().unwrap().to_vec::<f64>(), Some(vec![1.0]));
    assert_eq!(fixture.platform().peak_concurrent_executions(), 2);
}

#[test]
fn test_custom_call_target_transforms_bytes() {
    let fixture = HostFixture::new(1);
    let negate: CustomCallTarget = Arc::new(|inputs: &[&[u8]]| -> Result<Vec<u8>, String> {
        let bytes = inputs.first().ok_or("missing operand")?;
        Ok(bytes
            .chunks_exact(4)
            .flat_map(|c| (-i32::from_le_bytes([c[0], c[1], c[2], c[3]])).to_le_bytes())
            .collect())
    });
    fixture.platform().register_custom_call_target("negate", negate);

    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[3]);
    let exe = LocalExecutable::compile(
        &custom_call_program("negate", &shape),
        vec![shape],
        None,
        client,
    )
    .unwrap();
    let x = LocalBuffer::from_host(&HostValue::vector(&[1i32, -2, 3]), client, 0).unwrap();
    let out = exe.execute(&[&x]).unwrap();
    assert_eq!(out.to_host().unwrap().to_vec::<i32>(), Some(vec![-1, 2, -3]));

    let missing = LocalExecutable::compile(
        &custom_call_program("not_registered", &Shape::array(ElementType::S32, &[3])),
        vec![Shape::array(ElementType::S32, &[3])],
        None,
        client,
    )
    .unwrap();
    let err = missing.execute(&[&x]).unwrap_err();
    assert!(err.to_string().contains("not_registered"), "{}", err);
}

#[test]
fn test_compile_errors_surface_program_name() {
    let fixture = HostFixture::new(1);
    let shape = Shape::array(ElementType::F32, &[2]);
    let err = LocalExecutable::compile(
        &add_program(&shape),
        vec![shape.clone()],
        None,
        fixture.client(),
    )
    .unwrap_err();
    assert!(matches!(err, ForgeError::Compile { .. }));
    assert!(err.to_string().contains("add"), "{}", err);
}

#[test]
fn test_execute_waits_for_pending_argument_transfer() {
    let fixture = HostFixture::new(1);
    let client = fixture.client();
    let shape = Shape::array(ElementType::S32, &[3]);
    let exe = Arc::new(
        LocalExecutable::compile(&add_program(&shape), vec![shape.clone(); 2], None, client)
            .unwrap(),
    );

    fixture.platform().hold_copies().unwrap();
    let x = LocalBuffer::from_host(&HostValue::vector(&[1i32, 2, 3]), client, 0).unwrap();
    let y = LocalBuffer::from_host(&HostValue::vector(&[10i32, 20, 30]), client, 0).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let runner = {
        let exe = Arc::clone(&exe);
        thread::spawn(move || {
            let result = exe.execute(&[&x, &y]).and_then(|sum| sum.to_host());
            let _ = done_tx.send(result);
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(fixture.platform().device_stats(0).unwrap().executions, 0);

    fixture.platform().release_copies().unwrap();
    let sum = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("execute should finish once its arguments land")
        .unwrap();
    assert_eq!(sum.to_vec::<i32>(), Some(vec![11, 22, 33]));
    assert_eq!(fixture.platform().device_stats(0).unwrap().executions, 1);
    runner.join().unwrap();
}

#[test]
fn test_replicated_execute_from_a_worker_thread() {
    let fixture = HostFixture::new(2);
    fixture
        .platform()
        .register_custom_call_target("rendezvous", rendezvous(2));
    let client = fixture.client();
    let shape = Shape::array(ElementType::F64, &[1]);
    let exe = Arc::new(
        LocalExecutable::compile(
            &custom_call_program("rendezvous", &shape),
            vec![shape],
            Some(&replicated(2)),
            client,
        )
        .unwrap(),
    );
    let inputs: Vec<LocalBuffer> = (0..2)
        .map(|r| LocalBuffer::from_host(&HostValue::vector(&[r as f64]), client, r).unwrap())
        .collect();

    // replica 0 runs inline on this worker and waits for replica 1
    let (done_tx, done_rx) = mpsc::channel();
    let task_exe = Arc::clone(&exe);
    client
        .worker(0)
        .unwrap()
        .schedule(move || {
            let arguments: Vec<Vec<&LocalBuffer>> = inputs.iter().map(|b| vec![b]).collect();
            let result = task_exe
                .execute_per_replica(&arguments)
                .and_then(|results| results[1].to_host());
            let _ = done_tx.send(result);
        })
        .unwrap();

    let second = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("replicas dispatched from a worker should meet")
        .unwrap();
    assert_eq!(second.to_vec::<f64>(), Some(vec![1.0]));
    assert_eq!(fixture.platform().peak_concurrent_executions(), 2);
}
