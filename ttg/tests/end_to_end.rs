//! Scenario-level coverage of the runtime's public surface: operators wired into a graph through
//! edges, driven by a `World`, observed via plain shared state rather than inspecting internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use ttg::rank::KeyMap;
use ttg::transport::{AmHandler, GetCompletion, LoopbackTransport, RegionHandle, Transport};
use ttg::{Access, Edge, Op, OperatorShell, Outputs, Rank, SingleRank, TtgError, World, WorldConfigBuilder};

/// Wraps a `LoopbackTransport`, counting every active message sent on `DATA_TAG` by destination
/// rank, so a test can assert on how many frames actually crossed the wire rather than just on
/// the values that eventually arrived.
struct CountingTransport {
    inner: Arc<LoopbackTransport>,
    sent_per_rank: Mutex<HashMap<Rank, usize>>,
}

impl CountingTransport {
    fn new(inner: Arc<LoopbackTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sent_per_rank: Mutex::new(HashMap::new()),
        })
    }

    fn frames_sent_to(&self, rank: Rank) -> usize {
        *self.sent_per_rank.lock().unwrap().get(&rank).unwrap_or(&0)
    }
}

impl Transport for CountingTransport {
    fn register_tag(&self, tag: u64, handler: AmHandler, max_size: usize) {
        self.inner.register_tag(tag, handler, max_size);
    }

    fn send_am(&self, tag: u64, dest: Rank, bytes: &[u8]) {
        if tag == ttg::transport::DATA_TAG {
            *self.sent_per_rank.lock().unwrap().entry(dest).or_insert(0) += 1;
        }
        self.inner.send_am(tag, dest, bytes);
    }

    fn mem_register(&self, buf: &[u8]) -> RegionHandle {
        self.inner.mem_register(buf)
    }

    fn mem_unregister(&self, handle: RegionHandle) {
        self.inner.mem_unregister(handle);
    }

    fn get(&self, local: RegionHandle, remote: RegionHandle, size: usize, dest: Rank, completion: GetCompletion) {
        self.inner.get(local, remote, size, dest, completion);
    }
}

fn test_world(world_size: usize, worker_threads: usize) -> Arc<World> {
    let config = WorldConfigBuilder::new()
        .rank(Rank(0))
        .world_size(world_size)
        .worker_threads(worker_threads)
        .build();
    let transport = ttg::transport::LoopbackTransport::new(config.rank);
    let termination = ttg::termination::ReferenceCountingDetector::new(config.rank, config.world_size, transport.clone());
    let scheduler = ttg::scheduler::ThreadPoolScheduler::new(config.worker_threads);
    World::new(config, scheduler, transport, termination)
}

fn panic_on_error(e: TtgError) {
    panic!("unexpected operator error: {e}");
}

// Scenario 1: a two-stage scalar pipeline, `double` feeding `collect`, the hand-coded analogue of
// a tiny SpGEMM-style producer/consumer chain.
#[test]
fn scalar_pipeline_fires_downstream_task_once() {
    struct Double;
    impl Op<i32> for Double {
        type Args = (i32, ());
        fn call(&self, key: i32, args: Self::Args, outputs: &Outputs<i32>) -> Result<(), TtgError> {
            outputs.send(0, key, args.0 * 2);
            Ok(())
        }
    }

    struct Collect(Arc<Mutex<Vec<(i32, i32)>>>);
    impl Op<i32> for Collect {
        type Args = (i32, ());
        fn call(&self, key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push((key, args.0));
            Ok(())
        }
    }

    let world = test_world(1, 2);
    let collected = Arc::new(Mutex::new(Vec::new()));

    let double = OperatorShell::new("double", Double, |_: &i32| 0, 1, panic_on_error, world.scheduler().clone());
    let collect = OperatorShell::new(
        "collect",
        Collect(Arc::clone(&collected)),
        |_: &i32| 0,
        1,
        panic_on_error,
        world.scheduler().clone(),
    );

    let in_edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&in_edge, &double, 0, Access::ReadOnly);

    let mid_edge: Edge<i32, i32> = Edge::new();
    double.outputs().bind_port(0, mid_edge.clone());
    world.connect_input(&mid_edge, &collect, 0, Access::ReadOnly);

    // `collect` never calls `Outputs::send`, so it declares no output ports at all; the topology
    // check only flags a port that was bound but left without any consumer.
    world.register_operator(double.clone()).unwrap();
    world.register_operator(collect.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    in_edge.send(7, 3);
    world.fence().unwrap();

    assert_eq!(*collected.lock().unwrap(), vec![(7, 6)]);
}

// Scenario 2: a control-only pipeline where the payload type is `()` and only the key carries
// information, matching a pure dependency-trigger edge.
#[test]
fn control_only_edge_fires_on_key_alone() {
    struct Tick(Arc<AtomicI64>);
    impl Op<i32> for Tick {
        type Args = ((), ());
        fn call(&self, key: i32, _args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.fetch_add(key as i64, Ordering::SeqCst);
            Ok(())
        }
    }

    let world = test_world(1, 2);
    let total = Arc::new(AtomicI64::new(0));
    let tick = OperatorShell::new("tick", Tick(Arc::clone(&total)), |_: &i32| 0, 1, panic_on_error, world.scheduler().clone());

    let in_edge: Edge<i32, ()> = Edge::new();
    world.connect_input(&in_edge, &tick, 0, Access::ReadOnly);
    world.register_operator(tick.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    in_edge.broadcast(&[1, 2, 3], ());
    world.fence().unwrap();

    assert_eq!(total.load(Ordering::SeqCst), 6);
}

// Scenario 3: a value broadcast across 1000 keys partitioned over 3 ranks by key-map, each
// non-local rank's share arriving in exactly one frame.
#[test]
fn scatter_across_ranks_delivers_one_frame_per_destination() {
    struct Sink(Arc<Mutex<f64>>);
    impl Op<i32> for Sink {
        type Args = (f64, ());
        fn call(&self, _key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            *self.0.lock().unwrap() += args.0;
            Ok(())
        }
    }

    let raw0 = LoopbackTransport::new(Rank(0));
    let raw1 = LoopbackTransport::new(Rank(1));
    let raw2 = LoopbackTransport::new(Rank(2));
    raw0.connect(&raw1);
    raw0.connect(&raw2);
    raw1.connect(&raw2);

    let counting0 = CountingTransport::new(raw0);
    let transport0: Arc<dyn Transport> = counting0.clone();

    let config0 = WorldConfigBuilder::new().rank(Rank(0)).world_size(3).worker_threads(2).build();
    let termination0 = ttg::termination::ReferenceCountingDetector::new(config0.rank, config0.world_size, Arc::clone(&transport0));
    let scheduler0 = ttg::scheduler::ThreadPoolScheduler::new(config0.worker_threads);
    let world0 = World::new(config0, scheduler0, Arc::clone(&transport0), termination0);

    let config1 = WorldConfigBuilder::new().rank(Rank(1)).world_size(3).worker_threads(2).build();
    let termination1 = ttg::termination::ReferenceCountingDetector::new(config1.rank, config1.world_size, raw1.clone());
    let scheduler1 = ttg::scheduler::ThreadPoolScheduler::new(config1.worker_threads);
    let world1 = World::new(config1, scheduler1, raw1.clone(), termination1);

    let config2 = WorldConfigBuilder::new().rank(Rank(2)).world_size(3).worker_threads(2).build();
    let termination2 = ttg::termination::ReferenceCountingDetector::new(config2.rank, config2.world_size, raw2.clone());
    let scheduler2 = ttg::scheduler::ThreadPoolScheduler::new(config2.worker_threads);
    let world2 = World::new(config2, scheduler2, raw2.clone(), termination2);

    let sums0 = Arc::new(Mutex::new(0.0_f64));
    let sums1 = Arc::new(Mutex::new(0.0_f64));
    let sums2 = Arc::new(Mutex::new(0.0_f64));

    let sink0 = OperatorShell::new("sink", Sink(Arc::clone(&sums0)), |_: &i32| 0, 2, panic_on_error, world0.scheduler().clone());
    let sink1 = OperatorShell::new("sink", Sink(Arc::clone(&sums1)), |_: &i32| 0, 2, panic_on_error, world1.scheduler().clone());
    let sink2 = OperatorShell::new("sink", Sink(Arc::clone(&sums2)), |_: &i32| 0, 2, panic_on_error, world2.scheduler().clone());

    let out_edge: Edge<i32, f64> = Edge::new();
    world0.connect_input(&out_edge, &sink0, 0, Access::ReadOnly);
    let edge1: Edge<i32, f64> = Edge::new();
    world1.connect_input(&edge1, &sink1, 0, Access::ReadOnly);
    let edge2: Edge<i32, f64> = Edge::new();
    world2.connect_input(&edge2, &sink2, 0, Access::ReadOnly);

    let keymap: Arc<dyn KeyMap<i32>> = Arc::new(|key: &i32| Rank((*key as u32) % 3));
    world0.connect_remote_input(&out_edge, Arc::clone(&keymap), "sink", 0);

    world0.register_operator(sink0.clone()).unwrap();
    world1.register_operator(sink1.clone()).unwrap();
    world2.register_operator(sink2.clone()).unwrap();
    world0.make_executable().unwrap();
    world1.make_executable().unwrap();
    world2.make_executable().unwrap();
    world0.execute();
    world1.execute();
    world2.execute();

    let keys: Vec<i32> = (0..1000).collect();
    out_edge.broadcast(&keys, 7.0);

    let w1 = Arc::clone(&world1);
    let w2 = Arc::clone(&world2);
    let h1 = std::thread::spawn(move || w1.fence());
    let h2 = std::thread::spawn(move || w2.fence());
    world0.fence().unwrap();
    h1.join().unwrap().unwrap();
    h2.join().unwrap().unwrap();

    assert_eq!(counting0.frames_sent_to(Rank(1)), 1);
    assert_eq!(counting0.frames_sent_to(Rank(2)), 1);

    let total = *sums0.lock().unwrap() + *sums1.lock().unwrap() + *sums2.lock().unwrap();
    assert!((total - 7000.0).abs() < 1e-9, "total was {total}");
}

// A two-input operator only fires once both of its broadcast-delivered inputs have arrived for a
// given key.
#[test]
fn broadcast_fan_in_waits_for_both_inputs() {
    struct Sum(Arc<Mutex<Vec<i32>>>);
    impl Op<i32> for Sum {
        type Args = (i32, (i32, ()));
        fn call(&self, _key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push(args.0 + (args.1).0);
            Ok(())
        }
    }

    let world = test_world(1, 2);
    let sums = Arc::new(Mutex::new(Vec::new()));
    let sum = OperatorShell::new("sum", Sum(Arc::clone(&sums)), |_: &i32| 0, 1, panic_on_error, world.scheduler().clone());

    let a_edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&a_edge, &sum, 0, Access::ReadOnly);
    let b_edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&b_edge, &sum, 1, Access::ReadOnly);

    world.register_operator(sum.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    a_edge.broadcast(&[1, 2, 3], 10);
    assert_eq!(sums.lock().unwrap().len(), 0, "should not fire until input 1 arrives");
    b_edge.broadcast(&[1, 2, 3], 5);
    world.fence().unwrap();

    let mut got = sums.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, vec![15, 15, 15]);
}

// Scenario 4: a mutable-access consumer forces the deferred-writer dance when a second,
// read-only consumer is also bound to the same edge.
#[test]
fn mutable_and_readonly_fan_out_both_observe_the_value() {
    struct Seen(Arc<Mutex<Vec<i32>>>, Access);
    impl Op<i32> for Seen {
        type Args = (i32, ());
        fn call(&self, _key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push(args.0);
            Ok(())
        }
    }

    let world = test_world(1, 2);
    let reader_seen = Arc::new(Mutex::new(Vec::new()));
    let writer_seen = Arc::new(Mutex::new(Vec::new()));

    let reader = OperatorShell::new(
        "reader",
        Seen(Arc::clone(&reader_seen), Access::ReadOnly),
        |_: &i32| 0,
        1,
        panic_on_error,
        world.scheduler().clone(),
    );
    let writer = OperatorShell::new(
        "writer",
        Seen(Arc::clone(&writer_seen), Access::Mutable),
        |_: &i32| 0,
        1,
        panic_on_error,
        world.scheduler().clone(),
    );

    let edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&edge, &reader, 0, Access::ReadOnly);
    world.connect_input(&edge, &writer, 0, Access::Mutable);

    world.register_operator(reader.clone()).unwrap();
    world.register_operator(writer.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    edge.send(1, 42);
    world.fence().unwrap();

    assert_eq!(*reader_seen.lock().unwrap(), vec![42]);
    assert_eq!(*writer_seen.lock().unwrap(), vec![42]);
}

// Scenario 5: a streaming reducer input folds several values into one before the task fires.
#[test]
fn streaming_reducer_folds_values_before_firing() {
    struct Reduced(Arc<Mutex<Vec<i32>>>);
    impl Op<i32> for Reduced {
        type Args = (i32, ());
        fn call(&self, _key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push(args.0);
            Ok(())
        }
    }

    let world = test_world(1, 2);
    let results = Arc::new(Mutex::new(Vec::new()));
    let reducer_op = OperatorShell::new(
        "reducer",
        Reduced(Arc::clone(&results)),
        |_: &i32| 0,
        1,
        panic_on_error,
        world.scheduler().clone(),
    );
    reducer_op.set_input_reducer::<i32>(0, |a, b| a + b);

    let edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&edge, &reducer_op, 0, Access::ReadOnly);
    world.register_operator(reducer_op.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    reducer_op.set_argstream_size(0, &9, 3).unwrap();
    edge.send(9, 1);
    edge.send(9, 2);
    edge.send(9, 3);
    world.fence().unwrap();

    assert_eq!(*results.lock().unwrap(), vec![6]);
}

// Scenario 6: delayed unpack — a frame addressed to an operator the receiving rank hasn't
// registered yet is held, then replayed and fires once that operator is wired up.
#[test]
fn remote_frame_held_until_destination_operator_is_wired_then_fires() {
    struct Landed(Arc<Mutex<Vec<(i32, i64)>>>);
    impl Op<i32> for Landed {
        type Args = (i64, ());
        fn call(&self, key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push((key, args.0));
            Ok(())
        }
    }

    let raw0 = LoopbackTransport::new(Rank(0));
    let raw1 = LoopbackTransport::new(Rank(1));
    raw0.connect(&raw1);

    let config0 = WorldConfigBuilder::new().rank(Rank(0)).world_size(2).worker_threads(1).build();
    let termination0 = ttg::termination::ReferenceCountingDetector::new(config0.rank, config0.world_size, raw0.clone());
    let scheduler0 = ttg::scheduler::ThreadPoolScheduler::new(config0.worker_threads);
    let world0 = World::new(config0, scheduler0, raw0.clone(), termination0);

    let config1 = WorldConfigBuilder::new().rank(Rank(1)).world_size(2).worker_threads(1).build();
    let termination1 = ttg::termination::ReferenceCountingDetector::new(config1.rank, config1.world_size, raw1.clone());
    let scheduler1 = ttg::scheduler::ThreadPoolScheduler::new(config1.worker_threads);
    let world1 = World::new(config1, scheduler1, raw1.clone(), termination1);

    // Rank 1's own copy of the same "dest" operator: it never receives anything locally (nothing
    // ever targets it there), but registering it gives both ranks the matching taskpool that
    // termination detection gossips over.
    let dest1 = OperatorShell::new(
        "dest",
        Landed(Arc::new(Mutex::new(Vec::new()))),
        |_: &i32| 0,
        1,
        panic_on_error,
        world1.scheduler().clone(),
    );
    let placeholder_edge: Edge<i32, i64> = Edge::new();
    world1.connect_input(&placeholder_edge, &dest1, 0, Access::ReadOnly);
    world1.register_operator(dest1.clone()).unwrap();
    world1.make_executable().unwrap();
    world1.execute();

    // Rank 1 routes key 42 to rank 0's "dest" before rank 0 has registered or wired it up at all.
    let out_edge: Edge<i32, i64> = Edge::new();
    world1.connect_remote_input(&out_edge, Arc::new(SingleRank(Rank(0))), "dest", 0);
    out_edge.send(42, 99);

    let landed = Arc::new(Mutex::new(Vec::new()));
    let dest0 = OperatorShell::new("dest", Landed(Arc::clone(&landed)), |_: &i32| 0, 1, panic_on_error, world0.scheduler().clone());
    let in_edge: Edge<i32, i64> = Edge::new();
    world0.connect_input(&in_edge, &dest0, 0, Access::ReadOnly);
    world0.register_operator(dest0.clone()).unwrap();
    world0.make_executable().unwrap();
    world0.execute();

    let w1 = Arc::clone(&world1);
    let h1 = std::thread::spawn(move || w1.fence());
    world0.fence().unwrap();
    h1.join().unwrap().unwrap();

    assert_eq!(*landed.lock().unwrap(), vec![(42, 99)]);
}

// Boundary: an empty graph fences immediately with no registered operators.
#[test]
fn empty_graph_fences_without_blocking() {
    let world = test_world(1, 1);
    world.make_executable().unwrap();
    world.execute();
    world.fence().unwrap();
}

// Boundary: a zero-input ("control source") operator is fired directly via `invoke_noarg`
// rather than through argument accumulation.
#[test]
fn zero_input_operator_fires_via_invoke_noarg() {
    struct Source(Arc<Mutex<Vec<i32>>>);
    impl Op<i32> for Source {
        type Args = ();
        fn call(&self, key: i32, _args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push(key);
            Ok(())
        }
    }

    let world = test_world(1, 1);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let source = OperatorShell::new("source", Source(Arc::clone(&fired)), |_: &i32| 0, 1, panic_on_error, world.scheduler().clone());
    world.register_operator(source.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    source.invoke_noarg(5);
    world.fence().unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![5]);
}

// Boundary: a streaming input declared with size 1 fires on its very first value.
#[test]
fn streaming_input_with_size_one_fires_immediately() {
    struct Reduced(Arc<Mutex<Vec<i32>>>);
    impl Op<i32> for Reduced {
        type Args = (i32, ());
        fn call(&self, _key: i32, args: Self::Args, _outputs: &Outputs<i32>) -> Result<(), TtgError> {
            self.0.lock().unwrap().push(args.0);
            Ok(())
        }
    }

    let world = test_world(1, 1);
    let results = Arc::new(Mutex::new(Vec::new()));
    let reducer_op = OperatorShell::new(
        "reducer",
        Reduced(Arc::clone(&results)),
        |_: &i32| 0,
        1,
        panic_on_error,
        world.scheduler().clone(),
    );
    reducer_op.set_input_reducer::<i32>(0, |a, _b| a);

    let edge: Edge<i32, i32> = Edge::new();
    world.connect_input(&edge, &reducer_op, 0, Access::ReadOnly);
    world.register_operator(reducer_op.clone()).unwrap();
    world.make_executable().unwrap();
    world.execute();

    reducer_op.set_argstream_size(0, &1, 1).unwrap();
    edge.send(1, 100);
    world.fence().unwrap();

    assert_eq!(*results.lock().unwrap(), vec![100]);
}

// Boundary: a key-map resolving to a rank outside `[0, world_size)` is a fatal topology error,
// not silently dropped or clamped.
#[test]
fn keymap_to_nonexistent_rank_is_a_topology_error() {
    let world = test_world(2, 1);
    let err = world.validate_rank("whatever", Rank(7)).unwrap_err();
    assert!(matches!(err, TtgError::Topology(ttg::TopologyError::KeymapOutOfRange { .. })));

    // A rank inside range is fine.
    world.validate_rank("whatever", Rank(1)).unwrap();

    // A single-rank key-map never produces an out-of-range rank for any world size.
    use ttg::KeyMap as _;
    let km = SingleRank(Rank(0));
    assert!(world.validate_rank("whatever", km.rank_of(&42_i32)).is_ok());
}
