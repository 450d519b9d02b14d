//! Kernel hot-path throughput benchmark.
//!
//! Measures priority queue enqueue/dequeue, event bus emission with and
//! without subscribers, and end-to-end scheduler round trips using Criterion.

use agentos_kernel::events::{EventBus, EventFilter, EventType};
use agentos_kernel::kernel::{Prioritized, PriorityQueue, Scheduler, SchedulerConfig, TaskPriority};
use agentos_kernel::types::TaskId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

struct Item {
    id: TaskId,
    priority: TaskPriority,
}

impl Prioritized for Item {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }
}

fn bench_queue(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 256, 4096];

    let mut group = c.benchmark_group("priority_queue");
    for &size in sizes {
        let items: Vec<(TaskId, TaskPriority)> = (0..size)
            .map(|i| (TaskId::new(), TaskPriority::ALL[i % 4]))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| {
                let mut queue = PriorityQueue::new();
                for (id, priority) in items {
                    queue.enqueue(Item {
                        id: id.clone(),
                        priority: *priority,
                    });
                }
                while let Some(item) = queue.dequeue() {
                    black_box(item.id);
                }
            });
        });
    }
    group.finish();
}

fn bench_event_bus(c: &mut Criterion) {
    let payload = serde_json::json!({ "task_id": "bench", "priority": "normal" });

    c.bench_function("emit_no_subscribers", |b| {
        let bus = EventBus::default();
        b.iter(|| bus.emit(EventType::TaskScheduled, "bench", black_box(payload.clone())));
    });

    c.bench_function("emit_filtered_subscriber", |b| {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::of_types([EventType::TaskScheduled]));
        b.iter(|| {
            bus.emit(EventType::TaskScheduled, "bench", black_box(payload.clone()));
            sub.try_recv()
        });
    });
}

fn bench_scheduler_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let scheduler = rt.block_on(async {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.start().unwrap();
        scheduler
    });

    c.bench_function("schedule_and_wait", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handle = scheduler
                    .schedule(
                        async { Ok(serde_json::Value::Null) },
                        TaskPriority::Normal,
                        None,
                    )
                    .unwrap();
                scheduler.wait_for(&handle.id, None).await.unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_queue, bench_event_bus, bench_scheduler_round_trip);
criterion_main!(benches);
