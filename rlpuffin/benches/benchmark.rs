use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rlpuffin::buffer::Transition;
use rlpuffin::cancel::CancelToken;
use rlpuffin::config::RlConfig;
use rlpuffin::feedback::StateVector;
use rlpuffin::policy::ActorCritic;
use rlpuffin::ppo::{PpoTrainer, TrainerContext};

fn state(i: usize) -> StateVector {
    let x = i as f64;
    StateVector::from_array([(x * 0.1) % 1.0, 0.3, (x * 0.7).sin().abs(), 0.2, 0.6])
}

fn benchmark_policy(c: &mut Criterion) {
    let config = RlConfig::default();
    let policy = ActorCritic::new(&config.hidden_layers, 0);
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("policy");

    group.bench_function("act", |b| b.iter(|| policy.act(&state(3), &mut rng, false)));
    group.bench_function("value", |b| b.iter(|| policy.value(&state(3))));

    group.finish()
}

fn benchmark_update(c: &mut Criterion) {
    let config = RlConfig {
        buffer_capacity: 256,
        epochs: 4,
        ..RlConfig::default()
    };
    let trainer = PpoTrainer::new(&config);
    let policy = ActorCritic::new(&config.hidden_layers, 0);
    let mut rng = StdRng::seed_from_u64(1);
    let batch: Vec<Transition> = (0..config.buffer_capacity)
        .map(|i| {
            let state = state(i);
            let decision = policy.act(&state, &mut rng, false);
            Transition {
                state,
                action: decision.action,
                reward: (i % 7) as f64,
                log_prob: decision.log_prob,
                value_estimate: decision.value,
                done: i % 64 == 63,
            }
        })
        .collect();
    let cancel = CancelToken::new();

    let mut group = c.benchmark_group("ppo");
    group.sample_size(20);
    group.bench_function("update 256 transitions", |b| {
        b.iter(|| {
            let mut policy = policy.clone();
            let mut ctx = TrainerContext::new(&policy, config.learning_rate, 2);
            trainer.update(&mut policy, &mut ctx, &batch, 0.0, &cancel)
        })
    });
    group.finish()
}

criterion_group!(benches, benchmark_policy, benchmark_update);
criterion_main!(benches);
