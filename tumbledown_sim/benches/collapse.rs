// Collapse benchmarks.
//
// Builds a planar frame (grounded columns tied by a beam per bay at every
// storey), then measures:
// - `validate`: one full validation pass (ground distance + load propagation)
//   over the intact frame.
// - `batter`: a seeded run of random voxel hits, including every split,
//   extraction and debris expiry it triggers.
// - `snapshot`: bincode encode + decode of a battered structure, the cost a
//   host pays to checkpoint mid-collapse.
//
// Run with `cargo bench -p tumbledown_sim`.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use tumbledown_sim::builder::MemberSpec;
use tumbledown_sim::command::{SimAction, SimCommand};
use tumbledown_sim::prng::SimRng;
use tumbledown_sim::structure::Structure;
use tumbledown_sim::types::*;

fn frame(seed: u64, bays: usize, storeys: usize) -> (Structure, GroupId) {
    let mut s = Structure::new(seed);
    let g = s.add_group([0.0; 3]);
    let joints: Vec<Vec<ConnectionId>> = (0..=bays)
        .map(|x| {
            (0..=storeys)
                .map(|y| {
                    s.add_connection(g, [x as f32 * 4.0, y as f32 * 4.0, 0.0])
                        .unwrap()
                })
                .collect()
        })
        .collect();
    for x in 0..=bays {
        for y in 0..storeys {
            let mut spec = MemberSpec::new(joints[x][y], Slot::Top, joints[x][y + 1], 8);
            if y == 0 {
                spec = spec.grounded();
            }
            s.add_member(g, spec).unwrap();
        }
    }
    for y in 1..=storeys {
        for x in 0..bays {
            s.add_member(g, MemberSpec::new(joints[x][y], Slot::Right, joints[x + 1][y], 8))
                .unwrap();
        }
    }
    s.initialize_group(g).unwrap();
    (s, g)
}

fn batter(s: &mut Structure, seed: u64, ticks: u64) {
    let mut aim = SimRng::new(seed);
    let start = s.tick;
    for tick in start + 1..=start + ticks {
        let targets: Vec<VoxelId> = s
            .voxels
            .values()
            .filter(|v| v.member.is_some())
            .map(|v| v.id)
            .collect();
        let commands: Vec<SimCommand> = aim
            .pick_index(targets.len())
            .map(|i| SimCommand {
                tick,
                action: SimAction::DamageVoxel {
                    voxel: targets[i],
                    amount: 60.0,
                },
            })
            .into_iter()
            .collect();
        s.step(&commands, tick);
    }
}

fn bench_collapse(c: &mut Criterion) {
    let mut group = c.benchmark_group("collapse");

    group.bench_function("validate", |b| {
        b.iter_batched(
            || frame(1, 12, 12),
            |(mut s, g)| {
                s.step(
                    &[SimCommand {
                        tick: 1,
                        action: SimAction::ValidateGroup { group: g },
                    }],
                    1,
                );
                black_box(s)
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("batter", |b| {
        b.iter_batched(
            || frame(2, 8, 8),
            |(mut s, _)| {
                batter(&mut s, 7, 300);
                black_box(s)
            },
            BatchSize::SmallInput,
        );
    });

    let (mut battered, _) = frame(3, 8, 8);
    batter(&mut battered, 11, 150);
    let bytes = bincode::serialize(&battered).unwrap();
    eprintln!("battered 8x8 frame snapshot: {} bytes", bytes.len());
    group.bench_function("snapshot", |b| {
        b.iter(|| {
            let bytes = bincode::serialize(black_box(&battered)).unwrap();
            let restored: Structure = bincode::deserialize(&bytes).unwrap();
            black_box(restored)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_collapse);
criterion_main!(benches);
