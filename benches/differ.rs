//! Persistence differ benchmarks: full-record comparison against a baseline,
//! from an unchanged save up to a record that touches every group.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use charhub::config::TableConfig;
use charhub::servers::char::charstatus::{CharRecord, Friend, Hotkey, Point, Skill};
use charhub::servers::char::differ;

fn full_record(char_id: u32) -> CharRecord {
    let mut r = CharRecord::new(char_id, 2_000_000 + char_id);
    r.slot = 1;
    r.vitals.base_level = 99;
    r.vitals.job_level = 50;
    r.vitals.zeny = 1_000_000;
    r.vitals.hp = 8000;
    r.vitals.max_hp = 8000;
    r.vitals.last_point = Point { zone: 3, x: 150, y: 180 };
    r.profile.name = format!("bench{char_id}");
    r.profile.class = 4008;
    r.memo = (0..3).map(|i| Point { zone: i, x: 10 * i, y: 20 * i }).collect();
    r.skills = (1..=300).map(|id| Skill { id, lv: 10, flag: 0 }).collect();
    r.friends = (0..40)
        .map(|i| Friend { account_id: 3_000_000 + i, char_id: 150_000 + i, name: format!("friend{i}") })
        .collect();
    r.hotkeys = (0..38).map(|i| Hotkey { slot: i, kind: 0, id: 500 + i as u32, lv: 0 }).collect();
    r
}

fn bench_diff(c: &mut Criterion) {
    let tables = TableConfig::default();
    let base = full_record(150_000);

    let mut vitals_only = base.clone();
    vitals_only.vitals.zeny += 1;
    vitals_only.vitals.last_point.x += 1;

    let mut one_skill = base.clone();
    one_skill.skills[120].lv = 9;

    let mut everything = full_record(150_000);
    everything.vitals.base_exp = 123_456;
    everything.profile.hair = 7;
    everything.memo.pop();
    everything.skills.push(Skill { id: 400, lv: 1, flag: 0 });
    everything.friends.truncate(10);
    everything.hotkeys[0].id = 1;

    let cases = [
        ("unchanged", base.clone()),
        ("vitals", vitals_only),
        ("one_skill", one_skill),
        ("every_group", everything),
    ];

    let mut group = c.benchmark_group("differ::diff");
    for (name, new) in cases.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), new, |b, new| {
            b.iter(|| differ::diff(black_box(&tables), black_box(&base), black_box(new)))
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let rec = full_record(150_001);
    let packed = match rec.compress() {
        Ok(p) => p,
        Err(e) => panic!("compress failed: {e}"),
    };

    c.bench_function("charstatus::compress", |b| b.iter(|| black_box(&rec).compress()));
    c.bench_function("charstatus::decompress", |b| {
        b.iter(|| CharRecord::decompress(black_box(&packed)))
    });
}

criterion_group!(benches, bench_diff, bench_codec);
criterion_main!(benches);
