// Control-point overhead benchmarks
//
// Compares a counting loop run by the plain interpreter, by the interpreter
// with a meta-tracer that never gets hot, and with a compiled trace.
//
// cargo bench --bench control_point

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use metatrace::diag::{DiagSink, SharedBuffer};
use metatrace::interp::{assemble, locations_for, Program, Vm};
use metatrace::{LocationTag, MT};
use std::io;

fn counted_loop(n: i64) -> Program {
    let src = format!(
        r#"
func main locals 3
    const r0, {}
    const r1, 1
loop:
    cp 0
    add r2, r2, r0
    sub r0, r0, r1
    jnz r0, loop
    ret r2
end
"#,
        n
    );
    assemble(&src).unwrap()
}

fn quiet_mt(threshold: u32) -> MT {
    MT::builder()
        .hot_threshold(threshold)
        .synchronous_compile(true)
        .diag_sink(DiagSink::Buffer(SharedBuffer::new()))
        .build()
}

fn bench_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("counted_loop");

    for n in [100i64, 10_000] {
        let program = counted_loop(n);

        group.bench_with_input(BenchmarkId::new("interpreter", n), &program, |b, program| {
            let mut vm = Vm::new(program, Box::new(io::sink())).unwrap();
            b.iter(|| black_box(vm.run(None, &[], &[]).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("counting", n), &program, |b, program| {
            let mt = quiet_mt(u32::MAX);
            let locs = locations_for(&mt, program);
            let mut vm = Vm::new(program, Box::new(io::sink())).unwrap();
            b.iter(|| black_box(vm.run(Some(&mt), &locs, &[]).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("compiled", n), &program, |b, program| {
            let mt = quiet_mt(0);
            let locs = locations_for(&mt, program);
            let mut vm = Vm::new(program, Box::new(io::sink())).unwrap();
            vm.run(Some(&mt), &locs, &[]).unwrap();
            assert_eq!(locs[0].state().tag(), LocationTag::Compiled);
            b.iter(|| black_box(vm.run(Some(&mt), &locs, &[]).unwrap()))
        });
    }

    group.finish();
}

fn bench_warmup(c: &mut Criterion) {
    let program = counted_loop(1_000);
    c.bench_function("trace_and_compile", |b| {
        b.iter(|| {
            let mt = quiet_mt(0);
            let locs = locations_for(&mt, &program);
            let mut vm = Vm::new(&program, Box::new(io::sink())).unwrap();
            black_box(vm.run(Some(&mt), &locs, &[]).unwrap())
        })
    });
}

criterion_group!(benches, bench_loop, bench_warmup);
criterion_main!(benches);
