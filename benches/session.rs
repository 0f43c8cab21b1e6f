use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use duotune::circuit::{CircuitBuilder, CompiledCircuit, PartyId, PrivateInput};
use duotune::session;

/// 8-bit `compare(a, b)`: 29 AND gates, so 29 oblivious transfers per run.
fn compare_circuit() -> Arc<CompiledCircuit> {
    let width = 8;
    let mut builder = CircuitBuilder::new();
    let a = builder.input("alice", "a", width);
    let b = builder.input("bob", "b", width);
    let mut equal = None;
    let mut less = None;
    for i in (0..width).rev() {
        let diff = builder.xor(a[i], b[i]);
        let bit_equal = builder.not(diff);
        let not_a = builder.not(a[i]);
        let a_below_b = builder.and(not_a, b[i]);
        match (equal, less) {
            (None, None) => {
                equal = Some(bit_equal);
                less = Some(a_below_b);
            }
            (Some(eq), Some(lt)) => {
                let first_difference = builder.and(eq, a_below_b);
                less = Some(builder.or(lt, first_difference));
                equal = Some(builder.and(eq, bit_equal));
            }
            _ => unreachable!(),
        }
    }
    builder.output("equal", vec![equal.unwrap()]);
    builder.output("less", vec![less.unwrap()]);
    Arc::new(builder.finish().unwrap())
}

fn bench_compare_session(c: &mut Criterion) {
    let circuit = compare_circuit();
    let inputs = [
        (PartyId::from("alice"), PrivateInput::from([("a", 10)])),
        (PartyId::from("bob"), PrivateInput::from([("b", 42)])),
    ];
    c.bench_function("compare_8bit_two_party_session", |b| {
        b.iter(|| session::simulate(&circuit, &inputs).unwrap())
    });
}

criterion_group!(benches, bench_compare_session);
criterion_main!(benches);
