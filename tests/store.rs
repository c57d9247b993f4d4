extern crate easy_ad;

#[cfg(test)]
mod multi_context_tests {
    use easy_ad::elementals::{self, Elemental};
    use easy_ad::errors::TapeError;
    use easy_ad::store::{self, ContextId, TapeStore};
    use easy_ad::tape::Op;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    // f_k(x, y) = k * x * y + exp(x / k), each thread uses its own k
    fn evaluate(k: f64, x: f64, y: f64) -> Vec<f64> {
        let p = store::setup(&[x, y]).unwrap();
        let k = store::constant(k).unwrap();
        let product = store::cell(0.0).unwrap();
        store::arithmetic(Op::Mul, product, &[k, p[0]]).unwrap();
        store::arithmetic(Op::Mul, product, &[product, p[1]]).unwrap();
        let scaled = store::cell(0.0).unwrap();
        store::arithmetic(Op::Div, scaled, &[p[0], k]).unwrap();
        store::elemental(&elementals::EXP, scaled, &[scaled]).unwrap();
        let result = store::cell(0.0).unwrap();
        store::arithmetic(Op::Add, result, &[product, scaled]).unwrap();
        store::ret(result).unwrap();
        store::gradient().unwrap()
    }

    fn closed_form(k: f64, x: f64, y: f64) -> [f64; 2] {
        [k * y + (x / k).exp() / k, k * x]
    }

    #[test]
    fn test_contexts_only_see_their_own_records() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        store::enable_multi_context();
        assert!(store::is_multi_context());
        std::thread::scope(|scope| {
            for thread in 1..=8_u64 {
                scope.spawn(move || {
                    let k = thread as f64;
                    let mut random_generator = ChaCha8Rng::seed_from_u64(thread);
                    for _ in 0..500 {
                        let x = random_generator.random_range(-1.0..1.0);
                        let y = random_generator.random_range(-1.0..1.0);
                        let gradient = evaluate(k, x, y);
                        let expected = closed_form(k, x, y);
                        assert!((gradient[0] - expected[0]).abs() < 1e-9);
                        assert!((gradient[1] - expected[1]).abs() < 1e-9);
                    }
                    assert!(store::drop_tape());
                    assert!(!store::drop_tape());
                });
            }
        });
    }

    #[test]
    fn test_explicit_store_with_task_contexts() {
        let tapes = TapeStore::new();
        let contexts: Vec<ContextId> = (0..4).map(|_| ContextId::fresh()).collect();
        // interleave two evaluations per context on the same thread
        for (i, &context) in contexts.iter().enumerate() {
            tapes
                .with(context, |tape| {
                    let x = tape.setup(&[i as f64])?[0];
                    let y = tape.cell(0.0)?;
                    tape.arithmetic(Op::Mul, y, &[x, x])?;
                    tape.ret(y).map(|_| ())
                })
                .unwrap();
        }
        for (i, &context) in contexts.iter().enumerate() {
            let gradient = tapes.with(context, |tape| tape.gradient()).unwrap();
            assert_eq!(gradient, vec![2.0 * i as f64]);
        }
        for context in contexts {
            assert!(tapes.drop_context(context));
        }
        assert!(tapes.is_empty());
    }

    #[inline(never)]
    fn identity(x: &[f64]) -> f64 {
        x[0]
    }

    fn d_failing(_value: f64, _x: &[f64], _partials: &mut [f64]) {
        panic!("derivative rule failed");
    }

    const FAILING: Elemental = Elemental::new("multi_context_tests::failing", 1, identity);

    #[test]
    fn test_a_panicking_derivative_does_not_leave_a_half_replayed_tape() {
        elementals::register_elemental(&FAILING, d_failing).unwrap();
        let tapes = TapeStore::new();
        let context = ContextId::fresh();
        tapes
            .with(context, |tape| {
                let x = tape.setup(&[2.0])?[0];
                let y = tape.cell(0.0)?;
                tape.elemental(&FAILING, y, &[x])?;
                tape.ret(y).map(|_| ())
            })
            .unwrap();
        let replay = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tapes.with(context, |tape| tape.gradient())
        }));
        assert!(replay.is_err());

        // the interrupted frame is discarded rather than differentiated a second time
        assert_eq!(tapes.with(context, |tape| tape.depth()), 0);
        assert_eq!(
            tapes.with(context, |tape| tape.gradient()),
            Err(TapeError::FrameStackUnderflow)
        );
        let gradient = tapes.with(context, |tape| {
            let x = tape.setup(&[3.0])?[0];
            let y = tape.cell(0.0)?;
            tape.arithmetic(Op::Mul, y, &[x, x])?;
            tape.ret(y)?;
            tape.gradient()
        });
        assert_eq!(gradient, Ok(vec![6.0]));
    }
}
