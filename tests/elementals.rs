extern crate easy_ad;

#[cfg(test)]
mod registry_tests {
    use easy_ad::elementals::{self, Elemental};
    use easy_ad::errors::TapeError;
    use easy_ad::tape::Tape;

    // softplus(x) = ln(1 + e^x)
    #[inline(never)]
    fn softplus(x: &[f64]) -> f64 {
        x[0].exp().ln_1p()
    }

    // d softplus(x) / dx = logistic(x)
    fn d_softplus(_value: f64, x: &[f64], partials: &mut [f64]) {
        partials[0] = 1.0 / (1.0 + (-x[0]).exp());
    }

    const SOFTPLUS: Elemental = Elemental::new("registry_tests::softplus", 1, softplus);

    // f(x, y, z) = x * y + z
    #[inline(never)]
    fn fused(x: &[f64]) -> f64 {
        x[0] * x[1] + x[2]
    }

    fn d_fused(_value: f64, x: &[f64], partials: &mut [f64]) {
        partials[0] = x[1];
        partials[1] = x[0];
        partials[2] = 1.0;
    }

    const FUSED: Elemental = Elemental::new("registry_tests::fused", 3, fused);

    #[test]
    fn test_registered_elementals_are_differentiated() {
        assert!(!elementals::is_registered(&SOFTPLUS));
        let mut tape = Tape::new();
        let x = tape.setup(&[0.0]).unwrap()[0];
        let y = tape.cell(0.0).unwrap();
        assert_eq!(
            tape.elemental(&SOFTPLUS, y, &[x]),
            Err(TapeError::UnregisteredElemental {
                name: "registry_tests::softplus"
            })
        );
        tape.abandon().unwrap();

        elementals::register_elemental(&SOFTPLUS, d_softplus).unwrap();
        let x = tape.setup(&[0.0]).unwrap()[0];
        let y = tape.cell(0.0).unwrap();
        tape.elemental(&SOFTPLUS, y, &[x]).unwrap();
        assert!((tape.ret(y).unwrap() - 2.0_f64.ln()).abs() < 1e-15);
        assert_eq!(tape.gradient(), Ok(vec![0.5]));
    }

    #[test]
    fn test_elementals_of_several_arguments() {
        elementals::register_elemental(&FUSED, d_fused).unwrap();
        let mut tape = Tape::new();
        let p = tape.setup(&[2.0, 3.0]).unwrap();
        let r = tape.cell(0.0).unwrap();
        // x * x + y with x passed twice
        tape.elemental(&FUSED, r, &[p[0], p[0], p[1]]).unwrap();
        assert_eq!(tape.ret(r), Ok(7.0));
        assert_eq!(tape.gradient(), Ok(vec![4.0, 1.0]));
    }

    #[test]
    fn test_lookups_from_many_threads_agree() {
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let rule = elementals::lookup(&elementals::LOGISTIC).unwrap();
                        let mut partials = [0.0];
                        rule(0.5, &[0.0], &mut partials);
                        assert_eq!(partials, [0.25]);
                    }
                });
            }
        });
    }
}
