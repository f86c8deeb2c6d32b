//! Round-robin names for helpers

const NAMES: [&str; 24] = [
    "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota", "kappa",
    "lambda", "mu", "nu", "xi", "omicron", "pi", "rho", "sigma", "tau", "upsilon", "phi", "chi",
    "psi", "omega",
];

/// Hands out helper names from a fixed pool.
///
/// Wraparound never reuses a bare name: the second pass yields `alpha-2`,
/// the third `alpha-3`, and so on. Callers can still reject a candidate that
/// is already taken (for instance by a helper restored from a save).
#[derive(Debug, Default)]
pub struct Namer {
    issued: usize,
}

impl Namer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next name for which `taken` returns false
    pub fn next_name(&mut self, taken: impl Fn(&str) -> bool) -> String {
        loop {
            let candidate = Self::name_at(self.issued);
            self.issued += 1;
            if !taken(&candidate) {
                return candidate;
            }
        }
    }

    fn name_at(index: usize) -> String {
        let base = NAMES[index % NAMES.len()];
        match index / NAMES.len() {
            0 => base.to_string(),
            cycle => format!("{}-{}", base, cycle + 1),
        }
    }
}
