use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadChoice {
    /// No count requested; every detected core is used.
    AllCores(usize),
    AsRequested(usize),
    /// The request exceeded the detected cores and was lowered.
    Clamped { requested: usize, effective: usize },
}

impl ThreadChoice {
    pub fn count(self) -> usize {
        match self {
            ThreadChoice::AllCores(n) | ThreadChoice::AsRequested(n) => n,
            ThreadChoice::Clamped { effective, .. } => effective,
        }
    }
}

impl fmt::Display for ThreadChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadChoice::AllCores(n) => {
                write!(f, "no thread count specified, using all {n} detected cores")
            }
            ThreadChoice::AsRequested(n) => write!(f, "using {n} threads as requested"),
            ThreadChoice::Clamped {
                requested,
                effective,
            } => write!(
                f,
                "requested {requested} threads but only {effective} cores are available, using {effective}"
            ),
        }
    }
}

/// Resolves `requested` (0 meaning unspecified) against `detected` cores.
///
/// Never fails: oversized requests are clamped. A `detected` of zero is
/// treated as one core so the result is always positive.
pub fn resolve(requested: usize, detected: usize) -> ThreadChoice {
    let detected = detected.max(1);
    match requested {
        0 => ThreadChoice::AllCores(detected),
        n if n <= detected => ThreadChoice::AsRequested(n),
        n => ThreadChoice::Clamped {
            requested: n,
            effective: detected,
        },
    }
}

pub fn detected_cores() -> usize {
    num_cpus::get().max(1)
}
